//! Engine Facade: the single public entry point. Composes the Store, Event
//! Bus, Plugin Manager, Renderer Switchboard, Audio Output, decode
//! pipelines, Sync Scheduler, Fallback Transcoder, and Playlist Coordinator
//! into the imperative verbs a host calls, wrapping each in Lifecycle hooks
//! and state/event emission — a top-level orchestrator in the shape of a
//! single desktop app's main runtime, generalized onto a host-driven
//! pipeline instead of one fixed window.
//!
//! The Compositor is deliberately absent here: it runs as an independent
//! engine with its own source pool, not a Pipeline participant.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::audio_output::AudioOutput;
use crate::config::{EngineConfig, PreloadMode};
use crate::decode::{
    DecodeQueue, DecodeWorker, Decoder, DecodedUnit, Demuxer, AUDIO_QUEUE_CAPACITY, VIDEO_QUEUE_CAPACITY,
};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::event_bus::{EngineEvent, EventBus, TrackChangeKind};
use crate::model::{
    Frame, MediaSource, Playlist, PlayerState, PlayerStateData, PlaylistItem, PlaylistMode, Rotation, TrackDescriptor,
    TrackId,
};
use crate::plugin::{HookOutcome, LifecycleStage, Plugin, PluginManager};
use crate::playlist::{PlaylistCoordinator, SwitchOutcome};
use crate::renderer::{
    effective_display_size, encode_surface, FitMode, Presenter, RendererSwitchboard, RendererType, ScreenshotFormat,
    SoftwareBackend,
};
use crate::scheduler::{SyncScheduler, TickOutcome};
use crate::store::{StatePatch, Store};
use crate::transcoder::{FallbackTranscoder, TranscodeFn};

/// Builds a [`Demuxer`] for a given source. Demuxing itself is out of scope
/// for this crate; the host supplies the concrete
/// container implementation through this seam.
pub type DemuxerFactory = dyn Fn(&MediaSource) -> EngineResult<Box<dyn Demuxer>> + Send + Sync;

/// Builds a [`Decoder`] for a selected track.
pub type DecoderFactory = dyn Fn(&TrackDescriptor) -> EngineResult<Box<dyn Decoder>> + Send + Sync;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub autoplay: bool,
    pub start_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SeekOptions {
    pub precise: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ScreenshotOptions {
    pub format: ScreenshotFormat,
    pub quality: f32,
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self { format: ScreenshotFormat::Png, quality: 0.92 }
    }
}

struct TrackPipeline {
    worker: DecodeWorker,
    queue: DecodeQueue,
}

/// Always-available no-op presenter used while no host surface is attached
/// (`setRenderTarget(null)`).
struct NullPresenter;

impl Presenter for NullPresenter {
    fn supports(&self, renderer_type: RendererType) -> bool {
        renderer_type == RendererType::Software
    }
    fn present(&mut self, _frame: &Frame, _rotation: Rotation, _fit: FitMode) -> Result<(), String> {
        Ok(())
    }
    fn resize(&mut self, _width: u32, _height: u32) {}
}

/// The single public entry point. One `Engine` owns one
/// playback session; `dispose` tears down decoders/renderer but leaves it
/// reusable for a subsequent `load`, `destroy` additionally retires plugins
/// and listeners and marks the instance permanently unusable.
pub struct Engine {
    store: Arc<Store>,
    event_bus: Arc<EventBus>,
    plugins: Arc<PluginManager>,
    playlist: Arc<PlaylistCoordinator>,
    transcoder: Arc<FallbackTranscoder>,
    renderer: Mutex<RendererSwitchboard>,
    screenshot_backend: Mutex<SoftwareBackend>,
    audio: Mutex<AudioOutput>,
    scheduler: Mutex<SyncScheduler>,
    demuxer_factory: Arc<DemuxerFactory>,
    decoder_factory: Arc<DecoderFactory>,
    demuxer: Mutex<Option<Box<dyn Demuxer>>>,
    video_pipeline: Mutex<Option<TrackPipeline>>,
    audio_pipeline: Mutex<Option<TrackPipeline>>,
    prefetched: Mutex<Option<(usize, Box<dyn Demuxer>)>>,
    anchor: Mutex<Option<(std::time::Instant, f64)>>,
    surface_size: Mutex<(u32, u32)>,
    generation: AtomicU64,
    disposed: AtomicBool,
    destroyed: AtomicBool,
    /// `preload`/`crossOrigin` from construction: carried for
    /// host inspection and for plugins/hosts that gate their own fetch
    /// behavior on them. Neither changes this crate's own demux/decode
    /// behavior, since concrete source fetching is out of scope (§1).
    preload: PreloadMode,
    cross_origin: Option<String>,
    default_autoplay: bool,
}

impl Engine {
    pub fn new(
        presenter: Box<dyn Presenter>,
        demuxer_factory: Arc<DemuxerFactory>,
        decoder_factory: Arc<DecoderFactory>,
    ) -> Arc<Self> {
        Self::with_config(presenter, demuxer_factory, decoder_factory, EngineConfig::default())
    }

    /// Builds an `Engine` honoring the construction-time option table.
    /// `config` is clamped via
    /// [`crate::config::sanitize_config`] before any field is applied.
    pub fn with_config(
        presenter: Box<dyn Presenter>,
        demuxer_factory: Arc<DemuxerFactory>,
        decoder_factory: Arc<DecoderFactory>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let config = crate::config::sanitize_config(config);
        let store = Store::new();
        let event_bus = EventBus::new();
        let plugins = PluginManager::new();
        plugins.attach_context(&store, &event_bus);
        store.attach_plugins(Arc::clone(&plugins));
        let playlist = Arc::new(PlaylistCoordinator::new(Arc::clone(&event_bus)));
        let renderer = RendererSwitchboard::negotiate_preferring(presenter, config.preferred_renderer);
        let renderer_type = renderer.renderer_type();

        let audio = AudioOutput::new();
        audio.set_volume(config.volume);
        audio.set_muted(config.muted);
        audio.set_playback_rate(config.playback_rate, 0.0);

        let bridge_bus = Arc::clone(&event_bus);
        // Lives for the engine's whole lifetime; there is no host-facing
        // handle to give back, so the `Subscription` is simply never
        // unsubscribed. Store state changes always
        // mirror onto the Event Bus as `statechange`).
        let _state_bridge = store.subscribe(move |state| {
            bridge_bus.emit(EngineEvent::StateChange(state.clone()));
        });

        store.set_state(
            StatePatch::default()
                .renderer_type(renderer_type)
                .volume(config.volume)
                .muted(config.muted)
                .playback_rate(config.playback_rate),
        );

        Arc::new(Self {
            store,
            event_bus,
            plugins,
            playlist,
            transcoder: Arc::new(FallbackTranscoder::with_max_cache_size(config.max_cache_size)),
            renderer: Mutex::new(renderer),
            screenshot_backend: Mutex::new(SoftwareBackend::new()),
            audio: Mutex::new(audio),
            scheduler: Mutex::new(SyncScheduler::new()),
            demuxer_factory,
            decoder_factory,
            demuxer: Mutex::new(None),
            video_pipeline: Mutex::new(None),
            audio_pipeline: Mutex::new(None),
            prefetched: Mutex::new(None),
            anchor: Mutex::new(None),
            surface_size: Mutex::new((1920, 1080)),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            preload: config.preload,
            cross_origin: config.cross_origin,
            default_autoplay: config.autoplay,
        })
    }

    pub fn preload(&self) -> PreloadMode {
        self.preload
    }

    pub fn cross_origin(&self) -> Option<&str> {
        self.cross_origin.as_deref()
    }

    fn ensure_usable(&self) -> EngineResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(EngineError::invalid_state("engine instance has been destroyed"));
        }
        Ok(())
    }

    /// Runs `before`, bails out with `OperationAborted` if a plugin cancels,
    /// otherwise runs `body` and always runs `after` plus error reporting.
    fn with_lifecycle<T>(
        &self,
        before: LifecycleStage,
        after: LifecycleStage,
        mut args: Value,
        body: impl FnOnce(&Value) -> EngineResult<T>,
    ) -> EngineResult<T> {
        if self.plugins.before_lifecycle(before, &mut args) == HookOutcome::Cancel {
            return self.report_error(Err(EngineError::aborted(format!(
                "{} cancelled by a plugin",
                before.name()
            ))));
        }
        let result = body(&args);
        self.plugins.after_lifecycle(after);
        self.report_error(result)
    }

    fn report_error<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        if let Err(err) = &result {
            self.plugins.on_error(err);
            self.event_bus.emit(EngineEvent::Error(err.clone()));
        }
        result
    }

    fn mark_anchor(&self, media_time: f64) {
        *self.anchor.lock().unwrap() = Some((std::time::Instant::now(), media_time));
    }

    fn clear_anchor(&self) {
        *self.anchor.lock().unwrap() = None;
    }

    /// The current media time: extrapolated from the last play/seek/rate
    /// anchor while Playing, or the Store's last known value otherwise.
    fn current_media_time(&self) -> f64 {
        let anchor = *self.anchor.lock().unwrap();
        match anchor {
            Some((instant, media_time)) => {
                let rate = self.store.get_state().playback_rate as f64;
                media_time + instant.elapsed().as_secs_f64() * rate
            }
            None => self.store.get_state().current_time,
        }
    }

    // --- Pipeline construction -------------------------------------------

    /// Runs the registered fallback transcoder over `source` when
    /// `descriptor` isn't natively decodable, returning a demuxer opened
    /// against the converted bytes. Only in-memory (`Bytes`) sources can be
    /// re-demuxed this way; `Url`/`Reader`/`Handle` sources report
    /// `MediaNotSupported` instead of attempting a full-source download.
    fn ensure_decodable(
        &self,
        kind: TrackChangeKind,
        source: &MediaSource,
        descriptor: &TrackDescriptor,
    ) -> EngineResult<Option<Box<dyn Demuxer>>> {
        if descriptor.decodable {
            return Ok(None);
        }
        let MediaSource::Bytes(bytes) = source else {
            return Err(EngineError::new(
                ErrorKind::MediaNotSupported,
                "fallback transcoding is only supported for in-memory sources",
            ));
        };
        let identity = source.identity();
        self.event_bus.emit(EngineEvent::ConversionStart {
            kind,
            track_id: descriptor.id.clone(),
            reason: "track is not natively decodable".to_string(),
        });
        let bus = Arc::clone(&self.event_bus);
        let track_id = descriptor.id.clone();
        let converted = self.transcoder.convert(kind, &identity, &descriptor.id, bytes.as_ref(), |progress, stage| {
            bus.emit(EngineEvent::ConversionProgress {
                kind,
                track_id: track_id.clone(),
                progress,
                stage: stage.to_string(),
            });
        })?;
        self.event_bus.emit(EngineEvent::ConversionComplete { duration: None });
        let converted_source = MediaSource::Bytes(converted);
        let demuxer = (self.demuxer_factory)(&converted_source)?;
        Ok(Some(demuxer))
    }

    /// Spawns the decode pipeline for `descriptor`, routing through the
    /// fallback transcoder first if needed. Returns `Ok(None)` when
    /// conversion failed for a track that can simply be disabled, so
    /// playback continues with that track disabled; a mandatory video
    /// track with no alternative instead
    /// propagates the error and fails the whole load.
    fn spawn_pipeline(
        &self,
        demuxer: &mut dyn Demuxer,
        descriptor: &TrackDescriptor,
        source: &MediaSource,
        kind: TrackChangeKind,
    ) -> EngineResult<Option<(TrackPipeline, bool)>> {
        let mut fallback_demuxer = match self.ensure_decodable(kind, source, descriptor) {
            Ok(result) => result,
            Err(err) => {
                self.event_bus.emit(EngineEvent::ConversionError { error: err.clone() });
                if kind == TrackChangeKind::Video {
                    return Err(err);
                }
                return Ok(None);
            }
        };
        let converted = fallback_demuxer.is_some();
        let active: &mut dyn Demuxer = match fallback_demuxer.as_deref_mut() {
            Some(d) => d,
            None => demuxer,
        };
        let packet_source = active
            .open_packet_source(&descriptor.id.0)
            .ok_or_else(|| EngineError::track_not_found(&descriptor.id))?;
        let decoder = (self.decoder_factory)(descriptor)?;
        let capacity = if descriptor.is_video() { VIDEO_QUEUE_CAPACITY } else { AUDIO_QUEUE_CAPACITY };
        let (worker, queue) = DecodeWorker::spawn(packet_source, decoder, capacity);
        Ok(Some((TrackPipeline { worker, queue }, converted)))
    }

    /// Restarts the pipeline for an already-selected, natively-decodable
    /// track at a new packet-source position; used by `seek` and track
    /// selection. Converted (fallback-transcoded) tracks require a fresh
    /// `load` to re-seek, since their packet source lives behind a one-shot
    /// conversion rather than the original demuxer (documented in
    /// `DESIGN.md`). Returns the keyframe PTS the source actually landed on
    /// when `seek_target` is given, so the caller can tell a keyframe seek
    /// (present from that PTS) from a precise one (decode-and-drop to the
    /// requested target).
    fn restart_pipeline_at(
        &self,
        descriptor: &TrackDescriptor,
        seek_target: Option<f64>,
    ) -> EngineResult<(TrackPipeline, Option<f64>)> {
        if !descriptor.decodable {
            return Err(EngineError::new(
                ErrorKind::MediaNotSupported,
                "seeking or switching within a transcoder-converted track requires a fresh load",
            ));
        }
        let mut demuxer_guard = self.demuxer.lock().unwrap();
        let demuxer = demuxer_guard.as_deref_mut().ok_or_else(|| EngineError::invalid_state("no media loaded"))?;
        let mut source = demuxer
            .open_packet_source(&descriptor.id.0)
            .ok_or_else(|| EngineError::track_not_found(&descriptor.id))?;
        let keyframe_pts = seek_target.and_then(|target| source.seek(target));
        let decoder = (self.decoder_factory)(descriptor)?;
        let capacity = if descriptor.is_video() { VIDEO_QUEUE_CAPACITY } else { AUDIO_QUEUE_CAPACITY };
        let (worker, queue) = DecodeWorker::spawn(source, decoder, capacity);
        Ok((TrackPipeline { worker, queue }, keyframe_pts))
    }

    fn teardown_pipelines(&self) {
        if let Some(mut pipeline) = self.video_pipeline.lock().unwrap().take() {
            pipeline.worker.abort();
        }
        if let Some(mut pipeline) = self.audio_pipeline.lock().unwrap().take() {
            pipeline.worker.abort();
        }
        *self.demuxer.lock().unwrap() = None;
        *self.prefetched.lock().unwrap() = None;
        *self.scheduler.lock().unwrap() = SyncScheduler::new();
        self.audio.lock().unwrap().pause(0.0);
        self.clear_anchor();
    }

    // --- load / loadPlaylist ----------------------------------------------

    fn load_from_source(
        &self,
        source: &MediaSource,
        options: LoadOptions,
        prebuilt: Option<Box<dyn Demuxer>>,
    ) -> EngineResult<()> {
        self.teardown_pipelines();
        self.transcoder.clear_cache();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.disposed.store(false, Ordering::SeqCst);
        self.event_bus.emit(EngineEvent::LoadStart);
        self.store.set_state(StatePatch::default().state(PlayerState::Loading));

        let mut demuxer = match prebuilt {
            Some(d) => d,
            None => (self.demuxer_factory)(source)?,
        };
        let media_info = demuxer.media_info();
        let descriptors = demuxer.track_descriptors();

        let mut video_tracks: Vec<TrackDescriptor> = descriptors.iter().filter(|t| t.is_video()).cloned().collect();
        let mut audio_tracks: Vec<TrackDescriptor> = descriptors.iter().filter(|t| t.is_audio()).cloned().collect();
        let subtitle_tracks: Vec<TrackDescriptor> = descriptors.iter().filter(|t| t.is_subtitle()).cloned().collect();

        let mut selected_video = None;
        if let Some(first) = video_tracks.first_mut() {
            // A mandatory video track has no alternative to fall back to, so
            // `spawn_pipeline` escalates instead of returning `Ok(None)` here.
            let (pipeline, converted) = self
                .spawn_pipeline(demuxer.as_mut(), first, source, TrackChangeKind::Video)?
                .expect("video track conversion failure escalates rather than disables");
            *self.video_pipeline.lock().unwrap() = Some(pipeline);
            first.selected = true;
            first.converted = converted;
            selected_video = Some(first.id.clone());
        }
        let mut selected_audio = None;
        if let Some(first) = audio_tracks.first_mut() {
            match self.spawn_pipeline(demuxer.as_mut(), first, source, TrackChangeKind::Audio)? {
                Some((pipeline, converted)) => {
                    *self.audio_pipeline.lock().unwrap() = Some(pipeline);
                    first.selected = true;
                    first.converted = converted;
                    selected_audio = Some(first.id.clone());
                }
                None => first.decodable = false,
            }
        }

        *self.demuxer.lock().unwrap() = Some(demuxer);

        if selected_audio.is_some() {
            if let Err(err) = self.audio.lock().unwrap().start() {
                log::warn!("failed to start audio output device: {err}");
            }
        }

        let start_time = options.start_time.unwrap_or(0.0).max(0.0);
        self.store.set_state(
            StatePatch::default()
                .state(PlayerState::Ready)
                .media_info(Some(media_info.clone()))
                .duration(media_info.duration)
                .is_live(media_info.is_live())
                .video_tracks(video_tracks)
                .audio_tracks(audio_tracks)
                .subtitle_tracks(subtitle_tracks)
                .selected_video_track(selected_video)
                .selected_audio_track(selected_audio)
                .can_play(true)
                .can_play_through(true)
                .current_time(start_time),
        );
        self.event_bus.emit(EngineEvent::DurationChange { duration: media_info.duration });
        self.event_bus.emit(EngineEvent::LoadedMetadata(media_info));
        self.event_bus.emit(EngineEvent::LoadedData);
        self.event_bus.emit(EngineEvent::CanPlay);
        self.event_bus.emit(EngineEvent::CanPlayThrough);
        self.event_bus.emit(EngineEvent::Ready);

        if options.autoplay {
            self.play()?;
        }
        Ok(())
    }

    pub fn load(&self, source: MediaSource, options: LoadOptions) -> EngineResult<()> {
        self.ensure_usable()?;
        let options = LoadOptions { autoplay: options.autoplay || self.default_autoplay, ..options };
        let args = json!({ "autoplay": options.autoplay });
        self.with_lifecycle(LifecycleStage::BeforeLoad, LifecycleStage::AfterLoad, args, |_| {
            self.load_from_source(&source, options, None)
        })
    }

    pub fn load_playlist(&self, items: Vec<PlaylistItem>, start_index: usize, mode: PlaylistMode) -> EngineResult<()> {
        self.ensure_usable()?;
        let autoplay = self.default_autoplay;
        let result = self.playlist.load_playlist(items, start_index, mode).and_then(|outcome| {
            self.sync_playlist_state();
            self.switch_playlist_item(outcome, autoplay)
        });
        self.report_error(result)
    }

    /// Mirrors the Playlist Coordinator's list/mode/current-index onto the
    /// Store, so hosts observing `getState().playlist` see every mutation:
    /// `PlayerStateData` carries `playlist`/`currentPlaylistIndex`/
    /// `playlistMode` directly, not just through `playlistchange` events.
    fn sync_playlist_state(&self) {
        self.store.set_state(
            StatePatch::default()
                .playlist(Playlist { items: self.playlist.summaries() })
                .playlist_mode(self.playlist.mode())
                .current_playlist_index(self.playlist.current_index()),
        );
    }

    /// Adds `item` to the playlist.
    pub fn add_to_playlist(&self, item: PlaylistItem, insert_index: Option<usize>) -> EngineResult<usize> {
        self.ensure_usable()?;
        let index = self.playlist.add(item, insert_index);
        self.sync_playlist_state();
        Ok(index)
    }

    /// Removes the item at `index`. Only reloads media when the removed
    /// item was the one currently playing; otherwise this is pure index
    /// bookkeeping.
    pub fn remove_from_playlist(&self, index: usize) -> EngineResult<()> {
        self.ensure_usable()?;
        let was_current = self.playlist.current_index() == Some(index);
        let outcome = match self.playlist.remove(index) {
            Ok(outcome) => outcome,
            Err(err) => return self.report_error(Err(err)),
        };
        self.sync_playlist_state();
        if was_current {
            self.report_error(self.switch_playlist_item(outcome, false))
        } else {
            Ok(())
        }
    }

    /// Empties the playlist and stops playback.
    pub fn clear_playlist(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        self.playlist.clear();
        self.sync_playlist_state();
        self.stop()
    }

    fn prefetch_upcoming(&self, index: usize) {
        if self.prefetched.lock().unwrap().as_ref().map(|(i, _)| *i) == Some(index) {
            return;
        }
        match self.playlist.with_item_source(index, |source| (self.demuxer_factory)(source)) {
            Some(Ok(demuxer)) => *self.prefetched.lock().unwrap() = Some((index, demuxer)),
            Some(Err(err)) => log::warn!("prefetch for playlist index {index} failed: {err}"),
            None => {}
        }
    }

    fn switch_playlist_item(&self, outcome: SwitchOutcome, autoplay: bool) -> EngineResult<()> {
        match outcome {
            SwitchOutcome::End => {
                self.sync_playlist_state();
                self.event_bus.emit(EngineEvent::PlaylistEnd);
                self.stop()
            }
            SwitchOutcome::Switch { index } => {
                let start_time = self.playlist.saved_position_of(index);
                let prebuilt = {
                    let mut guard = self.prefetched.lock().unwrap();
                    match guard.take() {
                        Some((i, d)) if i == index => Some(d),
                        other => {
                            *guard = other;
                            None
                        }
                    }
                };
                let outcome = self
                    .playlist
                    .with_item_source(index, |source| self.load_from_source(source, LoadOptions { autoplay, start_time }, prebuilt));
                match outcome {
                    Some(Ok(())) => {
                        self.sync_playlist_state();
                        Ok(())
                    }
                    Some(Err(err)) => match self.playlist.handle_item_load_error(index, err.clone()) {
                        Some(next) => self.switch_playlist_item(next, autoplay),
                        None => Err(err),
                    },
                    None => Err(EngineError::new(ErrorKind::InvalidState, "playlist index out of bounds")),
                }
            }
        }
    }

    pub fn next(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        let state = self.store.get_state();
        let outcome = self.playlist.next(state.current_time);
        self.report_error(self.switch_playlist_item(outcome, state.playing()))
    }

    pub fn prev(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        let state = self.store.get_state();
        let outcome = self.playlist.prev(state.current_time);
        self.report_error(self.switch_playlist_item(outcome, state.playing()))
    }

    pub fn jump_to(&self, index: usize) -> EngineResult<()> {
        self.ensure_usable()?;
        let state = self.store.get_state();
        let result = self.playlist.jump_to(index, state.current_time).and_then(|outcome| self.switch_playlist_item(outcome, state.playing()));
        self.report_error(result)
    }

    fn handle_ended(&self) -> EngineResult<()> {
        let state = self.store.get_state();
        self.clear_anchor();
        self.store.set_state(StatePatch::default().state(PlayerState::Ended).ended(true));
        self.event_bus.emit(EngineEvent::Ended);
        self.plugins.on_ended();
        let outcome = self.playlist.handle_ended(state.current_time);
        self.switch_playlist_item(outcome, true)
    }

    // --- Playback control --------------------------------------------------

    pub fn play(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        self.with_lifecycle(LifecycleStage::BeforePlay, LifecycleStage::AfterPlay, Value::Null, |_| {
            let state = self.store.get_state();
            if !state.can_play {
                return Err(EngineError::invalid_state("cannot play before the media is ready"));
            }
            if !state.state.can_transition_to(PlayerState::Playing) {
                return Err(EngineError::invalid_state(format!("cannot play from state {:?}", state.state)));
            }
            self.mark_anchor(state.current_time);
            self.audio.lock().unwrap().resume(state.current_time);
            self.store.set_state(StatePatch::default().state(PlayerState::Playing).waiting(false));
            self.event_bus.emit(EngineEvent::Play);
            self.event_bus.emit(EngineEvent::Playing);
            Ok(())
        })
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        self.with_lifecycle(LifecycleStage::BeforePause, LifecycleStage::AfterPause, Value::Null, |_| {
            let current_time = self.current_media_time();
            self.clear_anchor();
            self.audio.lock().unwrap().pause(current_time);
            self.store.set_state(StatePatch::default().state(PlayerState::Paused).current_time(current_time));
            self.event_bus.emit(EngineEvent::Pause);
            Ok(())
        })
    }

    pub fn stop(&self) -> EngineResult<()> {
        self.ensure_usable()?;
        self.with_lifecycle(LifecycleStage::BeforeStop, LifecycleStage::AfterStop, Value::Null, |_| {
            self.teardown_pipelines();
            self.store.set_state(
                StatePatch::default()
                    .state(PlayerState::Idle)
                    .current_time(0.0)
                    .can_play(false)
                    .can_play_through(false)
                    .ended(false)
                    .duration(None)
                    .media_info(None)
                    .video_tracks(Vec::new())
                    .audio_tracks(Vec::new())
                    .subtitle_tracks(Vec::new())
                    .selected_video_track(None)
                    .selected_audio_track(None)
                    .selected_subtitle_track(None),
            );
            self.event_bus.emit(EngineEvent::DurationChange { duration: None });
            Ok(())
        })
    }

    /// `options.precise` selects between the two documented seek modes:
    /// precise decodes from the keyframe and drops units up to `target`
    /// (the Sync Scheduler does this naturally when driven with
    /// `now_media == target`), while a keyframe seek skips that drop phase
    /// and presents from whatever PTS the source actually landed on.
    pub fn seek(&self, target: f64, options: SeekOptions) -> EngineResult<()> {
        self.ensure_usable()?;
        let target = target.max(0.0);
        self.with_lifecycle(
            LifecycleStage::BeforeSeek,
            LifecycleStage::AfterSeek,
            json!({ "time": target, "precise": options.precise }),
            |_| {
                self.store.set_state(StatePatch::default().seeking(true).waiting(true));
                self.event_bus.emit(EngineEvent::Seeking { current_time: target });

                let state = self.store.get_state();
                let mut keyframe_pts: Option<f64> = None;
                if let Some(id) = &state.selected_video_track {
                    if let Some(descriptor) = state.video_tracks.iter().find(|t| &t.id == id) {
                        let (pipeline, landed) = self.restart_pipeline_at(descriptor, Some(target))?;
                        keyframe_pts = landed;
                        if let Some(mut old) = self.video_pipeline.lock().unwrap().replace(pipeline) {
                            old.worker.abort();
                        }
                    }
                }
                if let Some(id) = &state.selected_audio_track {
                    if let Some(descriptor) = state.audio_tracks.iter().find(|t| &t.id == id) {
                        let (pipeline, landed) = self.restart_pipeline_at(descriptor, Some(target))?;
                        keyframe_pts = keyframe_pts.or(landed);
                        if let Some(mut old) = self.audio_pipeline.lock().unwrap().replace(pipeline) {
                            old.worker.abort();
                        }
                    }
                }

                // Precise seeking presents exactly at `target`, relying on the
                // Sync Scheduler's existing drop-until-current behavior once
                // it's driven with `now_media == target`. A keyframe seek
                // skips that drop phase entirely and presents from the PTS
                // the source actually landed on, which may be earlier.
                let effective_time = if options.precise { target } else { keyframe_pts.unwrap_or(target) };

                *self.scheduler.lock().unwrap() = SyncScheduler::new();
                self.audio.lock().unwrap().pause(effective_time);
                if state.playing() {
                    self.mark_anchor(effective_time);
                    self.audio.lock().unwrap().resume(effective_time);
                }

                self.store.set_state(StatePatch::default().current_time(effective_time).seeking(false).waiting(false));
                self.event_bus.emit(EngineEvent::Seeked { current_time: effective_time });
                Ok(())
            },
        )
    }

    fn select_track_inner(&self, kind: TrackChangeKind, track_id: Option<TrackId>) -> EngineResult<()> {
        let state = self.store.get_state();
        let current_time = self.current_media_time();
        let tracks = match kind {
            TrackChangeKind::Video => &state.video_tracks,
            TrackChangeKind::Audio => &state.audio_tracks,
            TrackChangeKind::Subtitle => &state.subtitle_tracks,
        };
        if let Some(id) = &track_id {
            if !tracks.iter().any(|t| &t.id == id) {
                return Err(EngineError::track_not_found(id));
            }
        }
        self.playlist.discard_prefetch();

        match kind {
            TrackChangeKind::Video | TrackChangeKind::Audio => {
                let slot = if kind == TrackChangeKind::Video { &self.video_pipeline } else { &self.audio_pipeline };
                match &track_id {
                    Some(id) => {
                        let descriptor = tracks.iter().find(|t| &t.id == id).expect("checked above").clone();
                        let (pipeline, _) = self.restart_pipeline_at(&descriptor, Some(current_time))?;
                        if let Some(mut old) = slot.lock().unwrap().replace(pipeline) {
                            old.worker.abort();
                        }
                    }
                    None => {
                        if let Some(mut old) = slot.lock().unwrap().take() {
                            old.worker.abort();
                        }
                    }
                }
                let patch = if kind == TrackChangeKind::Video {
                    StatePatch::default().selected_video_track(track_id.clone())
                } else {
                    StatePatch::default().selected_audio_track(track_id.clone())
                };
                self.store.set_state(patch);
            }
            TrackChangeKind::Subtitle => {
                self.store.set_state(StatePatch::default().selected_subtitle_track(track_id.clone()));
            }
        }
        self.event_bus.emit(EngineEvent::TrackChange { kind, track_id });
        Ok(())
    }

    pub fn select_video_track(&self, track_id: Option<TrackId>) -> EngineResult<()> {
        self.ensure_usable()?;
        self.report_error(self.select_track_inner(TrackChangeKind::Video, track_id))
    }

    pub fn select_audio_track(&self, track_id: Option<TrackId>) -> EngineResult<()> {
        self.ensure_usable()?;
        self.report_error(self.select_track_inner(TrackChangeKind::Audio, track_id))
    }

    pub fn select_subtitle_track(&self, track_id: Option<TrackId>) -> EngineResult<()> {
        self.ensure_usable()?;
        self.report_error(self.select_track_inner(TrackChangeKind::Subtitle, track_id))
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.audio.lock().unwrap().set_volume(volume);
        let muted = self.store.get_state().muted;
        self.store.set_state(StatePatch::default().volume(volume));
        self.event_bus.emit(EngineEvent::VolumeChange { volume, muted });
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio.lock().unwrap().set_muted(muted);
        let volume = self.store.get_state().volume;
        self.store.set_state(StatePatch::default().muted(muted));
        self.event_bus.emit(EngineEvent::VolumeChange { volume, muted });
    }

    pub fn set_playback_rate(&self, rate: f32) {
        let rate = rate.max(0.0625);
        let current_time = self.current_media_time();
        if self.store.get_state().playing() {
            self.mark_anchor(current_time);
        }
        self.audio.lock().unwrap().set_playback_rate(rate, current_time);
        self.store.set_state(StatePatch::default().playback_rate(rate).current_time(current_time));
        self.event_bus.emit(EngineEvent::RateChange { playback_rate: rate });
    }

    // --- Rendering -----------------------------------------------------

    pub fn set_render_target(&self, presenter: Option<Box<dyn Presenter>>) {
        let presenter = presenter.unwrap_or_else(|| Box::new(NullPresenter));
        let mut guard = self.renderer.lock().unwrap();
        guard.dispose();
        *guard = RendererSwitchboard::negotiate(presenter);
        let renderer_type = guard.renderer_type();
        drop(guard);
        self.store.set_state(StatePatch::default().renderer_type(renderer_type));
        self.event_bus.emit(EngineEvent::RendererChange(renderer_type));
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.surface_size.lock().unwrap() = (width, height);
        self.renderer.lock().unwrap().resize(width, height);
        self.screenshot_backend.lock().unwrap().resize(width, height);
        let rotation = self.store.get_state().rotation;
        let effective = effective_display_size(width, height, rotation);
        self.store.set_state(StatePatch::default().display_size(Some(effective)));
        self.event_bus.emit(EngineEvent::Resize { width, height });
    }

    pub fn set_rotation(&self, rotation: Rotation) {
        let (width, height) = *self.surface_size.lock().unwrap();
        let effective = effective_display_size(width, height, rotation);
        self.store.set_state(StatePatch::default().rotation(rotation).display_size(Some(effective)));
        self.event_bus.emit(EngineEvent::RotationChange { rotation, display_size: effective });
    }

    pub fn screenshot(&self, options: ScreenshotOptions) -> EngineResult<Vec<u8>> {
        self.ensure_usable()?;
        let backend = self.screenshot_backend.lock().unwrap();
        let surface = backend
            .last_composited()
            .ok_or_else(|| EngineError::invalid_state("no frame has been presented yet"))?;
        encode_surface(surface, options.format, options.quality)
            .map_err(|err| EngineError::new(ErrorKind::PlaybackError, err))
    }

    // --- Per-frame pump --------------------------------------------------

    /// Host-driven pump: advances the Sync Scheduler, presents any due
    /// frame, drains ready audio, and emits `timeupdate`/`waiting`/`ended`.
    /// Call this once per host animation frame while Playing: the engine
    /// owns no background render thread of its own.
    pub fn tick(&self) -> EngineResult<()> {
        if self.destroyed.load(Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.store.get_state();
        if state.state != PlayerState::Playing {
            return Ok(());
        }

        let now_media = self.current_media_time();
        if let Some(duration) = state.duration {
            if !state.is_live && now_media >= duration {
                return self.handle_ended();
            }
        }

        if let Some(pipeline) = self.audio_pipeline.lock().unwrap().as_mut() {
            while let Some(unit) = pipeline.queue.try_recv() {
                match unit {
                    DecodedUnit::Audio(samples) => self.audio.lock().unwrap().push_samples(samples),
                    DecodedUnit::Video(frame) => frame.close(),
                }
            }
        }

        let mut presented_frame = None;
        let mut dropped = 0usize;
        if let Some(pipeline) = self.video_pipeline.lock().unwrap().as_mut() {
            let result = self.scheduler.lock().unwrap().tick(now_media, &mut pipeline.queue);
            dropped = result.dropped;
            match result.outcome {
                TickOutcome::Presented(frame) => presented_frame = Some(frame),
                TickOutcome::Waiting => {
                    if !state.waiting {
                        self.store.set_state(StatePatch::default().waiting(true));
                        self.event_bus.emit(EngineEvent::Waiting);
                    }
                }
            }
        }
        if dropped > 0 {
            log::debug!("sync scheduler dropped {dropped} stale frame(s) at t={now_media}");
        }

        if let Some(frame) = presented_frame {
            let transformed = self.plugins.transform_frame(frame);
            self.plugins.before_render(&transformed, now_media);
            let rotation = state.rotation;
            let fit = FitMode::default();
            if let Err(err) = self.screenshot_backend.lock().unwrap().present(&transformed, rotation, fit) {
                log::warn!("screenshot backend failed to composite a frame: {err}");
            }
            let (present_result, fallback) = self.renderer.lock().unwrap().present(&transformed, rotation, fit);
            if let Some((from, to)) = fallback {
                self.store.set_state(StatePatch::default().renderer_type(to));
                self.event_bus.emit(EngineEvent::RendererFallback { from, to });
                self.event_bus.emit(EngineEvent::RendererChange(to));
            }
            if let Err(err) = present_result {
                log::warn!("renderer present failed: {err}");
            }
            self.plugins.after_render();
            transformed.close();
        }

        self.store.set_state(StatePatch::default().current_time(now_media).waiting(false));
        if self.scheduler.lock().unwrap().should_emit_timeupdate() {
            self.event_bus.emit(EngineEvent::TimeUpdate { current_time: now_media });
        }

        if let Some(slot) = self.playlist.report_progress(now_media, state.duration) {
            self.prefetch_upcoming(slot.index);
        }
        self.playlist.save_current_position(now_media);

        Ok(())
    }

    // --- Plugins / events / state ------------------------------------------

    pub fn use_plugin(&self, plugin: Box<dyn Plugin>) -> EngineResult<()> {
        self.plugins.install(plugin)
    }

    pub fn unuse_plugin(&self, name: &str) -> EngineResult<()> {
        self.plugins.uninstall(name)
    }

    pub fn get_state(&self) -> PlayerStateData {
        self.store.get_state()
    }

    pub fn subscribe(&self, listener: impl FnMut(&PlayerStateData) + Send + 'static) -> crate::store::Subscription {
        self.store.subscribe(listener)
    }

    pub fn on(
        &self,
        topic: &'static str,
        listener: impl FnMut(&EngineEvent) + Send + 'static,
    ) -> crate::event_bus::Subscription {
        self.event_bus.on(topic, listener)
    }

    pub fn once(
        &self,
        topic: &'static str,
        listener: impl FnMut(&EngineEvent) + Send + 'static,
    ) -> crate::event_bus::Subscription {
        self.event_bus.once(topic, listener)
    }

    pub fn off(&self, topic: &'static str) {
        self.event_bus.off(topic);
    }

    pub fn set_audio_transcoder(&self, transcoder: Arc<TranscodeFn>) {
        self.transcoder.set_audio_transcoder(transcoder);
    }

    pub fn set_video_transcoder(&self, transcoder: Arc<TranscodeFn>) {
        self.transcoder.set_video_transcoder(transcoder);
    }

    /// Releases decoders/renderer/audio device but leaves the instance
    /// reusable for a subsequent `load`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown_pipelines();
        self.audio.lock().unwrap().dispose();
        self.renderer.lock().unwrap().dispose();
    }

    /// `dispose`, plus uninstalls every plugin and clears every listener,
    /// then marks the instance permanently unusable. Teardown order is
    /// plugins, then Store reset, then pipelines: plugins must still see
    /// a coherent state snapshot in
    /// their `uninstall` hook before it's reset out from under them.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for name in self.plugins.installed_names() {
            let _ = self.plugins.uninstall(&name);
        }
        self.store.reset();
        self.teardown_pipelines();
        self.audio.lock().unwrap().dispose();
        self.renderer.lock().unwrap().dispose();
        self.playlist.clear();
        self.disposed.store(true, Ordering::SeqCst);
        self.event_bus.emit(EngineEvent::Destroy);
        for topic in self.event_bus.event_names() {
            self.event_bus.off(topic);
        }
    }

    /// Forces an immediate, synchronous Store flush, bypassing the
    /// runtime-turn batching — deterministic test hook mirroring
    /// [`crate::store::Store::flush_now`].
    #[cfg(any(test, feature = "test-util"))]
    pub fn flush_store_now(&self) {
        self.store.flush_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Packet, PacketSource};
    use crate::model::{AudioSamples, AudioTrackInfo, MediaInfo, PixelFormat, TrackKind, VideoTrackInfo};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    struct FakePacketSource {
        packets: Vec<Packet>,
    }
    impl PacketSource for FakePacketSource {
        fn next_packet(&mut self) -> Option<Packet> {
            if self.packets.is_empty() {
                None
            } else {
                Some(self.packets.remove(0))
            }
        }
        fn seek(&mut self, target_pts: f64) -> Option<f64> {
            self.packets.retain(|p| p.pts >= target_pts);
            self.packets.first().map(|p| p.pts)
        }
    }

    struct FakeDemuxer {
        info: MediaInfo,
        tracks: Vec<TrackDescriptor>,
    }
    impl Demuxer for FakeDemuxer {
        fn media_info(&self) -> MediaInfo {
            self.info.clone()
        }
        fn track_descriptors(&self) -> Vec<TrackDescriptor> {
            self.tracks.clone()
        }
        fn open_packet_source(&mut self, _track_id: &str) -> Option<Box<dyn PacketSource>> {
            // Keyframes at 0/2/4/6/8/10 so a seek target that falls between
            // two of them lands on a keyframe PTS distinct from the target,
            // exercising the precise-vs-keyframe seek split.
            let packets = (0..=5)
                .map(|i| Packet { pts: i as f64 * 2.0, keyframe: true, data: vec![1] })
                .collect();
            Some(Box::new(FakePacketSource { packets }))
        }
    }

    struct FakeVideoDecoder;
    impl Decoder for FakeVideoDecoder {
        fn decode(&mut self, packet: Packet) -> EngineResult<Vec<DecodedUnit>> {
            Ok(vec![DecodedUnit::Video(Frame::new(packet.pts, 1.0 / 30.0, PixelFormat::Rgba8, 2, 2, vec![0u8; 16]))])
        }
        fn flush(&mut self) -> Vec<DecodedUnit> {
            Vec::new()
        }
    }

    struct FakeAudioDecoder;
    impl Decoder for FakeAudioDecoder {
        fn decode(&mut self, packet: Packet) -> EngineResult<Vec<DecodedUnit>> {
            Ok(vec![DecodedUnit::Audio(AudioSamples::new(2, 48_000, packet.pts, 0.02, vec![0.0; 4]))])
        }
        fn flush(&mut self) -> Vec<DecodedUnit> {
            Vec::new()
        }
    }

    struct FakePresenter;
    impl Presenter for FakePresenter {
        fn supports(&self, renderer_type: RendererType) -> bool {
            renderer_type == RendererType::Software
        }
        fn present(&mut self, _frame: &Frame, _rotation: Rotation, _fit: FitMode) -> Result<(), String> {
            Ok(())
        }
        fn resize(&mut self, _width: u32, _height: u32) {}
    }

    fn video_track(id: &str) -> TrackDescriptor {
        TrackDescriptor {
            id: id.into(),
            codec: Some("h264".into()),
            language: String::new(),
            name: None,
            kind: TrackKind::Video(VideoTrackInfo { width: 4, height: 4, frame_rate: 30.0, bitrate: None, rotation: Rotation::Deg0 }),
            selected: false,
            decodable: true,
            converted: false,
        }
    }

    fn audio_track(id: &str) -> TrackDescriptor {
        TrackDescriptor {
            id: id.into(),
            codec: Some("aac".into()),
            language: String::new(),
            name: None,
            kind: TrackKind::Audio(AudioTrackInfo { channel_count: 2, sample_rate: 48_000, bitrate: None }),
            selected: false,
            decodable: true,
            converted: false,
        }
    }

    fn make_engine() -> Arc<Engine> {
        let demuxer_factory: Arc<DemuxerFactory> = Arc::new(|_source| {
            Ok(Box::new(FakeDemuxer {
                info: MediaInfo {
                    duration: Some(10.0),
                    container: "mp4".into(),
                    mime: "video/mp4".into(),
                    metadata: BTreeMap::new(),
                    has_video: true,
                    has_audio: true,
                    has_subtitle: false,
                },
                tracks: vec![video_track("v1"), audio_track("a1")],
            }) as Box<dyn Demuxer>)
        });
        let decoder_factory: Arc<DecoderFactory> = Arc::new(|descriptor| {
            Ok(if descriptor.is_video() { Box::new(FakeVideoDecoder) as Box<dyn Decoder> } else { Box::new(FakeAudioDecoder) as Box<dyn Decoder> })
        });
        Engine::new(Box::new(FakePresenter), demuxer_factory, decoder_factory)
    }

    fn bytes_source() -> MediaSource {
        MediaSource::Bytes(Arc::from(vec![1u8, 2, 3]))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn loading_transitions_to_ready_with_tracks_selected() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        let state = engine.get_state();
        assert_eq!(state.state, PlayerState::Ready);
        assert!(state.can_play);
        assert_eq!(state.video_tracks.len(), 1);
        assert_eq!(state.selected_video_track, Some(TrackId::from("v1")));
        assert_eq!(state.duration, Some(10.0));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn play_then_pause_round_trips_state() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        engine.play().unwrap();
        engine.flush_store_now();
        assert_eq!(engine.get_state().state, PlayerState::Playing);
        engine.pause().unwrap();
        engine.flush_store_now();
        assert_eq!(engine.get_state().state, PlayerState::Paused);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn play_before_ready_is_rejected() {
        let engine = make_engine();
        let err = engine.play().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn volume_and_mute_update_state_and_emit_events() {
        let engine = make_engine();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let _sub = engine.on("volumechange", move |event| {
            if let EngineEvent::VolumeChange { volume, muted } = event {
                events_clone.lock().unwrap().push((*volume, *muted));
            }
        });
        engine.set_volume(0.4);
        engine.flush_store_now();
        engine.set_muted(true);
        engine.flush_store_now();
        assert_eq!(engine.get_state().volume, 0.4);
        assert!(engine.get_state().muted);
        assert_eq!(*events.lock().unwrap(), vec![(0.4, false), (0.4, true)]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn precise_seek_lands_exactly_on_the_requested_target() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        engine.seek(5.0, SeekOptions { precise: true }).unwrap();
        engine.flush_store_now();
        let state = engine.get_state();
        assert_eq!(state.current_time, 5.0);
        assert!(!state.seeking);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn keyframe_seek_lands_on_the_keyframe_pts_the_source_reports() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        // Keyframes sit at 0/2/4/6/8/10; a keyframe seek to 5.0 should
        // present from the next keyframe at-or-after it (6.0), not drop
        // forward to the exact target the way a precise seek does.
        engine.seek(5.0, SeekOptions { precise: false }).unwrap();
        engine.flush_store_now();
        let state = engine.get_state();
        assert_eq!(state.current_time, 6.0);
        assert!(!state.seeking);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn selecting_an_unknown_track_is_rejected() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        let err = engine.select_video_track(Some("missing".into())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TrackNotFound);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn a_plugin_can_cancel_play() {
        struct Blocker;
        impl Plugin for Blocker {
            fn name(&self) -> &str {
                "blocker"
            }
            fn before_lifecycle(&mut self, _ctx: &crate::plugin::PluginContext, stage: LifecycleStage, _args: &mut Value) -> HookOutcome {
                if stage == LifecycleStage::BeforePlay {
                    HookOutcome::Cancel
                } else {
                    HookOutcome::Continue
                }
            }
        }
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        engine.use_plugin(Box::new(Blocker)).unwrap();
        let err = engine.play().unwrap_err();
        assert_eq!(err.kind, ErrorKind::OperationAborted);
        assert_eq!(engine.get_state().state, PlayerState::Ready);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn destroy_makes_the_instance_permanently_unusable() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        engine.destroy();
        let err = engine.load(bytes_source(), LoadOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dispose_leaves_the_instance_reusable_for_a_later_load() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        engine.dispose();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        assert_eq!(engine.get_state().state, PlayerState::Ready);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn loading_a_playlist_selects_the_start_index() {
        let engine = make_engine();
        let items = vec![
            PlaylistItem { id: "a".into(), source: bytes_source(), title: None, poster_url: None, saved_position: None, duration: None },
            PlaylistItem { id: "b".into(), source: bytes_source(), title: None, poster_url: None, saved_position: None, duration: None },
        ];
        engine.load_playlist(items, 0, PlaylistMode::Sequential).unwrap();
        engine.flush_store_now();
        assert_eq!(engine.get_state().current_playlist_index, Some(0));
        assert_eq!(engine.get_state().state, PlayerState::Ready);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn adding_an_item_before_playback_started_is_reflected_in_state() {
        let engine = make_engine();
        let index = engine
            .add_to_playlist(
                PlaylistItem { id: "a".into(), source: bytes_source(), title: None, poster_url: None, saved_position: None, duration: None },
                None,
            )
            .unwrap();
        engine.flush_store_now();
        assert_eq!(index, 0);
        assert_eq!(engine.get_state().playlist.items.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn removing_the_current_playlist_item_reloads_the_new_occupant() {
        let engine = make_engine();
        let items = vec![
            PlaylistItem { id: "a".into(), source: bytes_source(), title: None, poster_url: None, saved_position: None, duration: None },
            PlaylistItem { id: "b".into(), source: bytes_source(), title: None, poster_url: None, saved_position: None, duration: None },
        ];
        engine.load_playlist(items, 0, PlaylistMode::Manual).unwrap();
        engine.flush_store_now();
        engine.remove_from_playlist(0).unwrap();
        engine.flush_store_now();
        let state = engine.get_state();
        assert_eq!(state.current_playlist_index, Some(0));
        assert_eq!(state.playlist.items.len(), 1);
        assert_eq!(state.state, PlayerState::Ready);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn clearing_the_playlist_stops_playback() {
        let engine = make_engine();
        let items = vec![PlaylistItem { id: "a".into(), source: bytes_source(), title: None, poster_url: None, saved_position: None, duration: None }];
        engine.load_playlist(items, 0, PlaylistMode::Manual).unwrap();
        engine.flush_store_now();
        engine.clear_playlist().unwrap();
        engine.flush_store_now();
        let state = engine.get_state();
        assert_eq!(state.state, PlayerState::Idle);
        assert!(state.playlist.items.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tick_while_not_playing_is_a_no_op() {
        let engine = make_engine();
        engine.load(bytes_source(), LoadOptions::default()).unwrap();
        engine.flush_store_now();
        engine.tick().unwrap();
        assert_eq!(engine.get_state().state, PlayerState::Ready);
        let _ = AtomicUsize::new(0); // keep the import used across cfg variations
    }
}
