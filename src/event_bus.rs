//! Typed synchronous publish/subscribe bus.
//!
//! A crate-local, synchronously-dispatched bus in the shape of a
//! `tokio::sync::broadcast::Sender<Message>` fan-out, so that hook ordering
//! and re-entrancy guarantees hold exactly: there is no channel hop between
//! `emit` and listener invocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::model::{MediaInfo, PlayerStateData, PlaylistItemSummary, TrackId};
use crate::renderer::RendererType;

/// One topic per engine-level event.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChange(PlayerStateData),
    LoadStart,
    LoadedMetadata(MediaInfo),
    LoadedData,
    CanPlay,
    CanPlayThrough,
    Ready,
    Destroy,
    Play,
    Pause,
    Playing,
    Ended,
    TimeUpdate { current_time: f64 },
    DurationChange { duration: Option<f64> },
    VolumeChange { volume: f32, muted: bool },
    RateChange { playback_rate: f32 },
    Seeking { current_time: f64 },
    Seeked { current_time: f64 },
    Waiting,
    Progress { buffered: Vec<crate::model::TimeRange> },
    Error(EngineError),
    Warning { kind: String, message: String, error: Option<EngineError> },
    TrackChange { kind: TrackChangeKind, track_id: Option<TrackId> },
    Resize { width: u32, height: u32 },
    RotationChange { rotation: crate::model::Rotation, display_size: (u32, u32) },
    RendererChange(RendererType),
    RendererFallback { from: RendererType, to: RendererType },
    PlaylistChange { playlist: Vec<PlaylistItemSummary> },
    PlaylistItemChange { index: usize, item: PlaylistItemSummary, previous_index: Option<usize> },
    PlaylistEnd,
    PlaylistAdd { item: PlaylistItemSummary, index: usize },
    PlaylistRemove { index: usize },
    PlaylistItemError { index: usize, error: EngineError },
    ConversionStart { kind: TrackChangeKind, track_id: TrackId, reason: String },
    ConversionProgress { kind: TrackChangeKind, track_id: TrackId, progress: f32, stage: String },
    ConversionComplete { duration: Option<f64> },
    ConversionError { error: EngineError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChangeKind {
    Video,
    Audio,
    Subtitle,
}

impl EngineEvent {
    /// The topic name, used for `listener_count`/`event_names` introspection.
    pub fn topic(&self) -> &'static str {
        match self {
            EngineEvent::StateChange(_) => "statechange",
            EngineEvent::LoadStart => "loadstart",
            EngineEvent::LoadedMetadata(_) => "loadedmetadata",
            EngineEvent::LoadedData => "loadeddata",
            EngineEvent::CanPlay => "canplay",
            EngineEvent::CanPlayThrough => "canplaythrough",
            EngineEvent::Ready => "ready",
            EngineEvent::Destroy => "destroy",
            EngineEvent::Play => "play",
            EngineEvent::Pause => "pause",
            EngineEvent::Playing => "playing",
            EngineEvent::Ended => "ended",
            EngineEvent::TimeUpdate { .. } => "timeupdate",
            EngineEvent::DurationChange { .. } => "durationchange",
            EngineEvent::VolumeChange { .. } => "volumechange",
            EngineEvent::RateChange { .. } => "ratechange",
            EngineEvent::Seeking { .. } => "seeking",
            EngineEvent::Seeked { .. } => "seeked",
            EngineEvent::Waiting => "waiting",
            EngineEvent::Progress { .. } => "progress",
            EngineEvent::Error(_) => "error",
            EngineEvent::Warning { .. } => "warning",
            EngineEvent::TrackChange { .. } => "trackchange",
            EngineEvent::Resize { .. } => "resize",
            EngineEvent::RotationChange { .. } => "rotationchange",
            EngineEvent::RendererChange(_) => "rendererchange",
            EngineEvent::RendererFallback { .. } => "rendererfallback",
            EngineEvent::PlaylistChange { .. } => "playlistchange",
            EngineEvent::PlaylistItemChange { .. } => "playlistitemchange",
            EngineEvent::PlaylistEnd => "playlistend",
            EngineEvent::PlaylistAdd { .. } => "playlistadd",
            EngineEvent::PlaylistRemove { .. } => "playlistremove",
            EngineEvent::PlaylistItemError { .. } => "playlistitemerror",
            EngineEvent::ConversionStart { .. } => "conversionstart",
            EngineEvent::ConversionProgress { .. } => "conversionprogress",
            EngineEvent::ConversionComplete { .. } => "conversioncomplete",
            EngineEvent::ConversionError { .. } => "conversionerror",
        }
    }
}

type Listener = Box<dyn FnMut(&EngineEvent) + Send>;

struct Registration {
    id: u64,
    once: bool,
    listener: Listener,
}

/// Synchronous typed pub/sub with `once`/`off`/listener-count introspection.
/// Dispatch is synchronous and re-entrant-safe: `emit`
/// snapshots the registration ids up front so a listener may subscribe or
/// unsubscribe from within its own callback.
pub struct EventBus {
    listeners: Mutex<HashMap<&'static str, Vec<Registration>>>,
    next_id: AtomicU64,
    max_listeners: Mutex<usize>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// Unsubscribe handle returned by [`EventBus::on`]/[`EventBus::once`].
pub struct Subscription {
    bus: Arc<EventBus>,
    topic: &'static str,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.bus.off_id(self.topic, self.id);
    }
}

const DEFAULT_MAX_LISTENERS: usize = 10;

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_listeners: Mutex::new(DEFAULT_MAX_LISTENERS),
        })
    }

    pub fn set_max_listeners(&self, max: usize) {
        *self.max_listeners.lock().unwrap() = max;
    }

    fn register(
        self: &Arc<Self>,
        topic: &'static str,
        once: bool,
        prepend: bool,
        listener: Listener,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.listeners.lock().unwrap();
        let slot = guard.entry(topic).or_default();
        if prepend {
            slot.insert(0, Registration { id, once, listener });
        } else {
            slot.push(Registration { id, once, listener });
        }
        let max = *self.max_listeners.lock().unwrap();
        let listener_count = slot.len();
        drop(guard);
        if listener_count > max {
            let message =
                format!("topic '{topic}' has {listener_count} listeners, exceeding the configured max of {max}");
            log::warn!("EventBus: {message}");
            self.emit(EngineEvent::Warning { kind: "maxlisteners".into(), message, error: None });
        }
        Subscription {
            bus: Arc::clone(self),
            topic,
            id,
        }
    }

    pub fn on(
        self: &Arc<Self>,
        topic: &'static str,
        listener: impl FnMut(&EngineEvent) + Send + 'static,
    ) -> Subscription {
        self.register(topic, false, false, Box::new(listener))
    }

    pub fn prepend_listener(
        self: &Arc<Self>,
        topic: &'static str,
        listener: impl FnMut(&EngineEvent) + Send + 'static,
    ) -> Subscription {
        self.register(topic, false, true, Box::new(listener))
    }

    /// Wraps the listener so removal happens before invocation, making
    /// re-entrant emission from within the listener itself safe.
    pub fn once(
        self: &Arc<Self>,
        topic: &'static str,
        listener: impl FnMut(&EngineEvent) + Send + 'static,
    ) -> Subscription {
        self.register(topic, true, false, Box::new(listener))
    }

    fn off_id(&self, topic: &'static str, id: u64) {
        let mut guard = self.listeners.lock().unwrap();
        if let Some(slot) = guard.get_mut(topic) {
            slot.retain(|reg| reg.id != id);
        }
    }

    /// Removes all listeners for `topic` when `id` is omitted.
    pub fn off(&self, topic: &'static str) {
        self.listeners.lock().unwrap().remove(topic);
    }

    pub fn listener_count(&self, topic: &'static str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(topic)
            .map_or(0, |slot| slot.len())
    }

    pub fn event_names(&self) -> Vec<&'static str> {
        self.listeners.lock().unwrap().keys().copied().collect()
    }

    /// Synchronously dispatches `event` to every listener registered for its
    /// topic, in registration order, removing `once` listeners first.
    pub fn emit(&self, event: EngineEvent) {
        let topic = event.topic();
        // Pull each listener out before invocation (by id, with a no-op
        // placeholder left in its slot) so dispatch never holds the lock
        // while calling out — a re-entrant emit from inside a listener
        // would otherwise deadlock on this same mutex. `once` listeners are
        // removed for good; persistent ones are put back by id afterward.
        let mut to_invoke: Vec<(u64, Listener, bool)> = Vec::new();
        {
            let mut guard = self.listeners.lock().unwrap();
            if let Some(slot) = guard.get_mut(topic) {
                let mut remaining = Vec::with_capacity(slot.len());
                for mut reg in slot.drain(..) {
                    if reg.once {
                        to_invoke.push((reg.id, reg.listener, true));
                    } else {
                        let listener = std::mem::replace(&mut reg.listener, Box::new(|_| {}));
                        to_invoke.push((reg.id, listener, false));
                        remaining.push(reg);
                    }
                }
                *slot = remaining;
            }
        }
        for (_, listener, _) in to_invoke.iter_mut() {
            listener(&event);
        }
        let mut guard = self.listeners.lock().unwrap();
        if let Some(slot) = guard.get_mut(topic) {
            for (id, listener, once) in to_invoke {
                if once {
                    continue;
                }
                if let Some(reg) = slot.iter_mut().find(|reg| reg.id == id) {
                    reg.listener = listener;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let _a = bus.on("play", move |_| o1.lock().unwrap().push(1));
        let _b = bus.on("play", move |_| o2.lock().unwrap().push(2));
        bus.emit(EngineEvent::Play);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn prepend_listener_runs_first() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let _a = bus.on("play", move |_| o1.lock().unwrap().push("second"));
        let _b = bus.prepend_listener("play", move |_| o2.lock().unwrap().push("first"));
        bus.emit(EngineEvent::Play);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn once_listener_fires_a_single_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = bus.once("play", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EngineEvent::Play);
        bus.emit(EngineEvent::Play);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persistent_listener_fires_on_every_emit() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = bus.on("play", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EngineEvent::Play);
        bus.emit(EngineEvent::Play);
        bus.emit(EngineEvent::Play);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = bus.on("play", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EngineEvent::Play);
        sub.unsubscribe();
        bus.emit(EngineEvent::Play);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_without_id_removes_every_listener_for_the_topic() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _a = bus.on("play", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.off("play");
        bus.emit(EngineEvent::Play);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_count_and_event_names_reflect_registrations() {
        let bus = EventBus::new();
        let _a = bus.on("play", |_| {});
        let _b = bus.on("play", |_| {});
        let _c = bus.on("pause", |_| {});
        assert_eq!(bus.listener_count("play"), 2);
        assert_eq!(bus.listener_count("pause"), 1);
        let mut names = bus.event_names();
        names.sort_unstable();
        assert_eq!(names, vec!["pause", "play"]);
    }

    #[test]
    fn exceeding_max_listeners_warns_but_does_not_reject() {
        let bus = EventBus::new();
        bus.set_max_listeners(1);
        let warnings = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&warnings);
        let _warn_sub = bus.on("warning", move |event| {
            if matches!(event, EngineEvent::Warning { kind, .. } if kind == "maxlisteners") {
                w.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _a = bus.on("play", |_| {});
        let _b = bus.on("play", |_| {});
        assert_eq!(bus.listener_count("play"), 2);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_emit_from_a_listener_does_not_corrupt_dispatch() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus_clone = Arc::clone(&bus);
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.once("play", move |_| {
            seen_clone.lock().unwrap().push("outer");
            bus_clone.emit(EngineEvent::Play);
        });
        bus.emit(EngineEvent::Play);
        assert_eq!(*seen.lock().unwrap(), vec!["outer"]);
    }
}
