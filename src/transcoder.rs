//! Fallback Transcoder: invokes a host-supplied transcode function for
//! tracks the engine can't natively decode, caching the result for the
//! load session's lifetime — an in-memory session cache with no
//! persistence, since the cache never needs to outlive one load.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::event_bus::TrackChangeKind;
use crate::model::TrackId;

/// A host-supplied conversion function: full source bytes in, a
/// known-supported-format byte buffer out (AAC for audio, H.264 MP4 for
/// video), reporting progress via the callback as it goes.
pub type TranscodeFn = dyn Fn(&[u8], &TrackId, &mut dyn FnMut(f32, &str)) -> EngineResult<Vec<u8>> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source_identity: String,
    track_id: TrackId,
}

struct Cache {
    entries: HashMap<CacheKey, Arc<[u8]>>,
    /// Insertion order, oldest first, for FIFO eviction under
    /// `max_size_bytes` (`maxCacheSize`).
    order: Vec<CacheKey>,
    total_bytes: u64,
    max_size_bytes: Option<u64>,
}

impl Cache {
    fn new(max_size_bytes: Option<u64>) -> Self {
        Self { entries: HashMap::new(), order: Vec::new(), total_bytes: 0, max_size_bytes }
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, value: Arc<[u8]>) {
        self.total_bytes += value.len() as u64;
        self.order.push(key.clone());
        self.entries.insert(key, value);
        if let Some(budget) = self.max_size_bytes {
            while self.total_bytes > budget && !self.order.is_empty() {
                let oldest = self.order.remove(0);
                if let Some(evicted) = self.entries.remove(&oldest) {
                    self.total_bytes -= evicted.len() as u64;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.total_bytes = 0;
    }
}

/// Runs host-supplied transcoders and caches their output by
/// `(source identity, track id)` for the current load session.
pub struct FallbackTranscoder {
    audio_transcoder: Mutex<Option<Arc<TranscodeFn>>>,
    video_transcoder: Mutex<Option<Arc<TranscodeFn>>>,
    cache: Mutex<Cache>,
}

impl FallbackTranscoder {
    pub fn new() -> Self {
        Self::with_max_cache_size(None)
    }

    /// `max_size_bytes` bounds the total size of cached conversions
    /// (`maxCacheSize`); `None` means unbounded.
    pub fn with_max_cache_size(max_size_bytes: Option<u64>) -> Self {
        Self {
            audio_transcoder: Mutex::new(None),
            video_transcoder: Mutex::new(None),
            cache: Mutex::new(Cache::new(max_size_bytes)),
        }
    }

    pub fn set_audio_transcoder(&self, transcoder: Arc<TranscodeFn>) {
        *self.audio_transcoder.lock().unwrap() = Some(transcoder);
    }

    pub fn set_video_transcoder(&self, transcoder: Arc<TranscodeFn>) {
        *self.video_transcoder.lock().unwrap() = Some(transcoder);
    }

    /// Converts `source_bytes` for `track_id`, consulting the session
    /// cache first. `on_progress(progress, stage)` is invoked for each
    /// progress report the host transcoder makes; callers typically wire
    /// it to `conversionprogress` events.
    pub fn convert(
        &self,
        kind: TrackChangeKind,
        source_identity: &str,
        track_id: &TrackId,
        source_bytes: &[u8],
        mut on_progress: impl FnMut(f32, &str),
    ) -> EngineResult<Arc<[u8]>> {
        let key = CacheKey { source_identity: source_identity.to_string(), track_id: track_id.clone() };
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return Ok(cached);
        }

        let slot = match kind {
            TrackChangeKind::Audio => &self.audio_transcoder,
            TrackChangeKind::Video => &self.video_transcoder,
            TrackChangeKind::Subtitle => {
                return Err(EngineError::new(
                    ErrorKind::MediaNotSupported,
                    "no fallback transcoder exists for subtitle tracks",
                ))
            }
        };
        let transcoder = slot.lock().unwrap().clone().ok_or_else(|| {
            EngineError::new(ErrorKind::MediaNotSupported, format!("no transcoder registered for {kind:?} tracks"))
        })?;

        let converted: Arc<[u8]> = transcoder(source_bytes, track_id, &mut on_progress)?.into();
        self.cache.lock().unwrap().insert(key, Arc::clone(&converted));
        Ok(converted)
    }

    /// Discards every cached conversion; called when a new source is
    /// loaded, since the cache is bound to the current load session.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}

impl Default for FallbackTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn a_cached_conversion_is_not_recomputed() {
        let transcoder = FallbackTranscoder::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        transcoder.set_audio_transcoder(Arc::new(move |bytes, _track, progress| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            progress(1.0, "done");
            Ok(bytes.to_vec())
        }));
        let track_id: TrackId = "a1".into();
        transcoder.convert(TrackChangeKind::Audio, "url:x", &track_id, &[1, 2, 3], |_, _| {}).unwrap();
        transcoder.convert(TrackChangeKind::Audio, "url:x", &track_id, &[1, 2, 3], |_, _| {}).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_transcoder_for_the_kind_is_media_not_supported() {
        let transcoder = FallbackTranscoder::new();
        let err = transcoder
            .convert(TrackChangeKind::Video, "url:x", &"v1".into(), &[], |_, _| {})
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MediaNotSupported);
    }

    #[test]
    fn subtitle_tracks_are_never_transcoded() {
        let transcoder = FallbackTranscoder::new();
        let err = transcoder
            .convert(TrackChangeKind::Subtitle, "url:x", &"s1".into(), &[], |_, _| {})
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MediaNotSupported);
    }

    #[test]
    fn clearing_the_cache_forces_recomputation() {
        let transcoder = FallbackTranscoder::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        transcoder.set_audio_transcoder(Arc::new(move |bytes, _track, _progress| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(bytes.to_vec())
        }));
        let track_id: TrackId = "a1".into();
        transcoder.convert(TrackChangeKind::Audio, "url:x", &track_id, &[1], |_, _| {}).unwrap();
        transcoder.clear_cache();
        transcoder.convert(TrackChangeKind::Audio, "url:x", &track_id, &[1], |_, _| {}).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn progress_callback_is_invoked_with_reported_values() {
        let transcoder = FallbackTranscoder::new();
        transcoder.set_audio_transcoder(Arc::new(|bytes, _track, progress| {
            progress(0.5, "resampling");
            Ok(bytes.to_vec())
        }));
        let mut seen = Vec::new();
        transcoder
            .convert(TrackChangeKind::Audio, "url:x", &"a1".into(), &[9], |p, stage| {
                seen.push((p, stage.to_string()));
            })
            .unwrap();
        assert_eq!(seen, vec![(0.5, "resampling".to_string())]);
    }
}
