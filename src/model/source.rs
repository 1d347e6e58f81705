//! The immutable description of "what to play" handed to the engine.

use std::fmt;
use std::io::{Read, Seek};
use std::sync::Arc;

/// A host-supplied seekable byte source, used for the `Reader` variant of
/// [`MediaSource`]. The demux library (out of scope for this crate) reads
/// through this trait; MediaFox never interprets the bytes itself.
pub trait MediaReader: Read + Seek + Send {
    /// Total byte length if known up front (absent for unbounded/live streams).
    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// An opaque platform file handle (e.g. a file descriptor already opened by
/// the host). MediaFox treats the payload as inert bytes for identity and
/// caching purposes only.
#[derive(Clone)]
pub struct OpaqueHandle(pub Arc<str>);

impl fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpaqueHandle").field(&self.0).finish()
    }
}

/// Tagged union over the ways a media source may be supplied to the engine.
///
/// Immutable after construction. Its lifetime must outlive the [`Pipeline`](crate::engine::Engine)
/// that consumes it.
pub enum MediaSource {
    Url(String),
    Bytes(Arc<[u8]>),
    Reader(Box<dyn MediaReader>),
    Handle(OpaqueHandle),
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            MediaSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            MediaSource::Reader(_) => f.debug_tuple("Reader").field(&"<reader>").finish(),
            MediaSource::Handle(handle) => f.debug_tuple("Handle").field(handle).finish(),
        }
    }
}

impl MediaSource {
    /// A stable identity string used to key the fallback-transcoder cache
    /// and the compositor's source pool. Two loads of the
    /// same `Url`/`Bytes` source produce the same identity; `Reader`/`Handle`
    /// sources are identified by a fresh id each time since they are moved.
    pub fn identity(&self) -> String {
        match self {
            MediaSource::Url(url) => format!("url:{url}"),
            MediaSource::Bytes(bytes) => {
                format!("bytes:{}:{:x}", bytes.len(), fnv1a(bytes))
            }
            MediaSource::Reader(_) => format!("reader:{}", uuid::Uuid::new_v4()),
            MediaSource::Handle(handle) => format!("handle:{}", handle.0),
        }
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Produced once per load; never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// Duration in seconds; `None` for a live/unbounded stream.
    pub duration: Option<f64>,
    pub container: String,
    pub mime: String,
    pub metadata: std::collections::BTreeMap<String, String>,
    pub has_video: bool,
    pub has_audio: bool,
    pub has_subtitle: bool,
}

impl MediaInfo {
    pub fn is_live(&self) -> bool {
        self.duration.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_share_identity() {
        let a = MediaSource::Bytes(Arc::from(vec![1u8, 2, 3]));
        let b = MediaSource::Bytes(Arc::from(vec![1u8, 2, 3]));
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn differing_bytes_have_distinct_identity() {
        let a = MediaSource::Bytes(Arc::from(vec![1u8, 2, 3]));
        let b = MediaSource::Bytes(Arc::from(vec![1u8, 2, 4]));
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn live_media_info_has_no_duration() {
        let info = MediaInfo {
            duration: None,
            container: "mp4".into(),
            mime: "video/mp4".into(),
            metadata: Default::default(),
            has_video: true,
            has_audio: true,
            has_subtitle: false,
        };
        assert!(info.is_live());
    }
}
