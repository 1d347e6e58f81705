//! Track descriptors produced by the demuxer and surfaced in `PlayerStateData`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable string id, unique within a single load session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub String);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        TrackId(value.to_string())
    }
}

impl From<String> for TrackId {
    fn from(value: String) -> Self {
        TrackId(value)
    }
}

/// Rotation values a video track may declare, also used by the renderer's
/// pre-present transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// True when the effective display size needs its width/height swapped.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoTrackInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f32,
    pub bitrate: Option<u32>,
    pub rotation: Rotation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackInfo {
    pub channel_count: u16,
    pub sample_rate: u32,
    pub bitrate: Option<u32>,
}

/// A single selectable track surfaced to the host. `selected` is mutually
/// exclusive within a kind at the [`crate::store::Store`] boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: TrackId,
    pub codec: Option<String>,
    /// BCP-47 language tag, empty string when unknown.
    pub language: String,
    pub name: Option<String>,
    pub kind: TrackKind,
    pub selected: bool,
    pub decodable: bool,
    pub converted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrackKind {
    Video(VideoTrackInfo),
    Audio(AudioTrackInfo),
    Subtitle,
}

impl TrackDescriptor {
    pub fn is_video(&self) -> bool {
        matches!(self.kind, TrackKind::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.kind, TrackKind::Audio(_))
    }

    pub fn is_subtitle(&self) -> bool {
        matches!(self.kind, TrackKind::Subtitle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_swaps_dimensions_only_for_90_270() {
        assert!(!Rotation::Deg0.swaps_dimensions());
        assert!(Rotation::Deg90.swaps_dimensions());
        assert!(!Rotation::Deg180.swaps_dimensions());
        assert!(Rotation::Deg270.swaps_dimensions());
    }

    #[test]
    fn track_kind_predicates() {
        let track = TrackDescriptor {
            id: "v1".into(),
            codec: Some("h264".into()),
            language: String::new(),
            name: None,
            kind: TrackKind::Video(VideoTrackInfo {
                width: 1920,
                height: 1080,
                frame_rate: 30.0,
                bitrate: None,
                rotation: Rotation::Deg0,
            }),
            selected: false,
            decodable: true,
            converted: false,
        };
        assert!(track.is_video());
        assert!(!track.is_audio());
        assert!(!track.is_subtitle());
    }
}
