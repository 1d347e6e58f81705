//! Core data types shared across the engine.

mod frame;
mod playlist;
mod source;
mod state;
mod track;

pub use frame::{live_frame_count, live_sample_count, AudioSamples, Frame, PixelFormat};
pub use playlist::{Playlist, PlaylistItem, PlaylistItemSummary, PlaylistMode};
pub use source::{MediaInfo, MediaReader, MediaSource, OpaqueHandle};
pub use state::{buffered_ranges_are_well_formed, PlayerState, PlayerStateData, TimeRange};
pub use track::{AudioTrackInfo, Rotation, TrackDescriptor, TrackId, TrackKind, VideoTrackInfo};
