//! The partial-update object passed to [`super::Store::set_state`].
//!
//! Every field is `Option<T>`: `None` means "leave untouched", `Some(v)`
//! means "set to `v`" (for already-optional fields like `duration` this is
//! `Some(None)` to explicitly clear vs. plain `None` to leave alone). One
//! macro defines the struct, its builder setters, `merge_from`, and
//! `apply_to` together so the 26-odd fields stay in lockstep.

use crate::error::EngineError;
use crate::model::{
    MediaInfo, PlayerState, PlayerStateData, Playlist, PlaylistMode, Rotation, TrackDescriptor,
    TrackId,
};
use crate::renderer::RendererType;

macro_rules! state_patch {
    ($($field:ident : $ty:ty => $key:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Default)]
        pub struct StatePatch {
            $(pub $field: Option<$ty>,)+
        }

        impl StatePatch {
            $(
                pub fn $field(mut self, value: $ty) -> Self {
                    self.$field = Some(value);
                    self
                }
            )+

            pub fn is_empty(&self) -> bool {
                $(self.$field.is_none())&&+
            }

            /// Later-set fields in `other` win; fields `other` leaves
            /// untouched keep whatever `self` already had pending.
            pub fn merge_from(&mut self, other: Self) {
                $(if other.$field.is_some() { self.$field = other.$field; })+
            }

            /// Applies every pending field to `state`, runs `invariants`
            /// against the result, and rolls back the whole patch if it
            /// rejects. Returns the keys that actually changed value, so a
            /// no-op patch notifies nobody.
            pub fn apply_to(
                &mut self,
                state: &mut PlayerStateData,
                invariants: impl FnOnce(&mut PlayerStateData) -> Result<(), EngineError>,
            ) -> Vec<&'static str> {
                let previous = state.clone();
                $(if let Some(value) = self.$field.take() { state.$field = value; })+
                if let Err(err) = invariants(state) {
                    *state = previous;
                    log::warn!("state patch rejected: {err}");
                    return Vec::new();
                }
                let mut changed = Vec::new();
                $(if state.$field != previous.$field { changed.push($key); })+
                changed
            }
        }
    };
}

state_patch! {
    state: PlayerState => "state",
    current_time: f64 => "currentTime",
    duration: Option<f64> => "duration",
    buffered: Vec<crate::model::TimeRange> => "buffered",
    volume: f32 => "volume",
    muted: bool => "muted",
    playback_rate: f32 => "playbackRate",
    seeking: bool => "seeking",
    waiting: bool => "waiting",
    ended: bool => "ended",
    can_play: bool => "canPlay",
    can_play_through: bool => "canPlayThrough",
    is_live: bool => "isLive",
    media_info: Option<MediaInfo> => "mediaInfo",
    video_tracks: Vec<TrackDescriptor> => "videoTracks",
    audio_tracks: Vec<TrackDescriptor> => "audioTracks",
    subtitle_tracks: Vec<TrackDescriptor> => "subtitleTracks",
    selected_video_track: Option<TrackId> => "selectedVideoTrack",
    selected_audio_track: Option<TrackId> => "selectedAudioTrack",
    selected_subtitle_track: Option<TrackId> => "selectedSubtitleTrack",
    renderer_type: RendererType => "rendererType",
    rotation: Rotation => "rotation",
    display_size: Option<(u32, u32)> => "displaySize",
    last_error: Option<EngineError> => "lastError",
    playlist: Playlist => "playlist",
    current_playlist_index: Option<usize> => "currentPlaylistIndex",
    playlist_mode: Option<PlaylistMode> => "playlistMode",
}
