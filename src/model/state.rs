//! The single observable snapshot the engine publishes through the Store.

use serde::{Deserialize, Serialize};

use super::playlist::{Playlist, PlaylistMode};
use super::source::MediaInfo;
use super::track::{Rotation, TrackDescriptor, TrackId};
use crate::error::EngineError;
use crate::renderer::RendererType;

/// A half-open time interval, both ends finite, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        debug_assert!(start <= end, "TimeRange start must not exceed end");
        Self { start, end }
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }
}

/// Checks that `ranges` are sorted and pairwise disjoint.
pub fn buffered_ranges_are_well_formed(ranges: &[TimeRange]) -> bool {
    ranges.windows(2).all(|pair| pair[0].end <= pair[1].start)
        && ranges.iter().all(|r| r.start <= r.end)
}

/// Discriminated playback state. Transitions are monotonic per load session:
/// `Idle -> Loading -> Ready -> (Playing <-> Paused)* -> Ended`, with `Error`
/// reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Ended,
    Error,
}

impl PlayerState {
    /// Whether `next` is a legal transition away from `self`, per the
    /// monotonic playback state machine. `Error` is reachable from
    /// any state; a fresh `Loading` resets any prior session (new load).
    pub fn can_transition_to(self, next: PlayerState) -> bool {
        use PlayerState::*;
        if next == Error || next == Loading || self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Loading)
                | (Loading, Ready)
                | (Loading, Error)
                | (Ready, Playing)
                | (Ready, Paused)
                | (Playing, Paused)
                | (Paused, Playing)
                | (Playing, Ended)
                | (Paused, Ended)
                | (Ended, Playing)
                | (Ended, Paused)
        )
    }
}

/// The single observable snapshot carried by the [`crate::store::Store`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStateData {
    pub state: PlayerState,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub buffered: Vec<TimeRange>,
    pub volume: f32,
    pub muted: bool,
    pub playback_rate: f32,
    pub seeking: bool,
    pub waiting: bool,
    pub ended: bool,
    pub can_play: bool,
    pub can_play_through: bool,
    pub is_live: bool,
    pub media_info: Option<MediaInfo>,
    pub video_tracks: Vec<TrackDescriptor>,
    pub audio_tracks: Vec<TrackDescriptor>,
    pub subtitle_tracks: Vec<TrackDescriptor>,
    pub selected_video_track: Option<TrackId>,
    pub selected_audio_track: Option<TrackId>,
    pub selected_subtitle_track: Option<TrackId>,
    pub renderer_type: RendererType,
    pub rotation: Rotation,
    pub display_size: Option<(u32, u32)>,
    pub last_error: Option<EngineError>,
    pub playlist: Playlist,
    pub current_playlist_index: Option<usize>,
    /// `None` is the "no mode" state (no playlist loaded yet); behaves
    /// like `Manual` for `ended` handling.
    pub playlist_mode: Option<PlaylistMode>,
}

impl PlayerStateData {
    /// `playing`/`paused` are computed rather than stored: the rule that
    /// they may never disagree becomes structurally impossible to violate
    /// once it is not a settable field at all. Recorded as a REDESIGN in
    /// DESIGN.md.
    pub fn playing(&self) -> bool {
        self.state == PlayerState::Playing
    }

    pub fn paused(&self) -> bool {
        matches!(
            self.state,
            PlayerState::Ready | PlayerState::Paused | PlayerState::Ended
        )
    }

    pub fn initial() -> Self {
        Self {
            state: PlayerState::Idle,
            current_time: 0.0,
            duration: None,
            buffered: Vec::new(),
            volume: 1.0,
            muted: false,
            playback_rate: 1.0,
            seeking: false,
            waiting: false,
            ended: false,
            can_play: false,
            can_play_through: false,
            is_live: false,
            media_info: None,
            video_tracks: Vec::new(),
            audio_tracks: Vec::new(),
            subtitle_tracks: Vec::new(),
            selected_video_track: None,
            selected_audio_track: None,
            selected_subtitle_track: None,
            renderer_type: RendererType::Software,
            rotation: Rotation::Deg0,
            display_size: None,
            last_error: None,
            playlist: Playlist::default(),
            current_playlist_index: None,
            playlist_mode: None,
        }
    }

    /// Checks the selected-track invariant: each selected id is `None` or
    /// present in the matching list.
    pub fn selected_tracks_are_consistent(&self) -> bool {
        let video_ok = self
            .selected_video_track
            .as_ref()
            .map_or(true, |id| self.video_tracks.iter().any(|t| &t.id == id));
        let audio_ok = self
            .selected_audio_track
            .as_ref()
            .map_or(true, |id| self.audio_tracks.iter().any(|t| &t.id == id));
        let subtitle_ok = self
            .selected_subtitle_track
            .as_ref()
            .map_or(true, |id| self.subtitle_tracks.iter().any(|t| &t.id == id));
        video_ok && audio_ok && subtitle_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_transitions_allow_the_documented_path() {
        assert!(PlayerState::Idle.can_transition_to(PlayerState::Loading));
        assert!(PlayerState::Loading.can_transition_to(PlayerState::Ready));
        assert!(PlayerState::Ready.can_transition_to(PlayerState::Playing));
        assert!(PlayerState::Playing.can_transition_to(PlayerState::Paused));
        assert!(PlayerState::Paused.can_transition_to(PlayerState::Playing));
        assert!(PlayerState::Playing.can_transition_to(PlayerState::Ended));
    }

    #[test]
    fn error_reachable_from_any_state() {
        for state in [
            PlayerState::Idle,
            PlayerState::Loading,
            PlayerState::Ready,
            PlayerState::Playing,
            PlayerState::Paused,
            PlayerState::Ended,
        ] {
            assert!(state.can_transition_to(PlayerState::Error));
        }
    }

    #[test]
    fn idle_cannot_jump_straight_to_playing() {
        assert!(!PlayerState::Idle.can_transition_to(PlayerState::Playing));
    }

    #[test]
    fn playing_and_paused_are_mutually_exclusive_by_construction() {
        let mut data = PlayerStateData::initial();
        data.state = PlayerState::Playing;
        assert!(data.playing());
        assert!(!data.paused());
        data.state = PlayerState::Paused;
        assert!(!data.playing());
        assert!(data.paused());
    }

    #[test]
    fn buffered_ranges_reject_overlap() {
        let ok = vec![TimeRange::new(0.0, 1.0), TimeRange::new(1.0, 2.0)];
        assert!(buffered_ranges_are_well_formed(&ok));
        let overlapping = vec![TimeRange::new(0.0, 1.5), TimeRange::new(1.0, 2.0)];
        assert!(!buffered_ranges_are_well_formed(&overlapping));
    }

    #[test]
    fn selected_track_must_appear_in_matching_list() {
        let mut data = PlayerStateData::initial();
        data.selected_audio_track = Some("missing".into());
        assert!(!data.selected_tracks_are_consistent());
    }
}
