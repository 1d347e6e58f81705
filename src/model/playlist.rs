//! Playlist data types shared between the Store and the Playlist Coordinator.

use serde::{Deserialize, Serialize};

use super::source::MediaSource;

/// One entry in a playlist.
pub struct PlaylistItem {
    pub id: String,
    pub source: MediaSource,
    pub title: Option<String>,
    pub poster_url: Option<String>,
    /// Last known `current_time` when the coordinator switched away from
    /// this item, so it can resume on return.
    pub saved_position: Option<f64>,
    /// Populated after the first metadata load of this item.
    pub duration: Option<f64>,
}

impl std::fmt::Debug for PlaylistItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaylistItem")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("saved_position", &self.saved_position)
            .field("duration", &self.duration)
            .finish()
    }
}

/// Lightweight, `Clone`-able summary of a playlist item for observers that
/// don't need the underlying `MediaSource` (e.g. `PlayerStateData`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistItemSummary {
    pub id: String,
    pub title: Option<String>,
    pub poster_url: Option<String>,
    pub saved_position: Option<f64>,
    pub duration: Option<f64>,
}

impl From<&PlaylistItem> for PlaylistItemSummary {
    fn from(item: &PlaylistItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            poster_url: item.poster_url.clone(),
            saved_position: item.saved_position,
            duration: item.duration,
        }
    }
}

/// The observable playlist surfaced in `PlayerStateData`: a plain snapshot,
/// never the owning `Vec<PlaylistItem>` (which lives in the coordinator).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub items: Vec<PlaylistItemSummary>,
}

/// Navigation mode for the Playlist Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaylistMode {
    Manual,
    Sequential,
    Repeat,
    RepeatOne,
}
