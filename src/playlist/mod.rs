//! Playlist Coordinator: the mode state machine and single prefetch slot
//! sitting on top of this engine's typed `PlaylistItem`/`PlaylistMode`,
//! notifying the Store via an index-change patch whenever the playlist or
//! current index moves.

use std::sync::{Arc, Mutex};

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::event_bus::EventBus;
use crate::model::{PlaylistItem, PlaylistItemSummary, PlaylistMode};

/// Fraction of an item's duration at which the coordinator kicks off the
/// next item's best-effort prefetch.
pub const PREFETCH_THRESHOLD: f64 = 0.8;

/// What the coordinator asks the host/engine to do after deciding a
/// navigation outcome. The coordinator only tracks indices and saved
/// positions; it never touches the decode pipeline itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Load `index` and start it at its saved position.
    Switch { index: usize },
    /// No more items to play; the caller should emit `playlistend`.
    End,
}

/// A queued prefetch request; at most one is ever outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchSlot {
    pub index: usize,
}

struct Inner {
    items: Vec<PlaylistItem>,
    current_index: Option<usize>,
    mode: Option<PlaylistMode>,
    prefetch: Option<PrefetchSlot>,
}

/// Tracks playlist membership, navigation mode, and saved per-item
/// positions. Does not itself decode or play anything — the Engine Facade
/// calls [`PlaylistCoordinator::next`]/[`PlaylistCoordinator::prev`]/etc and
/// acts on the returned [`SwitchOutcome`].
pub struct PlaylistCoordinator {
    inner: Mutex<Inner>,
    event_bus: Arc<EventBus>,
}

impl PlaylistCoordinator {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(Inner { items: Vec::new(), current_index: None, mode: None, prefetch: None }),
            event_bus,
        }
    }

    fn emit_playlist_change(&self, inner: &Inner) {
        let playlist: Vec<PlaylistItemSummary> = inner.items.iter().map(PlaylistItemSummary::from).collect();
        self.event_bus.emit(crate::event_bus::EngineEvent::PlaylistChange { playlist });
    }

    /// Replaces the playlist outright and selects `start_index` as the
    /// initial item.
    pub fn load_playlist(&self, items: Vec<PlaylistItem>, start_index: usize, mode: PlaylistMode) -> EngineResult<SwitchOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if !items.is_empty() && start_index >= items.len() {
            return Err(EngineError::new(ErrorKind::InvalidState, "start index out of bounds for the new playlist"));
        }
        inner.items = items;
        inner.mode = Some(mode);
        inner.prefetch = None;
        inner.current_index = if inner.items.is_empty() { None } else { Some(start_index) };
        self.emit_playlist_change(&inner);
        Ok(match inner.current_index {
            Some(index) => SwitchOutcome::Switch { index },
            None => SwitchOutcome::End,
        })
    }

    pub fn mode(&self) -> Option<PlaylistMode> {
        self.inner.lock().unwrap().mode
    }

    pub fn set_mode(&self, mode: Option<PlaylistMode>) {
        self.inner.lock().unwrap().mode = mode;
    }

    pub fn current_index(&self) -> Option<usize> {
        self.inner.lock().unwrap().current_index
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    pub fn summaries(&self) -> Vec<PlaylistItemSummary> {
        self.inner.lock().unwrap().items.iter().map(PlaylistItemSummary::from).collect()
    }

    /// The saved (or default zero) resume position for `index`, if it exists.
    pub fn saved_position_of(&self, index: usize) -> Option<f64> {
        self.inner.lock().unwrap().items.get(index).map(|item| item.saved_position.unwrap_or(0.0))
    }

    /// Runs `f` against the `MediaSource` at `index` while holding the lock,
    /// so the Engine Facade can build a demuxer from it without needing to
    /// clone or take ownership of a reader the coordinator still owns.
    pub fn with_item_source<R>(&self, index: usize, f: impl FnOnce(&crate::model::MediaSource) -> R) -> Option<R> {
        let inner = self.inner.lock().unwrap();
        inner.items.get(index).map(|item| f(&item.source))
    }

    fn next_index_for_mode(mode: Option<PlaylistMode>, current: usize, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match mode {
            None | Some(PlaylistMode::Manual) | Some(PlaylistMode::Sequential) => {
                if current + 1 < len {
                    Some(current + 1)
                } else {
                    None
                }
            }
            Some(PlaylistMode::Repeat) => Some((current + 1) % len),
            Some(PlaylistMode::RepeatOne) => Some(current),
        }
    }

    fn prev_index_for_mode(mode: Option<PlaylistMode>, current: usize, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match mode {
            None | Some(PlaylistMode::Manual) | Some(PlaylistMode::Sequential) => {
                if current > 0 {
                    Some(current - 1)
                } else {
                    None
                }
            }
            Some(PlaylistMode::Repeat) => Some((current + len - 1) % len),
            Some(PlaylistMode::RepeatOne) => Some(current),
        }
    }

    /// Saves `current_time` against the item we're switching away from, and
    /// emits `playlistitemchange` for the item we're switching to.
    fn switch_to(&self, inner: &mut Inner, outgoing_time: Option<f64>, target: usize) -> SwitchOutcome {
        let previous_index = inner.current_index;
        if let (Some(time), Some(previous)) = (outgoing_time, previous_index) {
            if let Some(item) = inner.items.get_mut(previous) {
                item.saved_position = Some(time);
            }
        }
        inner.current_index = Some(target);
        inner.prefetch = None;
        if let Some(item) = inner.items.get(target) {
            let summary = PlaylistItemSummary::from(item);
            self.event_bus.emit(crate::event_bus::EngineEvent::PlaylistItemChange {
                index: target,
                item: summary,
                previous_index,
            });
        }
        SwitchOutcome::Switch { index: target }
    }

    /// Advances per the current mode, saving `outgoing_time` against the
    /// item being left.
    pub fn next(&self, outgoing_time: f64) -> SwitchOutcome {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.items.len();
        let Some(current) = inner.current_index else { return SwitchOutcome::End };
        match Self::next_index_for_mode(inner.mode, current, len) {
            Some(target) => self.switch_to(&mut inner, Some(outgoing_time), target),
            None => {
                self.event_bus.emit(crate::event_bus::EngineEvent::PlaylistEnd);
                SwitchOutcome::End
            }
        }
    }

    pub fn prev(&self, outgoing_time: f64) -> SwitchOutcome {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.items.len();
        let Some(current) = inner.current_index else { return SwitchOutcome::End };
        match Self::prev_index_for_mode(inner.mode, current, len) {
            Some(target) => self.switch_to(&mut inner, Some(outgoing_time), target),
            None => SwitchOutcome::End,
        }
    }

    pub fn jump_to(&self, index: usize, outgoing_time: f64) -> EngineResult<SwitchOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if index >= inner.items.len() {
            return Err(EngineError::new(ErrorKind::InvalidState, "playlist index out of bounds"));
        }
        Ok(self.switch_to(&mut inner, Some(outgoing_time), index))
    }

    /// Handles an `ended` event: sequential advances until a candidate is
    /// found (or the list is exhausted), repeat wraps,
    /// repeat-one signals the caller to seek to zero and keep playing,
    /// manual/null just end.
    pub fn handle_ended(&self, outgoing_time: f64) -> SwitchOutcome {
        let mode = self.mode();
        if mode == Some(PlaylistMode::RepeatOne) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(current) = inner.current_index {
                if let Some(item) = inner.items.get_mut(current) {
                    item.saved_position = Some(0.0);
                }
                return SwitchOutcome::Switch { index: current };
            }
            return SwitchOutcome::End;
        }
        self.next(outgoing_time)
    }

    /// Inserts `item` at `insert_index` (defaulting to the end), shifting
    /// `current_index` forward when the insertion lands at or before it.
    pub fn add(&self, item: PlaylistItem, insert_index: Option<usize>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let index = insert_index.unwrap_or(inner.items.len()).min(inner.items.len());
        inner.items.insert(index, item);
        if let Some(current) = inner.current_index.as_mut() {
            if index <= *current {
                *current += 1;
            }
        } else {
            inner.current_index = Some(0);
        }
        let summary = PlaylistItemSummary::from(&inner.items[index]);
        self.event_bus.emit(crate::event_bus::EngineEvent::PlaylistAdd { item: summary, index });
        self.emit_playlist_change(&inner);
        index
    }

    /// Removes the item at `index`. If it was the current item, switches to
    /// the new item occupying that slot (or `None` if the list is now
    /// empty); the caller must stop playback in that case.
    pub fn remove(&self, index: usize) -> EngineResult<SwitchOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if index >= inner.items.len() {
            return Err(EngineError::new(ErrorKind::InvalidState, "playlist index out of bounds"));
        }
        let was_current = inner.current_index == Some(index);
        inner.items.remove(index);
        inner.prefetch = None;

        if let Some(current) = inner.current_index.as_mut() {
            if index < *current {
                *current -= 1;
            }
        }
        self.event_bus.emit(crate::event_bus::EngineEvent::PlaylistRemove { index });
        self.emit_playlist_change(&inner);

        if !was_current {
            return Ok(match inner.current_index {
                Some(i) => SwitchOutcome::Switch { index: i },
                None => SwitchOutcome::End,
            });
        }

        let outcome = if inner.items.is_empty() {
            inner.current_index = None;
            SwitchOutcome::End
        } else {
            let new_index = index.min(inner.items.len() - 1);
            inner.current_index = Some(new_index);
            let summary = PlaylistItemSummary::from(&inner.items[new_index]);
            self.event_bus.emit(crate::event_bus::EngineEvent::PlaylistItemChange {
                index: new_index,
                item: summary,
                previous_index: Some(index),
            });
            SwitchOutcome::Switch { index: new_index }
        };
        Ok(outcome)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        inner.current_index = None;
        inner.prefetch = None;
        self.emit_playlist_change(&inner);
    }

    /// Reports playback progress against the current item's duration;
    /// arms the prefetch slot once [`PREFETCH_THRESHOLD`] is crossed in
    /// sequential/repeat modes, and only ever holds the *next* item.
    pub fn report_progress(&self, current_time: f64, duration: Option<f64>) -> Option<PrefetchSlot> {
        let mut inner = self.inner.lock().unwrap();
        let mode = inner.mode;
        if !matches!(mode, Some(PlaylistMode::Sequential) | Some(PlaylistMode::Repeat)) {
            return None;
        }
        let current = inner.current_index?;
        let duration = duration?;
        if duration <= 0.0 || current_time / duration < PREFETCH_THRESHOLD {
            return None;
        }
        let len = inner.items.len();
        let next_index = Self::next_index_for_mode(mode, current, len)?;
        if inner.prefetch.map(|slot| slot.index) == Some(next_index) {
            return None; // already armed
        }
        let slot = PrefetchSlot { index: next_index };
        inner.prefetch = Some(slot);
        Some(slot)
    }

    /// Discards the prefetch slot; called on manual track switch or mode
    /// change, since a stale prefetch for the wrong mode/track is worse
    /// than none.
    pub fn discard_prefetch(&self) {
        self.inner.lock().unwrap().prefetch = None;
    }

    pub fn prefetch_slot(&self) -> Option<PrefetchSlot> {
        self.inner.lock().unwrap().prefetch
    }

    /// Records a load failure for `index`: emits `playlistitemerror`,
    /// clears the saved position, and in sequential
    /// mode returns the next candidate to try.
    pub fn handle_item_load_error(&self, index: usize, error: EngineError) -> Option<SwitchOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.items.get_mut(index) {
            item.saved_position = None;
        }
        self.event_bus.emit(crate::event_bus::EngineEvent::PlaylistItemError { index, error });
        if inner.mode != Some(PlaylistMode::Sequential) {
            return None;
        }
        let len = inner.items.len();
        Self::next_index_for_mode(inner.mode, index, len).map(|target| self.switch_to(&mut inner, None, target))
    }

    /// Persists the current item's position without switching; called on a
    /// steady cadence during playback and on dispose.
    pub fn save_current_position(&self, current_time: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.current_index {
            if let Some(item) = inner.items.get_mut(current) {
                item.saved_position = Some(current_time);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaSource;

    fn item(id: &str) -> PlaylistItem {
        PlaylistItem {
            id: id.to_string(),
            source: MediaSource::Url(format!("https://example.test/{id}.mp4")),
            title: None,
            poster_url: None,
            saved_position: None,
            duration: None,
        }
    }

    fn coordinator_with(mode: PlaylistMode, n: usize) -> PlaylistCoordinator {
        let bus = EventBus::new();
        let coordinator = PlaylistCoordinator::new(bus);
        let items = (0..n).map(|i| item(&format!("t{i}"))).collect();
        coordinator.load_playlist(items, 0, mode).unwrap();
        coordinator
    }

    #[test]
    fn sequential_next_stops_at_the_end() {
        let coordinator = coordinator_with(PlaylistMode::Sequential, 3);
        assert_eq!(coordinator.next(1.0), SwitchOutcome::Switch { index: 1 });
        assert_eq!(coordinator.next(1.0), SwitchOutcome::Switch { index: 2 });
        assert_eq!(coordinator.next(1.0), SwitchOutcome::End);
    }

    #[test]
    fn repeat_wraps_around() {
        let coordinator = coordinator_with(PlaylistMode::Repeat, 2);
        assert_eq!(coordinator.next(1.0), SwitchOutcome::Switch { index: 1 });
        assert_eq!(coordinator.next(1.0), SwitchOutcome::Switch { index: 0 });
    }

    #[test]
    fn repeat_one_stays_on_the_same_index_and_resets_position() {
        let coordinator = coordinator_with(PlaylistMode::RepeatOne, 2);
        match coordinator.handle_ended(9.0) {
            SwitchOutcome::Switch { index } => assert_eq!(index, 0),
            SwitchOutcome::End => panic!("repeat-one must not end"),
        }
        assert_eq!(coordinator.saved_position_of(0), Some(0.0));
    }

    #[test]
    fn outgoing_time_is_saved_before_switching() {
        let coordinator = coordinator_with(PlaylistMode::Sequential, 2);
        coordinator.next(42.0);
        assert_eq!(coordinator.saved_position_of(0), Some(42.0));
    }

    #[test]
    fn removing_the_current_item_switches_to_the_new_occupant() {
        let coordinator = coordinator_with(PlaylistMode::Manual, 3);
        coordinator.jump_to(1, 0.0).unwrap();
        let outcome = coordinator.remove(1).unwrap();
        assert_eq!(outcome, SwitchOutcome::Switch { index: 1 });
    }

    #[test]
    fn removing_the_only_item_ends_and_clears_current_index() {
        let coordinator = coordinator_with(PlaylistMode::Manual, 1);
        let outcome = coordinator.remove(0).unwrap();
        assert_eq!(outcome, SwitchOutcome::End);
        assert_eq!(coordinator.current_index(), None);
    }

    #[test]
    fn adding_before_current_shifts_the_index_forward() {
        let coordinator = coordinator_with(PlaylistMode::Manual, 2);
        coordinator.jump_to(1, 0.0).unwrap();
        coordinator.add(item("new"), Some(0));
        assert_eq!(coordinator.current_index(), Some(2));
    }

    #[test]
    fn prefetch_arms_once_past_threshold_in_sequential_mode_only() {
        let coordinator = coordinator_with(PlaylistMode::Sequential, 2);
        assert_eq!(coordinator.report_progress(50.0, Some(100.0)), None);
        assert_eq!(coordinator.report_progress(85.0, Some(100.0)), Some(PrefetchSlot { index: 1 }));
        // Re-reporting past threshold doesn't re-arm the same slot.
        assert_eq!(coordinator.report_progress(90.0, Some(100.0)), None);
    }

    #[test]
    fn manual_mode_never_arms_prefetch() {
        let coordinator = coordinator_with(PlaylistMode::Manual, 2);
        assert_eq!(coordinator.report_progress(95.0, Some(100.0)), None);
    }

    #[test]
    fn a_manual_switch_discards_the_prefetch_slot() {
        let coordinator = coordinator_with(PlaylistMode::Sequential, 2);
        coordinator.report_progress(90.0, Some(100.0));
        assert!(coordinator.prefetch_slot().is_some());
        coordinator.discard_prefetch();
        assert!(coordinator.prefetch_slot().is_none());
    }

    #[test]
    fn sequential_load_error_advances_to_the_next_candidate() {
        let coordinator = coordinator_with(PlaylistMode::Sequential, 3);
        let outcome = coordinator.handle_item_load_error(0, EngineError::new(ErrorKind::MediaLoadFailed, "boom"));
        assert_eq!(outcome, Some(SwitchOutcome::Switch { index: 1 }));
        assert_eq!(coordinator.saved_position_of(0), None);
    }
}
