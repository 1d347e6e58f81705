//! Batched, observable state store with plugin interception.
//!
//! A `tokio::sync::broadcast<Message>`-style fan-out, but funneled through a
//! single mutation point (`set_state`) that batches same-turn updates into
//! one notification — a microtask-coalescing idiom realized with a
//! scheduled flush rather than an actual microtask queue.

mod patch;

pub use patch::StatePatch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::model::PlayerStateData;
use crate::plugin::PluginManager;

type Listener = Box<dyn FnMut(&PlayerStateData) + Send>;

struct Inner {
    state: PlayerStateData,
    pending: StatePatch,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

/// The reactive state container. `get_state`/`subscribe`/`set_state`/`reset`
/// plus the kind-specific convenience setters built on top of them.
pub struct Store {
    inner: Mutex<Inner>,
    plugins: Mutex<Option<Arc<PluginManager>>>,
    flush_generation: AtomicU64,
}

/// Handle returned by [`Store::subscribe`]; dropping it does not
/// unsubscribe — call [`Subscription::unsubscribe`] explicitly.
pub struct Subscription {
    store: Arc<Store>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.store.remove_listener(self.id);
    }
}

impl Store {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: PlayerStateData::initial(),
                pending: StatePatch::default(),
                listeners: Vec::new(),
                next_listener_id: 1,
            }),
            plugins: Mutex::new(None),
            flush_generation: AtomicU64::new(0),
        })
    }

    /// Wires the Plugin Manager so `before_state_update`/`on_state_change`
    /// hooks run around every flush. Non-owning: the Store never
    /// outlives-manages the manager's lifecycle.
    pub fn attach_plugins(&self, plugins: Arc<PluginManager>) {
        *self.plugins.lock().unwrap() = Some(plugins);
    }

    pub fn get_state(&self) -> PlayerStateData {
        self.inner.lock().unwrap().state.clone()
    }

    /// Registers `listener` and immediately invokes it with the current
    /// state.
    pub fn subscribe(
        self: &Arc<Self>,
        mut listener: impl FnMut(&PlayerStateData) + Send + 'static,
    ) -> Subscription {
        let snapshot = self.get_state();
        listener(&snapshot);
        let mut guard = self.inner.lock().unwrap();
        let id = guard.next_listener_id;
        guard.next_listener_id += 1;
        guard.listeners.push((id, Box::new(listener)));
        drop(guard);
        Subscription {
            store: Arc::clone(self),
            id,
        }
    }

    fn remove_listener(&self, id: u64) {
        self.inner.lock().unwrap().listeners.retain(|(lid, _)| *lid != id);
    }

    /// Merges `patch` into the pending batch and schedules a flush on the
    /// runtime's next turn. Multiple calls within the same turn coalesce
    /// into a single notification.
    pub fn set_state(self: &Arc<Self>, patch: StatePatch) {
        {
            let mut guard = self.inner.lock().unwrap();
            guard.pending.merge_from(patch);
        }
        self.schedule_flush();
    }

    fn schedule_flush(self: &Arc<Self>) {
        let generation = self.flush_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    // Yield once so same-turn `set_state` calls still queued
                    // on this task get a chance to merge before we flush —
                    // the Rust analogue of a JS microtask boundary.
                    tokio::task::yield_now().await;
                    this.flush_if_current(generation);
                });
            }
            Err(_) => {
                // No runtime reachable (e.g. a synchronous test harness) —
                // flush immediately rather than silently dropping the update.
                self.flush_if_current(generation);
            }
        }
    }

    fn flush_if_current(&self, generation: u64) {
        if self.flush_generation.load(Ordering::SeqCst) == generation {
            self.flush();
        }
    }

    /// Forces an immediate synchronous flush, bypassing the runtime-turn
    /// scheduling. Exposed for deterministic tests behind the `test-util`
    /// feature, the Rust analogue of a test-mode `flushNow()`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn flush_now(&self) {
        self.flush_generation.fetch_add(1, Ordering::SeqCst);
        self.flush();
    }

    fn flush(&self) {
        let plugins = self.plugins.lock().unwrap().clone();

        let mut guard = self.inner.lock().unwrap();
        if guard.pending.is_empty() {
            return;
        }
        let mut patch = std::mem::take(&mut guard.pending);
        drop(guard);

        if let Some(plugins) = &plugins {
            match plugins.before_state_update(&patch) {
                Some(modified) => patch = modified,
                None => return, // a plugin cancelled the update entirely
            }
        }

        let mut guard = self.inner.lock().unwrap();
        let previous = guard.state.clone();
        let changed = patch.apply_to(&mut guard.state, enforce_invariants);
        if changed.is_empty() {
            return;
        }
        let snapshot = guard.state.clone();
        let mut listeners: Vec<&mut Listener> = guard.listeners.iter_mut().map(|(_, l)| l).collect();
        for listener in listeners.iter_mut() {
            listener(&snapshot);
        }
        drop(guard);

        if let Some(plugins) = &plugins {
            plugins.on_state_change(&snapshot, &previous);
        }
    }

    /// Returns the store to its initial, pre-load snapshot.
    pub fn reset(self: &Arc<Self>) {
        let mut guard = self.inner.lock().unwrap();
        guard.state = PlayerStateData::initial();
        guard.pending = StatePatch::default();
        drop(guard);
        self.flush_generation.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.get_state();
        let mut guard = self.inner.lock().unwrap();
        for (_, listener) in guard.listeners.iter_mut() {
            listener(&snapshot);
        }
    }
}

/// Enforces the setState invariants on the about-to-be-applied
/// patch before it lands in `state`. Returns `Err` (`InvalidState`) instead
/// of silently coercing when a selected-track id isn't in its list.
fn enforce_invariants(state: &mut PlayerStateData) -> Result<(), EngineError> {
    use crate::model::PlayerState;

    if state.last_error.is_some() && state.state != PlayerState::Error {
        state.state = PlayerState::Error;
    }
    if state.state == PlayerState::Playing {
        state.ended = false;
    }
    if !state.selected_tracks_are_consistent() {
        return Err(EngineError::invalid_state(
            "selected track id is not present in its track list",
        ));
    }
    Ok(())
}
