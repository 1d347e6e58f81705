//! The non-owning handle passed to every plugin hook.

use std::sync::Weak;

use crate::event_bus::{EngineEvent, EventBus};
use crate::model::PlayerStateData;
use crate::store::Store;

use super::PluginManager;

/// Everything a plugin hook is allowed to touch: the current state snapshot,
/// the event bus, its own isolated state slot, and read-only access to
/// other plugins' slots (`getPlugin(name)` inter-plugin sharing). Holds
/// only `Weak` references —
/// a `PluginContext` outliving the engine simply stops working rather than
/// keeping it alive.
pub struct PluginContext {
    manager: Weak<PluginManager>,
    plugin_name: String,
    store: Weak<Store>,
    event_bus: Weak<EventBus>,
}

impl PluginContext {
    pub(super) fn new(
        manager: Weak<PluginManager>,
        plugin_name: String,
        store: Weak<Store>,
        event_bus: Weak<EventBus>,
    ) -> Self {
        Self { manager, plugin_name, store, event_bus }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// The current state snapshot, or `None` if the owning engine has
    /// already been dropped.
    pub fn get_state(&self) -> Option<PlayerStateData> {
        self.store.upgrade().map(|store| store.get_state())
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(bus) = self.event_bus.upgrade() {
            bus.emit(event);
        }
    }

    pub fn get_plugin_state<T: Clone + Send + 'static>(&self) -> Option<T> {
        self.manager.upgrade().and_then(|manager| manager.get_plugin_state(&self.plugin_name))
    }

    pub fn set_plugin_state<T: Send + 'static>(&self, value: T) {
        if let Some(manager) = self.manager.upgrade() {
            manager.set_plugin_state(&self.plugin_name, value);
        }
    }

    /// Reads another installed plugin's state slot by name.
    pub fn get_plugin_state_of<T: Clone + Send + 'static>(&self, name: &str) -> Option<T> {
        self.manager.upgrade().and_then(|manager| manager.get_plugin_state(name))
    }

    pub fn is_plugin_installed(&self, name: &str) -> bool {
        self.manager.upgrade().map_or(false, |manager| manager.is_installed(name))
    }
}
