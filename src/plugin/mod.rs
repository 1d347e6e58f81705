//! Ordered plugin registry with dependency resolution and per-category hook
//! dispatch.
//!
//! `Store` holds an owning `Arc<PluginManager>` so it can dispatch
//! `before_state_update`/`on_state_change`; `PluginManager` holds only
//! `Weak` references back to the `Store`/`EventBus` it builds
//! [`PluginContext`] from, breaking the cycle the spec calls out explicitly
//! (§3 REDESIGN FLAGS: "Reference-cycle risk (Store ↔ PluginManager ↔
//! Engine)").

mod context;

pub use context::PluginContext;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::event_bus::EventBus;
use crate::model::{Frame, PlayerStateData};
use crate::store::{StatePatch, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    BeforeLoad,
    AfterLoad,
    BeforePlay,
    AfterPlay,
    BeforePause,
    AfterPause,
    BeforeSeek,
    AfterSeek,
    BeforeStop,
    AfterStop,
}

impl LifecycleStage {
    pub fn name(self) -> &'static str {
        match self {
            LifecycleStage::BeforeLoad => "beforeLoad",
            LifecycleStage::AfterLoad => "afterLoad",
            LifecycleStage::BeforePlay => "beforePlay",
            LifecycleStage::AfterPlay => "afterPlay",
            LifecycleStage::BeforePause => "beforePause",
            LifecycleStage::AfterPause => "afterPause",
            LifecycleStage::BeforeSeek => "beforeSeek",
            LifecycleStage::AfterSeek => "afterSeek",
            LifecycleStage::BeforeStop => "beforeStop",
            LifecycleStage::AfterStop => "afterStop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    Cancel,
}

/// A short-lived 2D drawing surface handed to overlay hooks; invalid once
/// the hook returns.
pub trait DrawContext {
    fn draw_rect(&mut self, x: f32, y: f32, w: f32, h: f32, rgba: [u8; 4]);
    fn draw_text(&mut self, x: f32, y: f32, text: &str);
}

/// A single installable unit of behavior. Every hook has a no-op default so
/// a plugin only overrides the categories it actually uses, across five
/// hook categories: lifecycle, render, state, event, and audio.
pub trait Plugin: Send {
    fn name(&self) -> &str;
    fn version(&self) -> Option<&str> {
        None
    }
    fn dependencies(&self) -> &[&str] {
        &[]
    }

    fn install(&mut self, _ctx: &PluginContext) {}
    fn uninstall(&mut self, _ctx: &PluginContext) {}

    // --- Lifecycle -------------------------------------------------------
    /// `args` is mutable so the hook may substitute the operation's
    /// arguments in place; returning `Cancel` aborts the operation.
    fn before_lifecycle(
        &mut self,
        _ctx: &PluginContext,
        _stage: LifecycleStage,
        _args: &mut Value,
    ) -> HookOutcome {
        HookOutcome::Continue
    }
    fn after_lifecycle(&mut self, _ctx: &PluginContext, _stage: LifecycleStage) {}
    fn on_error(&mut self, _ctx: &PluginContext, _error: &EngineError) {}
    fn on_ended(&mut self, _ctx: &PluginContext) {}

    // --- Render ------------------------------------------------------------
    fn before_render(&mut self, _ctx: &PluginContext, _frame: &Frame, _t: f64) {}
    fn transform_frame(&mut self, _ctx: &PluginContext, frame: Frame) -> Frame {
        frame
    }
    fn after_render(&mut self, _ctx: &PluginContext) {}
    /// `None` means this plugin draws no overlay; `Some(z_index)` opts in —
    /// see [`Plugin::render_overlay`] for the actual draw call.
    fn overlay_z_index(&self) -> Option<i32> {
        None
    }
    fn render_overlay(&mut self, _ctx: &PluginContext, _draw: &mut dyn DrawContext, _t: f64, _dim: (u32, u32)) {}

    // --- State ---------------------------------------------------------
    fn before_state_update(&mut self, _ctx: &PluginContext, patch: StatePatch) -> Option<StatePatch> {
        Some(patch)
    }
    fn on_state_change(&mut self, _ctx: &PluginContext, _new: &PlayerStateData, _previous: &PlayerStateData) {}

    // --- Event -----------------------------------------------------------
    fn before_event(&mut self, _ctx: &PluginContext, _topic: &str, _data: &mut Value) -> HookOutcome {
        HookOutcome::Continue
    }
    fn after_event(&mut self, _ctx: &PluginContext, _topic: &str, _data: &Value) {}

    // --- Audio -----------------------------------------------------------
    /// Called once when the audio graph is built. `cpal` has no node-chain
    /// concept to insert into (unlike Web Audio's `GainNode`), so this is a
    /// build notification rather than a chain-splice point.
    fn on_audio_node(&mut self, _ctx: &PluginContext) {}
}

struct PluginSlot {
    name: String,
    plugin: Mutex<Box<dyn Plugin>>,
    state: Mutex<Option<Box<dyn Any + Send>>>,
}

/// Ordered plugin registry. Owns the plugins; handed out to callers as
/// `Arc<PluginManager>` so `Store` (and later the Engine facade) can share
/// it without taking ownership.
pub struct PluginManager {
    self_ref: Weak<PluginManager>,
    slots: Mutex<Vec<PluginSlot>>,
    store: Mutex<Weak<Store>>,
    event_bus: Mutex<Weak<EventBus>>,
}

impl PluginManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            slots: Mutex::new(Vec::new()),
            store: Mutex::new(Weak::new()),
            event_bus: Mutex::new(Weak::new()),
        })
    }

    /// Wires the non-owning back-references used to build [`PluginContext`].
    pub fn attach_context(&self, store: &Arc<Store>, event_bus: &Arc<EventBus>) {
        *self.store.lock().unwrap() = Arc::downgrade(store);
        *self.event_bus.lock().unwrap() = Arc::downgrade(event_bus);
    }

    fn context_for(&self, plugin_name: &str) -> PluginContext {
        PluginContext::new(
            self.self_ref.clone(),
            plugin_name.to_string(),
            self.store.lock().unwrap().clone(),
            self.event_bus.lock().unwrap().clone(),
        )
    }

    /// Installs `plugin` at the end of the registry. Errors (without
    /// installing) if the name is already taken or a declared dependency
    /// isn't already installed — install order is the caller's
    /// responsibility: dependencies are checked, not auto-reordered.
    pub fn install(&self, mut plugin: Box<dyn Plugin>) -> EngineResult<()> {
        let name = plugin.name().to_string();
        let mut slots = self.slots.lock().unwrap();
        if slots.iter().any(|slot| slot.name == name) {
            return Err(EngineError::invalid_state(format!(
                "plugin '{name}' is already installed"
            )));
        }
        for dependency in plugin.dependencies() {
            if !slots.iter().any(|slot| &slot.name == dependency) {
                return Err(EngineError::invalid_state(format!(
                    "plugin '{name}' depends on '{dependency}', which is not installed yet"
                )));
            }
        }
        let ctx = self.context_for(&name);
        guarded(&name, "install", AssertUnwindSafe(|| plugin.install(&ctx)));
        slots.push(PluginSlot {
            name,
            plugin: Mutex::new(plugin),
            state: Mutex::new(None),
        });
        Ok(())
    }

    pub fn uninstall(&self, name: &str) -> EngineResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|slot| slot.name == name)
            .ok_or_else(|| EngineError::invalid_state(format!("plugin '{name}' is not installed")))?;
        let slot = slots.remove(index);
        let ctx = self.context_for(&slot.name);
        let mut plugin = slot.plugin.lock().unwrap();
        guarded(&slot.name, "uninstall", AssertUnwindSafe(|| plugin.uninstall(&ctx)));
        Ok(())
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.slots.lock().unwrap().iter().any(|slot| slot.name == name)
    }

    pub fn installed_names(&self) -> Vec<String> {
        self.slots.lock().unwrap().iter().map(|slot| slot.name.clone()).collect()
    }

    fn for_each_slot(&self, mut f: impl FnMut(&PluginSlot, &PluginContext)) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            let ctx = self.context_for(&slot.name);
            f(slot, &ctx);
        }
    }

    // --- Lifecycle dispatch ---------------------------------------------

    /// Runs `beforeLoad`/`beforePlay`/etc in install order; the first
    /// plugin to return `Cancel` stops the operation and short-circuits
    /// remaining plugins (a hook error never reorders or skips later
    /// plugins, but a *cancel* is a deliberate stop).
    pub fn before_lifecycle(&self, stage: LifecycleStage, args: &mut Value) -> HookOutcome {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            let ctx = self.context_for(&slot.name);
            let mut plugin = slot.plugin.lock().unwrap();
            let outcome = guarded(
                &slot.name,
                stage.name(),
                AssertUnwindSafe(|| plugin.before_lifecycle(&ctx, stage, args)),
            )
            .unwrap_or(HookOutcome::Continue);
            if outcome == HookOutcome::Cancel {
                return HookOutcome::Cancel;
            }
        }
        HookOutcome::Continue
    }

    pub fn after_lifecycle(&self, stage: LifecycleStage) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, stage.name(), AssertUnwindSafe(|| plugin.after_lifecycle(ctx, stage)));
        });
    }

    pub fn on_error(&self, error: &EngineError) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "onError", AssertUnwindSafe(|| plugin.on_error(ctx, error)));
        });
    }

    pub fn on_ended(&self) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "onEnded", AssertUnwindSafe(|| plugin.on_ended(ctx)));
        });
    }

    // --- Render dispatch -------------------------------------------------

    pub fn before_render(&self, frame: &Frame, t: f64) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "beforeRender", AssertUnwindSafe(|| plugin.before_render(ctx, frame, t)));
        });
    }

    pub fn transform_frame(&self, mut frame: Frame) -> Frame {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            let ctx = self.context_for(&slot.name);
            let mut plugin = slot.plugin.lock().unwrap();
            match guarded(&slot.name, "transformFrame", AssertUnwindSafe(|| plugin.transform_frame(&ctx, frame))) {
                Some(next) => frame = next,
                None => return frame_placeholder_after_panic(),
            }
        }
        frame
    }

    pub fn after_render(&self) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "afterRender", AssertUnwindSafe(|| plugin.after_render(ctx)));
        });
    }

    /// Collects overlay draw calls sorted by zIndex ascending, partitioning
    /// at 0 so negative-zIndex overlays can be drawn under the frame by the
    /// caller.
    pub fn render_overlays(&self, draw: &mut dyn DrawContext, t: f64, dim: (u32, u32)) {
        let ordered: Vec<usize> = {
            let slots = self.slots.lock().unwrap();
            let mut indexed: Vec<(usize, i32)> = slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.plugin.lock().unwrap().overlay_z_index().map(|z| (i, z)))
                .collect();
            indexed.sort_by_key(|(_, z)| *z);
            indexed.into_iter().map(|(i, _)| i).collect()
        };
        let slots = self.slots.lock().unwrap();
        for index in ordered {
            let slot = &slots[index];
            let ctx = self.context_for(&slot.name);
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "onOverlay", AssertUnwindSafe(|| plugin.render_overlay(&ctx, draw, t, dim)));
        }
    }

    // --- State dispatch --------------------------------------------------

    /// Threads `patch` through every plugin's `beforeStateUpdate` in
    /// install order; `None` means a plugin cancelled the whole update.
    pub fn before_state_update(&self, patch: &StatePatch) -> Option<StatePatch> {
        let mut current = patch.clone();
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            let ctx = self.context_for(&slot.name);
            let mut plugin = slot.plugin.lock().unwrap();
            let taken = std::mem::take(&mut current);
            match guarded(
                &slot.name,
                "beforeStateUpdate",
                AssertUnwindSafe(|| plugin.before_state_update(&ctx, taken.clone())),
            ) {
                Some(Some(modified)) => current = modified,
                Some(None) => return None,
                None => current = taken, // panicked: leave the patch unchanged
            }
        }
        Some(current)
    }

    pub fn on_state_change(&self, new: &PlayerStateData, previous: &PlayerStateData) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "onStateChange", AssertUnwindSafe(|| plugin.on_state_change(ctx, new, previous)));
        });
    }

    // --- Event dispatch ----------------------------------------------------

    pub fn before_event(&self, topic: &str, data: &mut Value) -> HookOutcome {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            let ctx = self.context_for(&slot.name);
            let mut plugin = slot.plugin.lock().unwrap();
            let outcome = guarded(
                &slot.name,
                "beforeEvent",
                AssertUnwindSafe(|| plugin.before_event(&ctx, topic, data)),
            )
            .unwrap_or(HookOutcome::Continue);
            if outcome == HookOutcome::Cancel {
                return HookOutcome::Cancel;
            }
        }
        HookOutcome::Continue
    }

    pub fn after_event(&self, topic: &str, data: &Value) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "afterEvent", AssertUnwindSafe(|| plugin.after_event(ctx, topic, data)));
        });
    }

    // --- Audio dispatch ----------------------------------------------------

    pub fn on_audio_node(&self) {
        self.for_each_slot(|slot, ctx| {
            let mut plugin = slot.plugin.lock().unwrap();
            guarded(&slot.name, "onAudioNode", AssertUnwindSafe(|| plugin.on_audio_node(ctx)));
        });
    }

    // --- Per-plugin state slots -------------------------------------------

    fn slot_state<T, R>(&self, name: &str, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> Option<R> {
        let slots = self.slots.lock().unwrap();
        slots.iter().find(|slot| slot.name == name).map(|slot| f(&mut slot.state.lock().unwrap()))
    }

    pub fn get_plugin_state<T: Clone + Send + 'static>(&self, name: &str) -> Option<T> {
        self.slot_state::<T, _>(name, |slot| slot.as_ref().and_then(|boxed| boxed.downcast_ref::<T>().cloned()))
            .flatten()
    }

    pub fn set_plugin_state<T: Send + 'static>(&self, name: &str, value: T) {
        self.slot_state::<T, _>(name, |slot| {
            *slot = Some(Box::new(value));
        });
    }
}

fn frame_placeholder_after_panic() -> Frame {
    Frame::new(0.0, 0.0, crate::model::PixelFormat::Rgba8, 0, 0, Vec::new())
}

/// Runs `f`, catching any panic and logging it with the plugin/hook name.
/// Hook errors are caught per plugin and logged rather than propagated, so
/// one faulty plugin never takes down the others or the engine.
fn guarded<R>(plugin_name: &str, hook: &str, f: impl FnOnce() -> R + std::panic::UnwindSafe) -> Option<R> {
    match std::panic::catch_unwind(f) {
        Ok(value) => Some(value),
        Err(payload) => {
            let message = panic_message(&payload);
            log::error!("plugin {plugin_name} hook {hook} failed: {message}");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn install(&mut self, _ctx: &PluginContext) {
            self.order.lock().unwrap().push(self.name);
        }
    }

    struct DependsOn {
        name: &'static str,
        dep: &'static str,
    }

    impl Plugin for DependsOn {
        fn name(&self) -> &str {
            self.name
        }
        fn dependencies(&self) -> &[&str] {
            std::slice::from_ref(&self.dep)
        }
    }

    struct Panicky;
    impl Plugin for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }
        fn before_state_update(&mut self, _ctx: &PluginContext, _patch: StatePatch) -> Option<StatePatch> {
            panic!("boom");
        }
    }

    struct Counter {
        hits: Arc<AtomicUsize>,
    }
    impl Plugin for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn before_state_update(&mut self, _ctx: &PluginContext, patch: StatePatch) -> Option<StatePatch> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Some(patch)
        }
    }

    #[test]
    fn install_order_determines_hook_order() {
        let manager = PluginManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        manager
            .install(Box::new(Recorder { name: "a", order: Arc::clone(&order) }))
            .unwrap();
        manager
            .install(Box::new(Recorder { name: "b", order: Arc::clone(&order) }))
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn installing_before_a_dependency_is_rejected() {
        let manager = PluginManager::new();
        let err = manager.install(Box::new(DependsOn { name: "child", dep: "parent" })).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidState);
    }

    #[test]
    fn installing_after_the_dependency_succeeds() {
        let manager = PluginManager::new();
        manager.install(Box::new(Recorder { name: "parent", order: Arc::new(Mutex::new(Vec::new())) })).unwrap();
        manager.install(Box::new(DependsOn { name: "child", dep: "parent" })).unwrap();
        assert!(manager.is_installed("child"));
    }

    #[test]
    fn a_panicking_hook_does_not_stop_later_plugins() {
        let manager = PluginManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        manager.install(Box::new(Panicky)).unwrap();
        manager.install(Box::new(Counter { hits: Arc::clone(&hits) })).unwrap();
        let result = manager.before_state_update(&StatePatch::default());
        assert!(result.is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    struct Overlay {
        name: &'static str,
        z: i32,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Plugin for Overlay {
        fn name(&self) -> &str {
            self.name
        }
        fn overlay_z_index(&self) -> Option<i32> {
            Some(self.z)
        }
        fn render_overlay(&mut self, _ctx: &PluginContext, _draw: &mut dyn DrawContext, _t: f64, _dim: (u32, u32)) {
            self.order.lock().unwrap().push(self.name);
        }
    }

    struct NullDraw;
    impl DrawContext for NullDraw {
        fn draw_rect(&mut self, _x: f32, _y: f32, _w: f32, _h: f32, _rgba: [u8; 4]) {}
        fn draw_text(&mut self, _x: f32, _y: f32, _text: &str) {}
    }

    #[test]
    fn overlays_draw_in_ascending_z_order_not_registration_order() {
        let manager = PluginManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        // Installed out of z order: "front" (z=5) before "back" (z=-1) before
        // "mid" (z=0); the registration-index order would be front,back,mid.
        manager
            .install(Box::new(Overlay { name: "front", z: 5, order: Arc::clone(&order) }))
            .unwrap();
        manager
            .install(Box::new(Overlay { name: "back", z: -1, order: Arc::clone(&order) }))
            .unwrap();
        manager
            .install(Box::new(Overlay { name: "mid", z: 0, order: Arc::clone(&order) }))
            .unwrap();
        let mut draw = NullDraw;
        manager.render_overlays(&mut draw, 0.0, (100, 100));
        assert_eq!(*order.lock().unwrap(), vec!["back", "mid", "front"]);
    }

    #[test]
    fn plugin_state_slots_are_isolated_per_plugin() {
        let manager = PluginManager::new();
        manager.install(Box::new(Recorder { name: "a", order: Arc::new(Mutex::new(Vec::new())) })).unwrap();
        manager.install(Box::new(Recorder { name: "b", order: Arc::new(Mutex::new(Vec::new())) })).unwrap();
        manager.set_plugin_state("a", 7u32);
        assert_eq!(manager.get_plugin_state::<u32>("a"), Some(7));
        assert_eq!(manager.get_plugin_state::<u32>("b"), None);
    }
}
