//! Built-in, optional plugins shipped alongside the engine rather than
//! required by it — today just OS media-control integration, gated behind
//! the `system-media-controls` feature so the `souvlaki` dependency is
//! never pulled into a build that doesn't want it.

#[cfg(feature = "system-media-controls")]
pub mod system_media_controls;

#[cfg(feature = "system-media-controls")]
pub use system_media_controls::SystemMediaControlsPlugin;
