//! MediaFox: a framework-agnostic audio/video playback engine.
//!
//! [`engine::Engine`] is the single entry point a host embeds; it composes
//! the reactive [`store::Store`], the [`event_bus::EventBus`], the
//! [`plugin::PluginManager`], renderer/audio output, the decode pipeline,
//! the [`scheduler::SyncScheduler`], the [`transcoder::FallbackTranscoder`],
//! and the [`playlist::PlaylistCoordinator`] into the imperative verbs a
//! host calls (`load`, `play`, `pause`, `seek`, ...). Concrete container
//! demuxing, GPU/GL rendering, and network fetching are host-supplied seams
//! (`model::source::MediaReader`, `decode::Demuxer`, `renderer::Presenter`);
//! this crate owns orchestration, state, and timing, not codecs or I/O.

pub mod audio_output;
pub mod compositor;
pub mod config;
pub mod decode;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod model;
pub mod plugin;
pub mod plugins;
pub mod playlist;
pub mod renderer;
pub mod scheduler;
pub mod store;
pub mod transcoder;

pub use config::{EngineConfig, PreloadMode};
pub use engine::{Engine, LoadOptions, ScreenshotOptions, SeekOptions};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use event_bus::EngineEvent;
