//! Engine construction options and their validated/clamped defaults.
//!
//! `EngineConfig` models the declarative, serializable half of the option
//! table (volume/muted/rate/preload/cross-origin/cache-size/renderer
//! preference), the same way a persisted app-preferences struct would. The
//! host-object half of the table (`renderTarget`,
//! `audioContext`, `fallbackDecoder`) isn't serde-able and is passed to
//! `Engine::new` directly instead of threaded through this struct.

use serde::{Deserialize, Serialize};

use crate::renderer::RendererType;

/// Initial demand level for a loaded source, mirrored from the HTML
/// `<video preload>` attribute this crate's option table borrows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadMode {
    None,
    Metadata,
    Auto,
}

impl Default for PreloadMode {
    fn default() -> Self {
        PreloadMode::Metadata
    }
}

/// Construction-time options, all individually optional at the call site;
/// defaults match the documented fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_playback_rate")]
    pub playback_rate: f32,
    #[serde(default)]
    pub autoplay: bool,
    #[serde(default)]
    pub preload: PreloadMode,
    #[serde(default)]
    pub cross_origin: Option<String>,
    #[serde(default)]
    pub max_cache_size: Option<u64>,
    /// Preferred backend; the Renderer Switchboard still negotiates
    /// capability and falls back on failure regardless of this hint.
    #[serde(default)]
    pub preferred_renderer: Option<RendererType>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            muted: false,
            playback_rate: default_playback_rate(),
            autoplay: false,
            preload: PreloadMode::default(),
            cross_origin: None,
            max_cache_size: None,
            preferred_renderer: None,
        }
    }
}

fn default_volume() -> f32 {
    1.0
}

fn default_playback_rate() -> f32 {
    1.0
}

/// Clamps every field to its documented domain before it's trusted.
/// Unlike a persisted config this never rejects the input; a config with
/// `volume = 4.0` is brought back in range rather than failing construction.
pub fn sanitize_config(config: EngineConfig) -> EngineConfig {
    EngineConfig {
        volume: config.volume.clamp(0.0, 1.0),
        muted: config.muted,
        playback_rate: if config.playback_rate > 0.0 { config.playback_rate } else { default_playback_rate() },
        autoplay: config.autoplay,
        preload: config.preload,
        cross_origin: config.cross_origin,
        max_cache_size: config.max_cache_size,
        preferred_renderer: config.preferred_renderer,
    }
}

/// Parses a TOML document into an `EngineConfig`, logging and dropping
/// unrecognized keys rather than failing the parse: a forward-compatible
/// host config shouldn't hard-fail on an unknown option.
pub fn load_from_toml(contents: &str) -> EngineConfig {
    match toml::from_str::<toml::Value>(contents) {
        Ok(toml::Value::Table(table)) => {
            let known = [
                "volume",
                "muted",
                "playback_rate",
                "autoplay",
                "preload",
                "cross_origin",
                "max_cache_size",
                "preferred_renderer",
            ];
            for key in table.keys() {
                if !known.contains(&key.as_str()) {
                    log::warn!("ignoring unrecognized engine config key: {key}");
                }
            }
            let reparsed: EngineConfig = toml::Value::Table(table)
                .try_into()
                .unwrap_or_else(|err| {
                    log::warn!("engine config failed to parse, falling back to defaults: {err}");
                    EngineConfig::default()
                });
            sanitize_config(reparsed)
        }
        Ok(_) => {
            log::warn!("engine config root must be a table, falling back to defaults");
            EngineConfig::default()
        }
        Err(err) => {
            log::warn!("engine config is not valid TOML, falling back to defaults: {err}");
            EngineConfig::default()
        }
    }
}
