//! OS media-control integration (MPRIS/SMTC/Now Playing) as an ordinary
//! [`Plugin`], bridging `souvlaki` to playback commands through this
//! crate's plugin hook dispatch rather than a dedicated bus-message loop.
//!
//! This plugin has no loop of its own: the OS callback (on whatever thread
//! `souvlaki` invokes it on) calls straight back into
//! the engine's public verbs, and `on_state_change` republishes playback
//! state/metadata whenever the Store changes.

use std::sync::Weak;
use std::time::Duration;

use log::warn;
use souvlaki::{MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, PlatformConfig, SeekDirection};

use crate::engine::{Engine, SeekOptions};
use crate::model::PlayerStateData;
use crate::plugin::{Plugin, PluginContext};

const DISPLAY_NAME: &str = "MediaFox";
const DBUS_NAME: &str = "mediafox";
const SEEK_STEP_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishedPlayback {
    Stopped,
    Paused,
    Playing,
}

/// Bridges OS media-key/notification-center commands to [`Engine`] verbs
/// and republishes playback state/metadata back to the OS.
pub struct SystemMediaControlsPlugin {
    engine: Weak<Engine>,
    controls: Option<MediaControls>,
    last_published_playback: Option<PublishedPlayback>,
    last_published_title: Option<String>,
}

impl SystemMediaControlsPlugin {
    /// `engine` is held weakly: the plugin must never keep the engine it's
    /// installed into alive past the host's own last reference.
    pub fn new(engine: Weak<Engine>) -> Self {
        Self { engine, controls: None, last_published_playback: None, last_published_title: None }
    }

    #[cfg(not(target_os = "windows"))]
    fn create_controls(engine: Weak<Engine>) -> Option<MediaControls> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: DISPLAY_NAME,
            dbus_name: DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!("SystemMediaControlsPlugin: failed to create media controls backend: {err}");
                return None;
            }
        };
        if let Err(err) = controls.attach(move |event| {
            if let Some(engine) = engine.upgrade() {
                Self::handle_control_event(&engine, event);
            }
        }) {
            warn!("SystemMediaControlsPlugin: failed to attach media controls handler: {err}");
            return None;
        }
        Some(controls)
    }

    #[cfg(target_os = "windows")]
    fn create_controls(_engine: Weak<Engine>) -> Option<MediaControls> {
        // souvlaki requires an HWND on Windows; this crate has no host
        // window of its own to supply one.
        warn!("SystemMediaControlsPlugin: Windows media controls are disabled, no HWND available");
        None
    }

    fn handle_control_event(engine: &Engine, event: MediaControlEvent) {
        let state = engine.get_state();
        let result = match event {
            MediaControlEvent::Play => engine.play(),
            MediaControlEvent::Pause => engine.pause(),
            MediaControlEvent::Toggle => {
                if state.playing() {
                    engine.pause()
                } else {
                    engine.play()
                }
            }
            MediaControlEvent::Stop => engine.stop(),
            MediaControlEvent::Next => engine.next(),
            MediaControlEvent::Previous => engine.prev(),
            MediaControlEvent::Seek(direction) => {
                let target = seek_target(state.current_time, signed_step(direction, SEEK_STEP_SECONDS));
                engine.seek(target, SeekOptions::default())
            }
            MediaControlEvent::SeekBy(direction, amount) => {
                let target = seek_target(state.current_time, signed_step(direction, amount.as_secs_f64()));
                engine.seek(target, SeekOptions::default())
            }
            MediaControlEvent::SetPosition(position) => engine.seek(position.0.as_secs_f64(), SeekOptions::default()),
            MediaControlEvent::SetVolume(volume) => {
                engine.set_volume(volume as f32);
                Ok(())
            }
            MediaControlEvent::OpenUri(_) | MediaControlEvent::Raise | MediaControlEvent::Quit => Ok(()),
        };
        if let Err(err) = result {
            warn!("SystemMediaControlsPlugin: command {event:?} failed: {err}");
        }
    }

    fn publish(&mut self, state: &PlayerStateData) {
        let Some(controls) = self.controls.as_mut() else { return };

        let desired = if state.media_info.is_none() {
            PublishedPlayback::Stopped
        } else if state.playing() {
            PublishedPlayback::Playing
        } else {
            PublishedPlayback::Paused
        };
        if self.last_published_playback != Some(desired) {
            let playback = match desired {
                PublishedPlayback::Stopped => MediaPlayback::Stopped,
                PublishedPlayback::Paused => MediaPlayback::Paused { progress: None },
                PublishedPlayback::Playing => MediaPlayback::Playing { progress: None },
            };
            match controls.set_playback(playback) {
                Ok(()) => self.last_published_playback = Some(desired),
                Err(err) => warn!("SystemMediaControlsPlugin: failed to publish playback state: {err}"),
            }
        }

        let title = state.media_info.as_ref().map(|_| title_for(state));
        if title != self.last_published_title {
            let metadata = match title.as_deref() {
                Some(title) => MediaMetadata {
                    title: Some(title),
                    artist: None,
                    album: None,
                    cover_url: None,
                    duration: state.duration.map(Duration::from_secs_f64),
                },
                None => MediaMetadata::default(),
            };
            match controls.set_metadata(metadata) {
                Ok(()) => self.last_published_title = title,
                Err(err) => warn!("SystemMediaControlsPlugin: failed to publish metadata: {err}"),
            }
        }
    }
}

fn signed_step(direction: SeekDirection, magnitude: f64) -> f64 {
    match direction {
        SeekDirection::Forward => magnitude,
        SeekDirection::Backward => -magnitude,
    }
}

fn seek_target(current_time: f64, delta: f64) -> f64 {
    (current_time + delta).max(0.0)
}

fn title_for(state: &PlayerStateData) -> String {
    state
        .media_info
        .as_ref()
        .and_then(|info| info.metadata.get("title").cloned())
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| "Unknown Title".to_string())
}

impl Plugin for SystemMediaControlsPlugin {
    fn name(&self) -> &str {
        "system-media-controls"
    }

    fn install(&mut self, _ctx: &PluginContext) {
        self.controls = Self::create_controls(self.engine.clone());
    }

    fn uninstall(&mut self, _ctx: &PluginContext) {
        self.controls = None;
    }

    fn on_state_change(&mut self, _ctx: &PluginContext, new: &PlayerStateData, _previous: &PlayerStateData) {
        self.publish(new);
    }
}
