//! Interchangeable raster backends with capability detection and runtime
//! fallback.

pub mod software;

pub use software::{encode_surface, ScreenshotFormat, SoftwareBackend};

use serde::{Deserialize, Serialize};

use crate::model::{Frame, Rotation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendererType {
    Gpu,
    Gl,
    Software,
}

impl RendererType {
    /// Capability-detection priority order, most to least capable.
    pub const PRIORITY: [RendererType; 3] =
        [RendererType::Gpu, RendererType::Gl, RendererType::Software];

    pub fn next_fallback(self) -> Option<RendererType> {
        match self {
            RendererType::Gpu => Some(RendererType::Gl),
            RendererType::Gl => Some(RendererType::Software),
            RendererType::Software => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    Fill,
    Contain,
    Cover,
}

impl Default for FitMode {
    fn default() -> Self {
        FitMode::Contain
    }
}

/// A host-supplied drawing/presentation surface. The engine never owns the
/// actual GPU/GL context; it only negotiates capability and hands frames to
/// whichever backend the host plugs in. This is the seam the spec's "GPU"
/// and "GL" backends hang off; the crate's own `SoftwareBackend` is the one
/// concretely implemented raster path (`image`-based).
pub trait Presenter: Send {
    /// Returns `false` if this presenter cannot actually back the named
    /// renderer type (used during capability detection).
    fn supports(&self, renderer_type: RendererType) -> bool;

    /// Presents a frame. Returns `Err` on a backend-specific failure; two
    /// consecutive failures trigger a downgrade.
    fn present(&mut self, frame: &Frame, rotation: Rotation, fit: FitMode) -> Result<(), String>;

    fn resize(&mut self, width: u32, height: u32);
}

/// A renderer backend: the polymorphic capability set a presenter negotiates over.
pub trait RenderBackend: Send {
    fn renderer_type(&self) -> RendererType;
    fn init(&mut self, presenter: Box<dyn Presenter>);
    fn present(&mut self, frame: &Frame, rotation: Rotation, fit: FitMode) -> Result<(), String>;
    fn resize(&mut self, width: u32, height: u32);
    fn dispose(&mut self);
}

/// Negotiates the best backend in priority order given a presenter that may
/// only support a subset of renderer types, and owns two-failures-in-a-row
/// downgrade logic.
pub struct RendererSwitchboard {
    active: Box<dyn RenderBackend>,
    consecutive_failures: u32,
}

const FAILURE_DOWNGRADE_THRESHOLD: u32 = 2;

impl RendererSwitchboard {
    pub fn negotiate(presenter: Box<dyn Presenter>) -> Self {
        Self::negotiate_preferring(presenter, None)
    }

    /// Like [`Self::negotiate`], but tries `preferred` first when the
    /// presenter supports it; the engine still falls back on failure.
    /// Capability detection
    /// and failure-downgrade behavior are unchanged.
    pub fn negotiate_preferring(presenter: Box<dyn Presenter>, preferred: Option<RendererType>) -> Self {
        let renderer_type = preferred
            .filter(|candidate| presenter.supports(*candidate))
            .or_else(|| RendererType::PRIORITY.into_iter().find(|candidate| presenter.supports(*candidate)))
            .unwrap_or(RendererType::Software);
        let mut backend = make_backend(renderer_type);
        backend.init(presenter);
        Self {
            active: backend,
            consecutive_failures: 0,
        }
    }

    pub fn renderer_type(&self) -> RendererType {
        self.active.renderer_type()
    }

    /// Presents a frame; returns `Some((from, to))` when this present
    /// triggered a backend downgrade so the caller can emit
    /// `rendererfallback`/`rendererchange`.
    pub fn present(
        &mut self,
        frame: &Frame,
        rotation: Rotation,
        fit: FitMode,
    ) -> (Result<(), String>, Option<(RendererType, RendererType)>) {
        match self.active.present(frame, rotation, fit) {
            Ok(()) => {
                self.consecutive_failures = 0;
                (Ok(()), None)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= FAILURE_DOWNGRADE_THRESHOLD {
                    if let Some(next) = self.active.renderer_type().next_fallback() {
                        let from = self.active.renderer_type();
                        self.active.dispose();
                        self.active = make_backend(next);
                        self.consecutive_failures = 0;
                        return (Err(err), Some((from, next)));
                    }
                }
                (Err(err), None)
            }
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.active.resize(width, height);
    }

    pub fn dispose(&mut self) {
        self.active.dispose();
    }
}

fn make_backend(renderer_type: RendererType) -> Box<dyn RenderBackend> {
    match renderer_type {
        RendererType::Gpu => Box::new(HostBackedBackend::new(RendererType::Gpu)),
        RendererType::Gl => Box::new(HostBackedBackend::new(RendererType::Gl)),
        RendererType::Software => Box::new(SoftwareBackend::new()),
    }
}

/// GPU/GL backends simply forward to whatever `Presenter` the host supplied;
/// the engine's own responsibility is the capability negotiation and
/// fallback bookkeeping above, not owning a GPU pipeline.
struct HostBackedBackend {
    renderer_type: RendererType,
    presenter: Option<Box<dyn Presenter>>,
}

impl HostBackedBackend {
    fn new(renderer_type: RendererType) -> Self {
        Self {
            renderer_type,
            presenter: None,
        }
    }
}

impl RenderBackend for HostBackedBackend {
    fn renderer_type(&self) -> RendererType {
        self.renderer_type
    }

    fn init(&mut self, presenter: Box<dyn Presenter>) {
        self.presenter = Some(presenter);
    }

    fn present(&mut self, frame: &Frame, rotation: Rotation, fit: FitMode) -> Result<(), String> {
        match self.presenter.as_mut() {
            Some(presenter) => presenter.present(frame, rotation, fit),
            None => Err("presenter not initialized".to_string()),
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.resize(width, height);
        }
    }

    fn dispose(&mut self) {
        self.presenter = None;
    }
}

/// The effective display size after rotation: width/height
/// swap for 90°/270°.
pub fn effective_display_size(width: u32, height: u32, rotation: Rotation) -> (u32, u32) {
    if rotation.swaps_dimensions() {
        (height, width)
    } else {
        (width, height)
    }
}
