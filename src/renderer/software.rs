//! Always-available 2D-fallback backend, implemented on top of `image`
//! (following the `image`/`zune-jpeg` raster pipeline already used
//! elsewhere for this kind of work).

use image::{imageops, DynamicImage, RgbaImage};

use crate::model::{Frame, PixelFormat, Rotation};

use super::{FitMode, Presenter, RenderBackend, RendererType};

/// Software raster backend: decodes the frame's pixel buffer into an
/// `image::RgbaImage`, applies the rotation transform, blits it into the
/// output surface under the requested fit policy, and hands the composited
/// buffer to the host-supplied presenter (if any) or keeps it for
/// `screenshot()`/`exportFrame()` callers.
pub struct SoftwareBackend {
    presenter: Option<Box<dyn Presenter>>,
    surface_width: u32,
    surface_height: u32,
    last_composited: Option<RgbaImage>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self {
            presenter: None,
            surface_width: 1920,
            surface_height: 1080,
            last_composited: None,
        }
    }

    /// The most recently composited surface, for screenshot capture.
    pub fn last_composited(&self) -> Option<&RgbaImage> {
        self.last_composited.as_ref()
    }

    fn decode_frame(frame: &Frame) -> Result<RgbaImage, String> {
        match frame.format {
            PixelFormat::Rgba8 => {
                RgbaImage::from_raw(frame.width, frame.height, frame.data().to_vec())
                    .ok_or_else(|| "frame buffer size does not match its declared dimensions".to_string())
            }
            other => Err(format!("software backend cannot decode pixel format {other:?} directly; supply RGBA8 or route through the fallback transcoder")),
        }
    }

    fn rotate(image: RgbaImage, rotation: Rotation) -> RgbaImage {
        match rotation {
            Rotation::Deg0 => image,
            Rotation::Deg90 => imageops::rotate90(&image),
            Rotation::Deg180 => imageops::rotate180(&image),
            Rotation::Deg270 => imageops::rotate270(&image),
        }
    }

    /// Blits `source` into a `surface_width`x`surface_height` canvas under
    /// `fit`.
    pub fn composite(source: &RgbaImage, surface_width: u32, surface_height: u32, fit: FitMode) -> RgbaImage {
        let mut canvas = RgbaImage::new(surface_width, surface_height);
        let (sw, sh) = (source.width(), source.height());
        if sw == 0 || sh == 0 {
            return canvas;
        }
        let (draw_w, draw_h) = match fit {
            FitMode::Fill => (surface_width, surface_height),
            FitMode::Contain => {
                let scale = (surface_width as f64 / sw as f64).min(surface_height as f64 / sh as f64);
                (((sw as f64) * scale).round() as u32, ((sh as f64) * scale).round() as u32)
            }
            FitMode::Cover => {
                let scale = (surface_width as f64 / sw as f64).max(surface_height as f64 / sh as f64);
                (((sw as f64) * scale).round() as u32, ((sh as f64) * scale).round() as u32)
            }
        };
        let resized = imageops::resize(source, draw_w.max(1), draw_h.max(1), imageops::FilterType::Triangle);
        let x = (surface_width as i64 - draw_w as i64) / 2;
        let y = (surface_height as i64 - draw_h as i64) / 2;
        imageops::overlay(&mut canvas, &resized, x, y);
        canvas
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for SoftwareBackend {
    fn renderer_type(&self) -> RendererType {
        RendererType::Software
    }

    fn init(&mut self, presenter: Box<dyn Presenter>) {
        self.presenter = Some(presenter);
    }

    fn present(&mut self, frame: &Frame, rotation: Rotation, fit: FitMode) -> Result<(), String> {
        let decoded = Self::decode_frame(frame)?;
        let rotated = Self::rotate(decoded, rotation);
        let composited = Self::composite(&rotated, self.surface_width, self.surface_height, fit);
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.present(frame, rotation, fit)?;
        }
        self.last_composited = Some(composited);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.surface_width = width;
        self.surface_height = height;
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.resize(width, height);
        }
    }

    fn dispose(&mut self) {
        self.presenter = None;
        self.last_composited = None;
    }
}

/// Encodes a raster surface to the requested image format for
/// `screenshot()`/`exportFrame()`.
pub fn encode_surface(surface: &RgbaImage, format: ScreenshotFormat, quality: f32) -> Result<Vec<u8>, String> {
    let dynamic = DynamicImage::ImageRgba8(surface.clone());
    let mut bytes = std::io::Cursor::new(Vec::new());
    match format {
        ScreenshotFormat::Png => dynamic
            .write_to(&mut bytes, image::ImageFormat::Png)
            .map_err(|err| err.to_string())?,
        ScreenshotFormat::Jpeg => {
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut bytes,
                (quality.clamp(0.0, 1.0) * 100.0).round() as u8,
            );
            dynamic.write_with_encoder(encoder).map_err(|err| err.to_string())?;
        }
        ScreenshotFormat::Webp => dynamic
            .write_to(&mut bytes, image::ImageFormat::WebP)
            .map_err(|err| err.to_string())?,
    }
    Ok(bytes.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenshotFormat {
    Png,
    Jpeg,
    Webp,
}

impl ScreenshotFormat {
    pub fn mime(self) -> &'static str {
        match self {
            ScreenshotFormat::Png => "image/png",
            ScreenshotFormat::Jpeg => "image/jpeg",
            ScreenshotFormat::Webp => "image/webp",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32) -> Frame {
        Frame::new(0.0, 1.0 / 30.0, PixelFormat::Rgba8, width, height, vec![255u8; (width * height * 4) as usize])
    }

    #[test]
    fn contain_fit_letterboxes_without_distortion() {
        let source = RgbaImage::from_pixel(100, 50, image::Rgba([255, 0, 0, 255]));
        let composited = SoftwareBackend::composite(&source, 200, 200, FitMode::Contain);
        assert_eq!(composited.width(), 200);
        assert_eq!(composited.height(), 200);
        // Letterboxed: corners remain transparent/black, not stretched red.
        assert_eq!(composited.get_pixel(0, 0)[3], 0);
    }

    #[test]
    fn fill_fit_stretches_to_cover_the_whole_surface() {
        let source = RgbaImage::from_pixel(100, 50, image::Rgba([0, 255, 0, 255]));
        let composited = SoftwareBackend::composite(&source, 200, 200, FitMode::Fill);
        assert_eq!(composited.get_pixel(0, 0)[1], 255);
    }

    #[test]
    fn present_decodes_rotates_and_composites_an_rgba8_frame() {
        let mut backend = SoftwareBackend::new();
        let frame = solid_frame(4, 4);
        backend.present(&frame, Rotation::Deg0, FitMode::Contain).unwrap();
        assert!(backend.last_composited().is_some());
        frame.close();
    }

    #[test]
    fn png_encoding_round_trips_through_the_image_crate() {
        let surface = RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 255]));
        let bytes = encode_surface(&surface, ScreenshotFormat::Png, 1.0).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
