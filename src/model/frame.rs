//! Move-only decoded-media handles owned by the decode queues.
//!
//! A `Frame`/`AudioSamples` has exactly one consumer (the scheduler). It is
//! either presented-and-closed or dropped-and-closed; never both. A debug
//! build tracks outstanding handles so tests can assert nothing leaked.

use std::sync::atomic::{AtomicI64, Ordering};

static LIVE_FRAMES: AtomicI64 = AtomicI64::new(0);
static LIVE_SAMPLES: AtomicI64 = AtomicI64::new(0);

/// Outstanding (unclosed) `Frame` handles. Test-only diagnostic.
pub fn live_frame_count() -> i64 {
    LIVE_FRAMES.load(Ordering::SeqCst)
}

/// Outstanding (unclosed) `AudioSamples` handles. Test-only diagnostic.
pub fn live_sample_count() -> i64 {
    LIVE_SAMPLES.load(Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgba8,
    Yuv420p,
    Nv12,
}

/// A decoded video frame. Move-only: closing consumes it.
#[derive(Debug)]
pub struct Frame {
    pub pts: f64,
    pub display_duration: f64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
    closed: bool,
}

impl Frame {
    pub fn new(pts: f64, display_duration: f64, format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        LIVE_FRAMES.fetch_add(1, Ordering::SeqCst);
        Self {
            pts,
            display_duration,
            format,
            width,
            height,
            data,
            closed: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the frame, releasing its pixel buffer back to the pool.
    pub fn close(mut self) {
        self.closed = true;
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        LIVE_FRAMES.fetch_sub(1, Ordering::SeqCst);
        if !self.closed {
            log::warn!("Frame at pts={} dropped without explicit close()", self.pts);
        }
    }
}

/// A decoded audio chunk. Move-only: closing consumes it.
#[derive(Debug)]
pub struct AudioSamples {
    pub channel_count: u16,
    pub sample_rate: u32,
    pub pts: f64,
    pub duration: f64,
    /// Interleaved f32 samples.
    data: Vec<f32>,
    closed: bool,
}

impl AudioSamples {
    pub fn new(channel_count: u16, sample_rate: u32, pts: f64, duration: f64, data: Vec<f32>) -> Self {
        LIVE_SAMPLES.fetch_add(1, Ordering::SeqCst);
        Self {
            channel_count,
            sample_rate,
            pts,
            duration,
            data,
            closed: false,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(mut self) -> Vec<f32> {
        self.closed = true;
        std::mem::take(&mut self.data)
    }

    pub fn close(mut self) {
        self.closed = true;
    }
}

impl Drop for AudioSamples {
    fn drop(&mut self) {
        LIVE_SAMPLES.fetch_sub(1, Ordering::SeqCst);
        if !self.closed {
            log::warn!("AudioSamples at pts={} dropped without explicit close()", self.pts);
        }
    }
}
