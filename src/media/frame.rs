//! Raw video frames as they travel between camera, renderer and encoder.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte length of a tightly packed 4-byte-per-pixel buffer.
    pub fn rgba_len(&self) -> usize {
        self.pixel_count() * 4
    }

    /// Manhattan distance between two sizes, used for nearest-size matching.
    pub fn distance(&self, other: &FrameSize) -> u64 {
        (self.width as i64 - other.width as i64).unsigned_abs()
            + (self.height as i64 - other.height as i64).unsigned_abs()
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Rgba8,
    Bgra8,
}

/// One captured or rendered video frame.
///
/// The pixel buffer is reference counted so a frame can be handed to several
/// consumers (preview and record targets) without copying.
#[derive(Clone)]
pub struct VideoFrame {
    pub data: Arc<Vec<u8>>,
    pub size: FrameSize,
    pub format: PixelFormat,
    /// Sensor timestamp for captured frames, presentation timestamp for rendered ones.
    pub timestamp_ns: i64,
    /// Monotonic per-producer frame ID.
    pub frame_id: u64,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, size: FrameSize, format: PixelFormat, timestamp_ns: i64) -> Self {
        Self {
            data: Arc::new(data),
            size,
            format,
            timestamp_ns,
            frame_id: 0,
        }
    }

    pub fn with_frame_id(mut self, frame_id: u64) -> Self {
        self.frame_id = frame_id;
        self
    }

    /// Solid-color RGBA frame.
    pub fn solid(size: FrameSize, rgba: [u8; 4], timestamp_ns: i64) -> Self {
        let mut data = Vec::with_capacity(size.rgba_len());
        for _ in 0..size.pixel_count() {
            data.extend_from_slice(&rgba);
        }
        Self::new(data, size, PixelFormat::Rgba8, timestamp_ns)
    }

    /// True when the buffer length matches the declared size and format.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.size.rgba_len()
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("frame_id", &self.frame_id)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Swap red and blue channels in place (RGBA <-> BGRA).
pub fn swap_red_blue(data: &mut [u8]) {
    for px in data.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
}
