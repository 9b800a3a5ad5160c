//! Where the renderer's input frames come from.

use crate::media::frame::swap_red_blue;
use crate::media::{PixelFormat, Surface, VideoFrame};

/// Camera texture provider for a [`super::FrameRenderer`].
///
/// `NativeZeroCopy` hands the camera's buffer straight to the render context.
/// `CpuCopy` copies every frame into a fresh RGBA buffer first, for platforms
/// that cannot import camera buffers directly.
#[derive(Debug, Clone)]
pub enum FrameSource {
    NativeZeroCopy(Surface),
    CpuCopy(Surface),
}

impl FrameSource {
    pub fn surface(&self) -> &Surface {
        match self {
            FrameSource::NativeZeroCopy(surface) | FrameSource::CpuCopy(surface) => surface,
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self, FrameSource::NativeZeroCopy(_))
    }

    /// Latch the newest pending frame, normalized to RGBA.
    pub fn latch(&self) -> Option<VideoFrame> {
        let frame = self.surface().acquire_latest()?;
        match self {
            FrameSource::NativeZeroCopy(_) if frame.format == PixelFormat::Rgba8 => Some(frame),
            _ => {
                let mut data = frame.data.as_ref().clone();
                if frame.format == PixelFormat::Bgra8 {
                    swap_red_blue(&mut data);
                }
                Some(
                    VideoFrame::new(data, frame.size, PixelFormat::Rgba8, frame.timestamp_ns)
                        .with_frame_id(frame.frame_id),
                )
            },
        }
    }

    /// Drop any pending frame without using it.
    pub fn discard(&self) -> bool {
        self.surface().acquire_latest().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FrameSize;
    use std::sync::Arc;

    #[test]
    fn test_zero_copy_shares_buffer() {
        let surface = Surface::new("cam");
        let frame = VideoFrame::solid(FrameSize::new(2, 2), [1, 2, 3, 255], 5);
        let original = Arc::clone(&frame.data);
        surface.queue_frame(frame);

        let latched = FrameSource::NativeZeroCopy(surface).latch().unwrap();
        assert!(Arc::ptr_eq(&latched.data, &original));
    }

    #[test]
    fn test_cpu_copy_converts_bgra() {
        let surface = Surface::new("cam");
        let frame = VideoFrame::new(
            vec![10, 20, 30, 255],
            FrameSize::new(1, 1),
            PixelFormat::Bgra8,
            0,
        );
        surface.queue_frame(frame);

        let latched = FrameSource::CpuCopy(surface).latch().unwrap();
        assert_eq!(latched.format, PixelFormat::Rgba8);
        assert_eq!(latched.data.as_slice(), &[30, 20, 10, 255]);
    }

    #[test]
    fn test_discard_empties_surface() {
        let surface = Surface::new("cam");
        let source = FrameSource::CpuCopy(surface.clone());
        assert!(!source.discard());
        surface.queue_frame(VideoFrame::solid(FrameSize::new(1, 1), [0; 4], 0));
        assert!(source.discard());
        assert!(!surface.has_pending());
    }
}
