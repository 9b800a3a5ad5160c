//! Per-pipeline frame renderer.
//!
//! Owns one [`RenderContext`] plus the input texture the camera session
//! renders into and the encoder surface frames are presented to. Every call
//! must come from the thread that created the renderer.

use std::thread::ThreadId;

use chrono::Local;

use super::context::{DrawParams, RenderContext};
use super::overlay::{OverlayRect, TimestampOverlay};
use super::source::FrameSource;
use crate::error::{RecorderError, RecorderResult};
use crate::media::{FrameSize, PixelFormat, Surface, VideoFrame};

/// Options fixed at prepare time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererOptions {
    /// Composite the wall-clock timestamp.
    pub watermark: bool,
    pub mirror: bool,
    /// Copy camera frames instead of importing them directly.
    pub cpu_copy: bool,
}

pub struct FrameRenderer {
    context: Box<dyn RenderContext>,
    options: RendererOptions,
    owner: ThreadId,
    input: Option<Surface>,
    source: Option<FrameSource>,
    output: Option<Surface>,
    output_size: FrameSize,
    overlay: Option<TimestampOverlay>,
    frames_rendered: u64,
    released: bool,
}

impl FrameRenderer {
    /// Create a renderer owned by the calling thread.
    pub fn new(context: Box<dyn RenderContext>, options: RendererOptions) -> Self {
        log::debug!(
            "[RENDERER] Created with {} context (watermark={})",
            context.name(),
            options.watermark
        );
        Self {
            context,
            options,
            owner: std::thread::current().id(),
            input: None,
            source: None,
            output: None,
            output_size: FrameSize::new(0, 0),
            overlay: options.watermark.then(TimestampOverlay::new),
            frames_rendered: 0,
            released: false,
        }
    }

    /// Bind the encoder surface and create the input texture the camera
    /// renders into. The input becomes the default frame source.
    pub fn initialize(&mut self, output: Surface, output_size: FrameSize) -> RecorderResult<Surface> {
        self.check_usable()?;
        if self.input.is_some() {
            return Err(RecorderError::InvalidState(
                "renderer already initialized".to_string(),
            ));
        }
        let input = Surface::new("renderer-input");
        self.source = Some(if self.options.cpu_copy {
            FrameSource::CpuCopy(input.clone())
        } else {
            FrameSource::NativeZeroCopy(input.clone())
        });
        self.input = Some(input.clone());
        self.output = Some(output);
        self.output_size = output_size;
        Ok(input)
    }

    /// Replace the frame source.
    pub fn set_source(&mut self, source: FrameSource) -> RecorderResult<()> {
        self.check_usable()?;
        self.source = Some(source);
        Ok(())
    }

    /// Latch the newest source frame, draw it and present it to the output
    /// with `timestamp_ns`. Returns false when no frame was pending.
    pub fn render_frame(&mut self, timestamp_ns: i64) -> RecorderResult<bool> {
        self.check_usable()?;
        let Some(frame) = self.source.as_ref().and_then(FrameSource::latch) else {
            return Ok(false);
        };
        let output = self
            .output
            .clone()
            .ok_or_else(|| RecorderError::InvalidState("renderer has no output".to_string()))?;

        self.context.import_frame(&frame)?;

        let overlay_rect = match self.overlay.as_mut() {
            Some(overlay) => {
                if overlay.update(Local::now()) {
                    self.context.upload_overlay(overlay)?;
                }
                Some(OverlayRect::for_frame(self.output_size))
            },
            None => None,
        };

        let pixels = self.context.draw(&DrawParams {
            output_size: self.output_size,
            overlay: overlay_rect,
            mirror: self.options.mirror,
        })?;

        let rendered = VideoFrame::new(pixels, self.output_size, PixelFormat::Rgba8, timestamp_ns)
            .with_frame_id(self.frames_rendered);
        if !output.queue_frame(rendered) {
            return Err(RecorderError::RenderError(format!(
                "output surface {} was released",
                output.label()
            )));
        }
        self.frames_rendered += 1;
        Ok(true)
    }

    /// Drop a pending source frame without drawing. Keeps the camera
    /// producing while not recording.
    pub fn consume_only(&mut self) -> RecorderResult<bool> {
        self.check_usable()?;
        Ok(self
            .source
            .as_ref()
            .map(FrameSource::discard)
            .unwrap_or(false))
    }

    /// Swap the output surface for a new encoder. Context, input texture,
    /// source and overlay are kept.
    pub fn rebind_output(&mut self, output: Surface) -> RecorderResult<()> {
        self.check_usable()?;
        self.context.reset_output();
        log::debug!(
            "[RENDERER] Output rebound {} -> {}",
            self.output.as_ref().map(|s| s.id()).unwrap_or_default(),
            output.id()
        );
        self.output = Some(output);
        Ok(())
    }

    /// Input texture handle, if initialized.
    pub fn input_surface(&self) -> Option<Surface> {
        self.input.clone()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Free the context and the input texture. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        if std::thread::current().id() != self.owner {
            log::warn!("[RENDERER] Released off the owning thread");
        }
        self.released = true;
        self.context.release();
        if let Some(input) = self.input.take() {
            input.release();
        }
        self.source = None;
        self.output = None;
        log::debug!(
            "[RENDERER] Released after {} frames",
            self.frames_rendered
        );
    }

    fn check_usable(&self) -> RecorderResult<()> {
        if self.released {
            return Err(RecorderError::Released("renderer"));
        }
        if std::thread::current().id() != self.owner {
            return Err(RecorderError::RenderError(
                "renderer used off its owning thread".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for FrameRenderer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::CpuRenderContext;

    const SIZE: FrameSize = FrameSize::new(8, 6);

    fn renderer(options: RendererOptions) -> FrameRenderer {
        FrameRenderer::new(Box::new(CpuRenderContext::new()), options)
    }

    #[test]
    fn test_render_presents_with_timestamp() {
        let mut r = renderer(RendererOptions::default());
        let output = Surface::new("encoder");
        let input = r.initialize(output.clone(), SIZE).unwrap();

        assert!(!r.render_frame(1).unwrap());

        input.queue_frame(VideoFrame::solid(SIZE, [1, 2, 3, 255], 99));
        assert!(r.render_frame(42_000).unwrap());

        let presented = output.acquire_latest().unwrap();
        assert_eq!(presented.timestamp_ns, 42_000);
        assert_eq!(presented.size, SIZE);
        assert_eq!(&presented.data[0..4], &[1, 2, 3, 255]);
        assert_eq!(r.frames_rendered(), 1);
    }

    #[test]
    fn test_watermark_changes_pixels() {
        let mut r = renderer(RendererOptions {
            watermark: true,
            ..Default::default()
        });
        let size = FrameSize::new(400, 60);
        let output = Surface::new("encoder");
        let input = r.initialize(output.clone(), size).unwrap();
        input.queue_frame(VideoFrame::solid(size, [0, 0, 0, 255], 0));
        assert!(r.render_frame(0).unwrap());

        let presented = output.acquire_latest().unwrap();
        assert!(presented.data.chunks_exact(4).any(|px| px[0] > 200));
    }

    #[test]
    fn test_consume_only_drains_without_output() {
        let mut r = renderer(RendererOptions::default());
        let output = Surface::new("encoder");
        let input = r.initialize(output.clone(), SIZE).unwrap();
        input.queue_frame(VideoFrame::solid(SIZE, [0; 4], 0));

        assert!(r.consume_only().unwrap());
        assert!(!input.has_pending());
        assert!(!output.has_pending());
    }

    #[test]
    fn test_rebind_output_keeps_input() {
        let mut r = renderer(RendererOptions::default());
        let first = Surface::new("encoder-1");
        let input = r.initialize(first.clone(), SIZE).unwrap();

        let second = Surface::new("encoder-2");
        r.rebind_output(second.clone()).unwrap();
        input.queue_frame(VideoFrame::solid(SIZE, [5; 4], 0));
        assert!(r.render_frame(7).unwrap());

        assert!(!first.has_pending());
        assert!(second.has_pending());
        assert!(!input.is_released());
    }

    #[test]
    fn test_release_is_idempotent_and_frees_input() {
        let mut r = renderer(RendererOptions::default());
        let input = r.initialize(Surface::new("encoder"), SIZE).unwrap();
        r.release();
        r.release();
        assert!(input.is_released());
        assert!(r.render_frame(0).is_err());
    }

    #[test]
    fn test_off_thread_use_is_rejected() {
        let mut r = renderer(RendererOptions::default());
        r.initialize(Surface::new("encoder"), SIZE).unwrap();
        let result = std::thread::spawn(move || r.render_frame(0).is_err())
        .join()
        .unwrap();
        assert!(result);
    }
}
