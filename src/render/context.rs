//! Render contexts: the drawing backends behind a [`super::FrameRenderer`].
//!
//! A context owns the input texture (last imported camera frame), the overlay
//! texture and whatever output target the draw lands in. It is created and
//! used on exactly one thread.

use image::RgbaImage;

use super::overlay::{blend_overlay, OverlayRect, TimestampOverlay};
use crate::error::{RecorderError, RecorderResult};
use crate::media::{FrameSize, VideoFrame};

/// Per-draw parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub output_size: FrameSize,
    /// Overlay placement, or `None` for the pass-through path.
    pub overlay: Option<OverlayRect>,
    /// Flip horizontally.
    pub mirror: bool,
}

/// Drawing backend.
pub trait RenderContext: Send {
    fn name(&self) -> &'static str;

    /// Make `frame` the current input texture.
    fn import_frame(&mut self, frame: &VideoFrame) -> RecorderResult<()>;

    /// Redraw the overlay texture from the current timestamp text.
    fn upload_overlay(&mut self, overlay: &mut TimestampOverlay) -> RecorderResult<()>;

    /// Draw the input (plus overlay) and return the tightly packed RGBA result.
    fn draw(&mut self, params: &DrawParams) -> RecorderResult<Vec<u8>>;

    /// Drop the output target only; the input and overlay textures stay.
    fn reset_output(&mut self);

    /// Free everything. Idempotent.
    fn release(&mut self);
}

/// Portable software context.
#[derive(Default)]
pub struct CpuRenderContext {
    input: Option<VideoFrame>,
    overlay: Option<RgbaImage>,
    output: Vec<u8>,
    released: bool,
}

impl CpuRenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_overlay(&mut self, raster: &RgbaImage) {
        match self.overlay.as_mut() {
            Some(existing) if existing.dimensions() == raster.dimensions() => {
                existing.copy_from_slice(raster.as_raw());
            },
            _ => self.overlay = Some(raster.clone()),
        }
    }
}

impl RenderContext for CpuRenderContext {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn import_frame(&mut self, frame: &VideoFrame) -> RecorderResult<()> {
        if self.released {
            return Err(RecorderError::Released("render context"));
        }
        if !frame.is_well_formed() {
            return Err(RecorderError::RenderError(format!(
                "frame buffer of {} bytes does not match {}",
                frame.data.len(),
                frame.size
            )));
        }
        self.input = Some(frame.clone());
        Ok(())
    }

    fn upload_overlay(&mut self, overlay: &mut TimestampOverlay) -> RecorderResult<()> {
        if self.released {
            return Err(RecorderError::Released("render context"));
        }
        self.store_overlay(overlay.raster());
        Ok(())
    }

    fn draw(&mut self, params: &DrawParams) -> RecorderResult<Vec<u8>> {
        if self.released {
            return Err(RecorderError::Released("render context"));
        }
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| RecorderError::RenderError("no input frame imported".to_string()))?;

        let out = params.output_size;
        self.output.resize(out.rgba_len(), 0);
        sample_nearest(&input.data, input.size, &mut self.output, out, params.mirror);

        if let (Some(rect), Some(overlay)) = (params.overlay, self.overlay.as_ref()) {
            if !rect.is_empty() {
                blend_overlay(&mut self.output, out, overlay, rect);
            }
        }
        Ok(self.output.clone())
    }

    fn reset_output(&mut self) {
        self.output = Vec::new();
    }

    fn release(&mut self) {
        self.released = true;
        self.input = None;
        self.overlay = None;
        self.output = Vec::new();
    }
}

/// Nearest-neighbour resample of an RGBA buffer, optionally mirrored.
fn sample_nearest(src: &[u8], src_size: FrameSize, dst: &mut [u8], dst_size: FrameSize, mirror: bool) {
    if src_size == dst_size && !mirror {
        dst.copy_from_slice(&src[..dst.len()]);
        return;
    }
    let (sw, sh) = (src_size.width.max(1) as usize, src_size.height.max(1) as usize);
    let (dw, dh) = (dst_size.width as usize, dst_size.height as usize);
    for y in 0..dh {
        let sy = y * sh / dh.max(1);
        for x in 0..dw {
            let dx = if mirror { dw - 1 - x } else { x };
            let sx = dx * sw / dw.max(1);
            let s = (sy * sw + sx) * 4;
            let d = (y * dw + x) * 4;
            if let (Some(px), Some(out)) = (src.get(s..s + 4), dst.get_mut(d..d + 4)) {
                out.copy_from_slice(px);
            }
        }
    }
}

/// Create the best available context: wgpu when the `gpu` feature is on and
/// an adapter is found, otherwise the CPU context.
pub fn create_render_context(prefer_gpu: bool) -> Box<dyn RenderContext> {
    #[cfg(feature = "gpu")]
    if prefer_gpu {
        match super::gpu::WgpuRenderContext::new() {
            Ok(context) => return Box::new(context),
            Err(e) => log::warn!("[RENDERER] GPU context unavailable, using CPU: {}", e),
        }
    }
    #[cfg(not(feature = "gpu"))]
    if prefer_gpu {
        log::debug!("[RENDERER] Built without GPU support, using CPU context");
    }
    Box::new(CpuRenderContext::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use image::Rgba;

    fn params(size: FrameSize) -> DrawParams {
        DrawParams {
            output_size: size,
            overlay: None,
            mirror: false,
        }
    }

    #[test]
    fn test_draw_requires_input() {
        let mut context = CpuRenderContext::new();
        assert!(context.draw(&params(FrameSize::new(2, 2))).is_err());
    }

    #[test]
    fn test_passthrough_copies_pixels() {
        let mut context = CpuRenderContext::new();
        let frame = VideoFrame::solid(FrameSize::new(2, 2), [9, 8, 7, 255], 0);
        context.import_frame(&frame).unwrap();
        let out = context.draw(&params(FrameSize::new(2, 2))).unwrap();
        assert_eq!(out.as_slice(), frame.data.as_slice());
    }

    #[test]
    fn test_scales_and_mirrors() {
        let mut context = CpuRenderContext::new();
        // 2x1: red then blue
        let frame = VideoFrame::new(
            vec![255, 0, 0, 255, 0, 0, 255, 255],
            FrameSize::new(2, 1),
            crate::media::PixelFormat::Rgba8,
            0,
        );
        context.import_frame(&frame).unwrap();

        let out = context
            .draw(&DrawParams {
                output_size: FrameSize::new(4, 1),
                overlay: None,
                mirror: true,
            })
            .unwrap();
        assert_eq!(&out[0..4], &[0, 0, 255, 255]);
        assert_eq!(&out[12..16], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_overlay_path_blends() {
        let mut context = CpuRenderContext::new();
        let size = FrameSize::new(4, 4);
        context
            .import_frame(&VideoFrame::solid(size, [0, 0, 0, 255], 0))
            .unwrap();
        context.store_overlay(&RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255])));
        let out = context
            .draw(&DrawParams {
                output_size: size,
                overlay: Some(OverlayRect {
                    x: 0,
                    y: 0,
                    width: 1,
                    height: 1,
                }),
                mirror: false,
            })
            .unwrap();
        assert_eq!(&out[0..4], &[255, 255, 255, 255]);
        assert_eq!(&out[4..8], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_timestamp_overlay_lands_in_corner() {
        use chrono::TimeZone;

        let mut context = CpuRenderContext::new();
        let size = FrameSize::new(640, 480);
        context
            .import_frame(&VideoFrame::solid(size, [0, 0, 255, 255], 0))
            .unwrap();
        let mut overlay = TimestampOverlay::new();
        overlay.update(Local.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).single().unwrap());
        context.upload_overlay(&mut overlay).unwrap();

        let rect = OverlayRect::for_frame(size);
        let out = context
            .draw(&DrawParams {
                output_size: size,
                overlay: Some(rect),
                mirror: false,
            })
            .unwrap();
        let pixel = |x: u32, y: u32| {
            let i = ((y * size.width + x) * 4) as usize;
            [out[i], out[i + 1], out[i + 2], out[i + 3]]
        };
        // Translucent black darkens the blue frame inside the rect only
        assert!(pixel(rect.x, rect.y)[2] < 255);
        assert_eq!(pixel(size.width - 1, size.height - 1), [0, 0, 255, 255]);
        let lit = (rect.y..rect.y + rect.height)
            .flat_map(|y| (rect.x..rect.x + rect.width).map(move |x| (x, y)))
            .filter(|&(x, y)| pixel(x, y)[0] > 200)
            .count();
        assert!(lit > 100);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut context = CpuRenderContext::new();
        context.release();
        context.release();
        let frame = VideoFrame::solid(FrameSize::new(1, 1), [0; 4], 0);
        assert!(context.import_frame(&frame).is_err());
    }
}
