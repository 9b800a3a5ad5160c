//! Frame rendering for the software recording pipeline.
//!
//! ## Components
//! - `renderer`: [`FrameRenderer`], one per pipeline, bound to the encoder's input surface
//! - `source`: [`FrameSource`] capability (zero-copy import or CPU copy)
//! - `context`: [`RenderContext`] trait and the portable CPU context
//! - `gpu`: wgpu context (feature `gpu`)
//! - `overlay`: timestamp watermark raster and placement

pub mod context;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod overlay;
pub mod renderer;
pub mod source;

pub use context::{create_render_context, CpuRenderContext, DrawParams, RenderContext};
#[cfg(feature = "gpu")]
pub use gpu::WgpuRenderContext;
pub use overlay::{OverlayRect, TimestampOverlay};
pub use renderer::{FrameRenderer, RendererOptions};
pub use source::FrameSource;
