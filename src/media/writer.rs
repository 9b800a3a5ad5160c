//! Platform encoder + container writer used by the hardware recording
//! pipeline. The camera session renders straight into the writer's input
//! surface; there is no GPU stage in between.

use std::path::Path;

use super::frame::FrameSize;
use super::surface::Surface;
use crate::error::RecorderResult;

/// Writer settings for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    pub size: FrameSize,
    pub bitrate: u32,
    pub frame_rate: u32,
}

/// One-shot writer: prepare, start, stop, release. A new writer is created
/// for every segment.
pub trait MediaWriter: Send {
    /// Bind the writer to an output file and return its fresh input surface.
    fn prepare(&mut self, path: &Path) -> RecorderResult<Surface>;

    fn start(&mut self) -> RecorderResult<()>;

    /// Stop and finalize the file.
    fn stop(&mut self) -> RecorderResult<()>;

    /// Free writer resources. Must not fail; idempotent.
    fn release(&mut self);
}

/// Creates writers for the hardware pipeline.
pub trait WriterFactory: Send + Sync {
    fn create_writer(&self, config: &WriterConfig) -> RecorderResult<Box<dyn MediaWriter>>;
}
