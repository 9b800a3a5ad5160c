//! Platform encoder and container muxer abstractions used by the software
//! recording pipeline.
//!
//! The encoder consumes rendered frames from its input [`Surface`] and
//! produces compressed samples that the pipeline drains into a
//! [`ContainerMuxer`]. Presentation timestamps are assigned by the pipeline at
//! drain time, not by the encoder.

use std::path::Path;
use std::time::Duration;

use super::frame::FrameSize;
use super::surface::Surface;
use crate::error::RecorderResult;

/// Default encoder frame rate.
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Default encoder bitrate (3 Mbps).
pub const DEFAULT_BITRATE: u32 = 3_000_000;

/// Default keyframe interval in seconds.
pub const DEFAULT_I_FRAME_INTERVAL_SECS: u32 = 1;

/// Requested encoder configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderFormat {
    pub mime: &'static str,
    pub size: FrameSize,
    pub bitrate: u32,
    pub frame_rate: u32,
    pub i_frame_interval_secs: u32,
}

impl EncoderFormat {
    pub fn avc(size: FrameSize, bitrate: u32, frame_rate: u32) -> Self {
        Self {
            mime: "video/avc",
            size,
            bitrate,
            frame_rate,
            i_frame_interval_secs: DEFAULT_I_FRAME_INTERVAL_SECS,
        }
    }
}

/// Output format reported by the encoder once it has produced its first
/// configuration data.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackFormat {
    pub mime: String,
    pub size: FrameSize,
    pub codec_config: Vec<u8>,
}

/// One compressed sample.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    pub key_frame: bool,
    /// Codec configuration data (SPS/PPS); carried in the track format, never written.
    pub codec_config: bool,
}

/// Result of a single dequeue from the encoder output.
#[derive(Debug)]
pub enum EncoderOutput {
    /// Nothing available within the timeout.
    TryAgainLater,
    /// Output format is known; the muxer track can now be added.
    FormatChanged(TrackFormat),
    Sample(EncodedSample),
    /// End of stream after `signal_end_of_input`.
    EndOfStream,
}

/// Hardware video encoder with a surface input.
pub trait VideoEncoder: Send {
    /// Surface the renderer draws into.
    fn input_surface(&self) -> Surface;

    fn start(&mut self) -> RecorderResult<()>;

    fn dequeue_output(&mut self, timeout: Duration) -> RecorderResult<EncoderOutput>;

    fn signal_end_of_input(&mut self) -> RecorderResult<()>;

    fn stop(&mut self) -> RecorderResult<()>;

    /// Free encoder resources. Must not fail; idempotent.
    fn release(&mut self);
}

/// Container writer (MP4 or equivalent) for a single video track.
pub trait ContainerMuxer: Send {
    fn add_track(&mut self, format: &TrackFormat) -> RecorderResult<usize>;

    fn start(&mut self) -> RecorderResult<()>;

    fn write_sample(
        &mut self,
        track: usize,
        sample: &EncodedSample,
        pts_us: i64,
    ) -> RecorderResult<()>;

    /// Finalize the container (write trailer).
    fn stop(&mut self) -> RecorderResult<()>;

    fn release(&mut self);
}

/// Creates encoders and muxers for the software pipeline.
pub trait EncoderFactory: Send + Sync {
    fn create_encoder(&self, format: &EncoderFormat) -> RecorderResult<Box<dyn VideoEncoder>>;

    fn create_muxer(&self, path: &Path) -> RecorderResult<Box<dyn ContainerMuxer>>;
}
