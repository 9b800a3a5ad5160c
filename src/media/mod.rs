//! Media primitives shared by the camera, renderer and pipelines.

pub mod codec;
pub mod ffmpeg;
pub mod frame;
pub mod surface;
pub mod timestamp;
pub mod writer;

pub use codec::{
    ContainerMuxer, EncodedSample, EncoderFactory, EncoderFormat, EncoderOutput, TrackFormat,
    VideoEncoder,
};
pub use frame::{FrameSize, PixelFormat, VideoFrame};
pub use surface::Surface;
pub use timestamp::{PtsGuard, SegmentClock};
pub use writer::{MediaWriter, WriterConfig, WriterFactory};
