//! In-process camera, encoder and writer backends.
//!
//! Used by the test suite and by the binary's dry-run mode. Every backend
//! exposes fault-injection switches so recovery paths can be exercised
//! without hardware.

pub mod camera;
pub mod codec;
pub mod writer;

pub use camera::{SimCameraProvider, SIM_FRAME_INTERVAL};
pub use codec::{read_container, SimContainer, SimEncoderFactory, SimMuxer};
pub use writer::{SimWriterFactory, SimWriter};
