//! Recorder configuration.
//!
//! ## Architecture
//!
//! - `RecorderConfig`: everything a recording run needs from the host
//!   (resolution policy, levels, segment length, watermark, backend policy)
//! - `SlotConfig` / `CarModel`: slot-to-device bindings and vehicle presets
//!
//! Timing constants for sessions, pipelines and the start barrier live next to
//! the components that use them (`SessionTimings`, `PipelineTimings`,
//! `BarrierTimings`) so tests can shorten them per instance.

pub mod cameras;
pub mod recording;

pub use cameras::{CarModel, SlotConfig};
pub use recording::{
    BackendPolicy, BitrateLevel, FrameRateLevel, RecorderConfig, ResolutionPolicy,
};
