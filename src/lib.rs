//! Multi-camera capture and segmented recording.
//!
//! - `camera`: per-device sessions with reconnect and capture-session
//!   reconfiguration
//! - `pipeline`: hardware (direct writer) and software (renderer + encoder)
//!   recording backends with segment rotation and recovery
//! - `coordinator`: owns every session, the start barrier and the active run
//! - `render`: frame renderer with optional timestamp overlay
//! - `sim`: in-process camera, encoder and writer used by the dry-run binary
//!   and the tests

pub mod camera;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod manifest;
pub mod media;
pub mod pipeline;
pub mod render;
pub mod runtime;
pub mod sim;

pub use coordinator::{CoordinatorTimings, MultiCameraCoordinator, RecorderEvent};
pub use error::{RecorderError, RecorderResult};

/// Initialise `env_logger` once. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
