//! Platform camera abstraction.
//!
//! A [`CameraProvider`] opens devices; a [`CameraDevice`] builds capture
//! sessions that fan frames out to a set of output [`Surface`]s. Both report
//! asynchronous results through a [`DeviceEventSink`], which the owning
//! session routes onto its own worker thread.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::CameraErrorCode;
use crate::error::RecorderResult;
use crate::media::{FrameSize, Surface};

/// Asynchronous device callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Device is open and ready for a capture session.
    Opened,
    Disconnected,
    Error(CameraErrorCode),
    SessionConfigured { generation: u64 },
    SessionConfigureFailed { generation: u64 },
    Closed,
}

/// Request template for a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTemplate {
    Preview,
    Record,
}

/// Callback target for device events. Cheap to clone.
#[derive(Clone)]
pub struct DeviceEventSink {
    deliver: Arc<dyn Fn(DeviceEvent) + Send + Sync>,
}

impl DeviceEventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn send(&self, event: DeviceEvent) {
        (self.deliver)(event);
    }
}

impl fmt::Debug for DeviceEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceEventSink")
    }
}

/// Opens physical cameras.
pub trait CameraProvider: Send + Sync {
    /// Output sizes the device supports for preview/record surfaces.
    fn output_sizes(&self, device_id: &str) -> RecorderResult<Vec<FrameSize>>;

    /// Begin opening a device. Readiness arrives later as [`DeviceEvent::Opened`].
    fn open(
        &self,
        device_id: &str,
        size: FrameSize,
        events: DeviceEventSink,
    ) -> RecorderResult<Box<dyn CameraDevice>>;
}

/// An opened physical camera.
pub trait CameraDevice: Send {
    /// Replace the capture session. The result arrives as
    /// `SessionConfigured`/`SessionConfigureFailed` tagged with `generation`.
    fn create_session(
        &mut self,
        outputs: &[Surface],
        template: SessionTemplate,
        generation: u64,
    ) -> RecorderResult<()>;

    /// Stop repeating requests and drop the current session.
    fn close_session(&mut self) -> RecorderResult<()>;

    /// Capture one still image to `path` (JPEG).
    fn capture_still(&mut self, path: &Path) -> RecorderResult<()>;

    fn close(&mut self) -> RecorderResult<()>;
}
