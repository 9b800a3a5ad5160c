//! Per-camera recording pipelines.
//!
//! Two backends share one surface:
//! - [`HardwarePipeline`]: the camera renders straight into a platform writer.
//!   Rotation recreates the writer and its input surface, so the camera
//!   session must be reconfigured before the next segment starts.
//! - [`SoftwarePipeline`]: frames go through a [`crate::render::FrameRenderer`]
//!   into an encoder whose output is muxed here. Rotation only rebinds the
//!   renderer's output, so the camera session is left alone.
//!
//! The backend is chosen once per run and wrapped in [`RecordingPipeline`].
//! Pipelines report to their owner through [`PipelineEvent`]s.

pub mod hardware;
pub mod monitor;
pub mod recovery;
pub mod segment;
pub mod software;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::camera::SlotPosition;
use crate::error::RecorderResult;
use crate::media::{EncoderFactory, FrameSize, Surface, WriterFactory};
use crate::runtime::CoordinationClock;

pub use hardware::{HardwarePhase, HardwarePipeline};
pub use monitor::{FileSizeMonitor, SizeCheck};
pub use recovery::{RecoveryDelay, RecoveryTracker, MAX_RECOVERY_ATTEMPTS, RECOVERY_INTERVAL_MS};
pub use segment::{
    segment_file_name, snapshot_file_name, validate_segment_file, RecordingRun, RunId, Segment,
    SegmentOutcome, SegmentPlan, SegmentStart, MIN_SEGMENT_BYTES,
};
pub use software::{SoftwarePhase, SoftwarePipeline};

/// Which backend a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineKind {
    Hardware,
    Software,
}

/// Per-camera settings fixed for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub position: SlotPosition,
    pub run_id: RunId,
    pub output_dir: PathBuf,
    pub size: FrameSize,
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Composite the timestamp overlay (software only).
    pub watermark: bool,
    pub mirror: bool,
    pub prefer_gpu: bool,
    /// Use the CPU-copy frame source instead of zero-copy import.
    pub cpu_copy: bool,
}

/// Timers and limits shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTimings {
    pub segment_duration: Duration,
    pub recovery_interval: Duration,
    pub max_recovery_attempts: u32,
    /// Software encoder health check period.
    pub health_check_interval: Duration,
    /// Frames rendered without any encoder output before the encoder is unhealthy.
    pub unhealthy_frame_threshold: u32,
    pub first_size_check: Duration,
    pub size_check_interval: Duration,
    /// Consecutive no-growth size checks before a hardware writer counts as stalled.
    pub stall_checks: u32,
    pub first_write_timeout: Duration,
    /// Encoder-thread initialisation handshake.
    pub init_timeout: Duration,
    /// Bound on the end-of-stream drain at segment close.
    pub eos_timeout: Duration,
    /// How long a hardware rotation waits for the camera session to pick up
    /// the new surface.
    pub reconfigure_timeout: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            segment_duration: Duration::from_secs(60),
            recovery_interval: Duration::from_millis(RECOVERY_INTERVAL_MS),
            max_recovery_attempts: MAX_RECOVERY_ATTEMPTS,
            health_check_interval: Duration::from_secs(3),
            unhealthy_frame_threshold: 30,
            first_size_check: Duration::from_millis(500),
            size_check_interval: Duration::from_secs(5),
            stall_checks: 3,
            first_write_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(5),
            eos_timeout: Duration::from_secs(1),
            reconfigure_timeout: Duration::from_secs(3),
        }
    }
}

impl PipelineTimings {
    pub fn with_segment_duration(mut self, segment_duration: Duration) -> Self {
        self.segment_duration = segment_duration;
        self
    }

    pub(crate) fn recovery_tracker(&self) -> RecoveryTracker {
        RecoveryTracker::new(
            self.recovery_interval,
            self.max_recovery_attempts,
            self.segment_duration,
        )
    }
}

/// Messages a pipeline sends to its owner.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Started {
        position: SlotPosition,
    },
    SegmentOpened {
        position: SlotPosition,
        index: u32,
        path: PathBuf,
    },
    SegmentClosed {
        position: SlotPosition,
        index: u32,
        path: PathBuf,
        bytes: u64,
        kept: bool,
    },
    /// The placeholder of a run that never started was removed unchecked.
    SegmentDiscarded {
        position: SlotPosition,
        path: PathBuf,
    },
    /// A rotation finished; `completed` is the closed file if it was kept.
    SegmentSwitched {
        position: SlotPosition,
        completed: Option<PathBuf>,
        new_index: u32,
    },
    /// Hardware only: the camera session must be reconfigured with `surface`
    /// before recording resumes.
    SurfaceReplaced {
        position: SlotPosition,
        surface: Surface,
    },
    CorruptedFilesDeleted {
        position: SlotPosition,
        files: Vec<String>,
    },
    Error {
        position: SlotPosition,
        message: String,
        recovering: bool,
    },
    Recovered {
        position: SlotPosition,
        attempts: u32,
    },
    Stopped {
        position: SlotPosition,
        files: Vec<PathBuf>,
        deleted: usize,
    },
}

impl PipelineEvent {
    pub fn position(&self) -> SlotPosition {
        match self {
            PipelineEvent::Started { position }
            | PipelineEvent::SegmentOpened { position, .. }
            | PipelineEvent::SegmentClosed { position, .. }
            | PipelineEvent::SegmentDiscarded { position, .. }
            | PipelineEvent::SegmentSwitched { position, .. }
            | PipelineEvent::SurfaceReplaced { position, .. }
            | PipelineEvent::CorruptedFilesDeleted { position, .. }
            | PipelineEvent::Error { position, .. }
            | PipelineEvent::Recovered { position, .. }
            | PipelineEvent::Stopped { position, .. } => *position,
        }
    }
}

/// Encoder and writer factories the pipelines draw from.
#[derive(Clone)]
pub struct PipelineBackends {
    pub encoders: Arc<dyn EncoderFactory>,
    pub writers: Arc<dyn WriterFactory>,
}

/// Shared plumbing handed to every pipeline of a run.
#[derive(Clone)]
pub struct PipelineContext {
    pub clock: CoordinationClock,
    pub timings: PipelineTimings,
    pub events: flume::Sender<PipelineEvent>,
}

impl PipelineContext {
    pub(crate) fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            log::trace!("[PIPELINE] event dropped, owner is gone");
        }
    }
}

/// One camera's pipeline for one run.
pub enum RecordingPipeline {
    Hardware(HardwarePipeline),
    Software(SoftwarePipeline),
}

impl RecordingPipeline {
    pub fn new(
        kind: PipelineKind,
        config: PipelineConfig,
        backends: &PipelineBackends,
        context: PipelineContext,
    ) -> RecorderResult<Self> {
        Ok(match kind {
            PipelineKind::Hardware => RecordingPipeline::Hardware(HardwarePipeline::new(
                config,
                Arc::clone(&backends.writers),
                context,
            )?),
            PipelineKind::Software => RecordingPipeline::Software(SoftwarePipeline::new(
                config,
                Arc::clone(&backends.encoders),
                context,
            )?),
        })
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            RecordingPipeline::Hardware(_) => PipelineKind::Hardware,
            RecordingPipeline::Software(_) => PipelineKind::Software,
        }
    }

    pub fn position(&self) -> SlotPosition {
        match self {
            RecordingPipeline::Hardware(p) => p.position(),
            RecordingPipeline::Software(p) => p.position(),
        }
    }

    /// Open the first segment and return the surface the camera session
    /// must render into.
    pub fn prepare(&self) -> RecorderResult<Surface> {
        match self {
            RecordingPipeline::Hardware(p) => p.prepare(),
            RecordingPipeline::Software(p) => p.prepare(),
        }
    }

    pub fn start(&self) {
        match self {
            RecordingPipeline::Hardware(p) => p.start(),
            RecordingPipeline::Software(p) => p.start(),
        }
    }

    /// Stop, close and validate the open segment. Reports
    /// [`PipelineEvent::Stopped`] once; later calls are no-ops.
    pub fn stop(&self) {
        match self {
            RecordingPipeline::Hardware(p) => p.stop(),
            RecordingPipeline::Software(p) => p.stop(),
        }
    }

    /// The camera session finished a reconfiguration that carried this
    /// pipeline's surface.
    pub fn on_session_configured(&self) {
        if let RecordingPipeline::Hardware(p) = self {
            p.on_session_configured();
        }
    }

    pub fn is_recording(&self) -> bool {
        match self {
            RecordingPipeline::Hardware(p) => p.is_recording(),
            RecordingPipeline::Software(p) => p.is_recording(),
        }
    }

    /// Stop if needed and join the pipeline's worker.
    pub fn shutdown(&self) {
        match self {
            RecordingPipeline::Hardware(p) => p.shutdown(),
            RecordingPipeline::Software(p) => p.shutdown(),
        }
    }
}
