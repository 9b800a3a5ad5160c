//! Segment files: naming, per-run bookkeeping and close-time validation.
//!
//! Segments opened on the rotation cadence are stamped with the planned time
//! of their tick, `run_start + k * duration`, so all cameras agree on the
//! prefix of each segment. A segment opened off the cadence by recovery is
//! stamped with the time it was actually opened. Stamps only move forward,
//! so names never collide within a run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::camera::SlotPosition;
use crate::error::{RecorderError, RecorderResult};

/// Files below this size at close are treated as corrupted and deleted.
pub const MIN_SEGMENT_BYTES: u64 = 10 * 1024;

/// `yyyyMMdd_HHmmss`
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub const VIDEO_EXTENSION: &str = "mp4";
pub const SNAPSHOT_EXTENSION: &str = "jpg";

/// Shared timestamp of one recording run or snapshot burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    started_at: NaiveDateTime,
}

impl RunId {
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    /// Sub-second precision is dropped; names only carry seconds.
    pub fn from_datetime(started_at: NaiveDateTime) -> Self {
        Self {
            started_at: started_at.with_nanosecond(0).unwrap_or(started_at),
        }
    }

    pub fn parse(stamp: &str) -> RecorderResult<Self> {
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .map(Self::from_datetime)
            .map_err(|e| RecorderError::InvalidState(format!("bad run stamp '{}': {}", stamp, e)))
    }

    pub fn started_at(&self) -> NaiveDateTime {
        self.started_at
    }

    pub fn stamp(&self) -> String {
        self.started_at.format(STAMP_FORMAT).to_string()
    }

    /// Nominal start time of segment `index`.
    ///
    /// Segments shorter than a second are spread one second apart so their
    /// names stay distinct.
    pub fn segment_time(&self, index: u32, duration: Duration) -> NaiveDateTime {
        let nominal_ms = duration.as_millis() as i64 * index as i64;
        let offset_ms = nominal_ms.max(index as i64 * 1000);
        self.started_at + chrono::Duration::milliseconds(offset_ms)
    }

    pub fn segment_stamp(&self, index: u32, duration: Duration) -> String {
        self.segment_time(index, duration)
            .format(STAMP_FORMAT)
            .to_string()
    }

    /// Name of the per-run manifest file.
    pub fn manifest_name(&self) -> String {
        format!("{}_manifest.json", self.stamp())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stamp())
    }
}

/// `{stamp}_{slot}.mp4`
pub fn segment_file_name(stamp: &str, position: SlotPosition) -> String {
    format!("{}_{}.{}", stamp, position, VIDEO_EXTENSION)
}

/// `{stamp}_{slot}.jpg`
pub fn snapshot_file_name(stamp: &str, position: SlotPosition) -> String {
    format!("{}_{}.{}", stamp, position, SNAPSHOT_EXTENSION)
}

/// Outcome of closing one segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    Kept { path: PathBuf, bytes: u64 },
    /// Undersized (or missing) and removed from disk.
    Deleted { path: PathBuf, bytes: u64 },
}

impl SegmentOutcome {
    pub fn path(&self) -> &Path {
        match self {
            SegmentOutcome::Kept { path, .. } | SegmentOutcome::Deleted { path, .. } => path,
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            SegmentOutcome::Kept { bytes, .. } | SegmentOutcome::Deleted { bytes, .. } => *bytes,
        }
    }

    pub fn is_kept(&self) -> bool {
        matches!(self, SegmentOutcome::Kept { .. })
    }
}

pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Keep `path` if it reached [`MIN_SEGMENT_BYTES`], otherwise delete it.
pub fn validate_segment_file(path: &Path) -> SegmentOutcome {
    let bytes = file_size(path);
    if bytes >= MIN_SEGMENT_BYTES {
        return SegmentOutcome::Kept {
            path: path.to_path_buf(),
            bytes,
        };
    }

    match std::fs::remove_file(path) {
        Ok(()) => log::warn!(
            "[SEGMENT] Deleted undersized segment {} ({} bytes)",
            path.display(),
            bytes
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => log::warn!(
            "[SEGMENT] Failed to delete undersized segment {}: {}",
            path.display(),
            e
        ),
    }
    SegmentOutcome::Deleted {
        path: path.to_path_buf(),
        bytes,
    }
}

/// Remove a file that never became a segment (a failed rotation attempt).
pub fn discard_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("[SEGMENT] Failed to discard {}: {}", path.display(), e);
        }
    }
}

/// Why a segment is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStart {
    /// First segment or a rotation tick.
    Scheduled,
    /// Rebuilt by recovery at this wall-clock time.
    Recovered(NaiveDateTime),
}

/// Name chosen for the next segment, consumed by [`RecordingRun::begin_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub stamp: NaiveDateTime,
    pub path: PathBuf,
}

/// One contiguous output file.
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: u32,
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
    /// Diagnostic only.
    pub frames: u64,
}

/// Segments of one start-to-stop cycle for one camera.
#[derive(Debug)]
pub struct RecordingRun {
    run_id: RunId,
    position: SlotPosition,
    output_dir: PathBuf,
    segment_duration: Duration,
    next_index: u32,
    /// Rotation ticks since the run started.
    ticks: u32,
    last_stamp: Option<NaiveDateTime>,
    current: Option<Segment>,
    kept: Vec<PathBuf>,
    deleted: Vec<PathBuf>,
}

impl RecordingRun {
    pub fn new(
        run_id: RunId,
        position: SlotPosition,
        output_dir: impl Into<PathBuf>,
        segment_duration: Duration,
    ) -> Self {
        Self {
            run_id,
            position,
            output_dir: output_dir.into(),
            segment_duration,
            next_index: 0,
            ticks: 0,
            last_stamp: None,
            current: None,
            kept: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Count one rotation tick. Ticks keep counting while recovery owns the
    /// segment so the cadence names stay aligned with wall-clock time.
    pub fn tick(&mut self) {
        self.ticks += 1;
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Choose the stamp and path of the next segment.
    pub fn plan(&self, start: SegmentStart) -> SegmentPlan {
        let wanted = match start {
            SegmentStart::Scheduled => self.run_id.segment_time(self.ticks, self.segment_duration),
            SegmentStart::Recovered(at) => RunId::from_datetime(at).started_at(),
        };
        let stamp = match self.last_stamp {
            Some(last) if wanted <= last => last + chrono::Duration::seconds(1),
            _ => wanted,
        };
        let path = self.output_dir.join(segment_file_name(
            &stamp.format(STAMP_FORMAT).to_string(),
            self.position,
        ));
        SegmentPlan { stamp, path }
    }

    /// Open the next segment at a path from [`RecordingRun::plan`].
    pub fn begin_segment(&mut self, plan: SegmentPlan) -> RecorderResult<&mut Segment> {
        if let Some(current) = &self.current {
            return Err(RecorderError::InvalidState(format!(
                "segment {} is still open",
                current.index
            )));
        }
        let segment = Segment {
            index: self.next_index,
            path: plan.path,
            started_at: Local::now(),
            frames: 0,
        };
        self.next_index += 1;
        self.last_stamp = Some(plan.stamp);
        Ok(self.current.insert(segment))
    }

    pub fn current(&self) -> Option<&Segment> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Segment> {
        self.current.as_mut()
    }

    /// Validate and close the open segment.
    pub fn close_current(&mut self) -> Option<(Segment, SegmentOutcome)> {
        let segment = self.current.take()?;
        let outcome = validate_segment_file(&segment.path);
        match &outcome {
            SegmentOutcome::Kept { path, .. } => self.kept.push(path.clone()),
            SegmentOutcome::Deleted { path, .. } => self.deleted.push(path.clone()),
        }
        log::debug!(
            "[SEGMENT] {} segment {} closed after {} frames: {:?}",
            self.position,
            segment.index,
            segment.frames,
            outcome
        );
        Some((segment, outcome))
    }

    /// Drop the open segment without validating it and remove its file.
    /// Used for a placeholder that never received a frame because the run
    /// was stopped before it started.
    pub fn abandon_current(&mut self) -> Option<Segment> {
        let segment = self.current.take()?;
        discard_file(&segment.path);
        log::debug!(
            "[SEGMENT] {} placeholder {} abandoned: {}",
            self.position,
            segment.index,
            segment.path.display()
        );
        Some(segment)
    }

    /// Surviving files, oldest first.
    pub fn files(&self) -> &[PathBuf] {
        &self.kept
    }

    pub fn deleted(&self) -> &[PathBuf] {
        &self.deleted
    }
}
