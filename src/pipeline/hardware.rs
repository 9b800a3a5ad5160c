//! Direct hardware-writer recording path.
//!
//! The camera session renders straight into the writer's input surface.
//! A writer is single-use, so rotation stops it, creates the next one on a
//! fresh surface and waits in [`HardwarePhase::AwaitingReconfiguration`]
//! until the owner reconfigures the camera session with that surface.
//! Preview and recording stall briefly at every rotation boundary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Local;
use parking_lot::Mutex;

use super::monitor::FileSizeMonitor;
use super::recovery::{RecoveryDelay, RecoveryTracker};
use super::segment::{
    discard_file, file_size, RecordingRun, SegmentOutcome, SegmentStart, MIN_SEGMENT_BYTES,
};
use super::{PipelineConfig, PipelineContext, PipelineEvent};
use crate::camera::SlotPosition;
use crate::error::{RecorderError, RecorderResult};
use crate::media::{MediaWriter, Surface, WriterConfig, WriterFactory};
use crate::runtime::{TimerSlot, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwarePhase {
    Idle,
    Prepared,
    Recording,
    SwitchingSegment,
    /// A new writer is prepared; waiting for the session to pick up its surface.
    AwaitingReconfiguration,
    /// The writer failed; a rebuild is scheduled.
    Recovering,
    Stopping,
}

struct ActiveWriter {
    writer: Box<dyn MediaWriter>,
    path: PathBuf,
    started: bool,
}

struct HardwareState {
    phase: HardwarePhase,
    stopped: bool,
    run: RecordingRun,
    writer: Option<ActiveWriter>,
    /// Closed file of the rotation in progress, reported once the new segment starts.
    pending_completed: Option<PathBuf>,
    recovery: RecoveryTracker,
    monitor: FileSizeMonitor,
}

struct HardwareInner {
    config: PipelineConfig,
    context: PipelineContext,
    factory: Arc<dyn WriterFactory>,
    worker: Worker,
    state: Mutex<HardwareState>,
    recording: AtomicBool,
    rotation_timer: TimerSlot,
    recovery_timer: TimerSlot,
    reconfigure_timer: TimerSlot,
    watchdog_timer: TimerSlot,
}

/// Hardware-writer pipeline for one camera.
pub struct HardwarePipeline {
    inner: Arc<HardwareInner>,
}

impl HardwarePipeline {
    pub fn new(
        config: PipelineConfig,
        factory: Arc<dyn WriterFactory>,
        context: PipelineContext,
    ) -> RecorderResult<Self> {
        let worker = Worker::spawn(format!("hw-pipeline-{}", config.position))?;
        let timings = context.timings;
        let run = RecordingRun::new(
            config.run_id,
            config.position,
            config.output_dir.clone(),
            timings.segment_duration,
        );
        Ok(Self {
            inner: Arc::new(HardwareInner {
                state: Mutex::new(HardwareState {
                    phase: HardwarePhase::Idle,
                    stopped: false,
                    monitor: FileSizeMonitor::new(run.plan(SegmentStart::Scheduled).path),
                    run,
                    writer: None,
                    pending_completed: None,
                    recovery: timings.recovery_tracker(),
                }),
                config,
                context,
                factory,
                worker,
                recording: AtomicBool::new(false),
                rotation_timer: TimerSlot::new(),
                recovery_timer: TimerSlot::new(),
                reconfigure_timer: TimerSlot::new(),
                watchdog_timer: TimerSlot::new(),
            }),
        })
    }

    pub fn position(&self) -> SlotPosition {
        self.inner.config.position
    }

    pub fn phase(&self) -> HardwarePhase {
        self.inner.state.lock().phase
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    /// Create the first writer and return its input surface.
    pub fn prepare(&self) -> RecorderResult<Surface> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .worker
            .call(self.inner.context.timings.init_timeout, move || {
                inner.prepare_on_worker()
            })?
    }

    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || inner.start_on_worker());
    }

    /// Resume after the session picked up a replaced surface.
    pub fn on_session_configured(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || inner.resume_on_worker());
    }

    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || inner.stop_on_worker());
    }

    pub fn shutdown(&self) {
        self.stop();
        self.inner.worker.shutdown();
    }
}

fn post_to_worker<F>(weak: &Weak<HardwareInner>, task: F)
where
    F: FnOnce(&Arc<HardwareInner>) + Send + 'static,
{
    if let Some(inner) = weak.upgrade() {
        let target = Arc::clone(&inner);
        inner.worker.post(move || task(&target));
    }
}

impl HardwareInner {
    fn position(&self) -> SlotPosition {
        self.config.position
    }

    fn emit(&self, event: PipelineEvent) {
        self.context.emit(event);
    }

    fn set_phase(&self, state: &mut HardwareState, phase: HardwarePhase) {
        if state.phase != phase {
            log::debug!(
                "[HW_PIPELINE] {} {:?} -> {:?}",
                self.position(),
                state.phase,
                phase
            );
        }
        state.phase = phase;
        self.recording
            .store(phase == HardwarePhase::Recording, Ordering::SeqCst);
    }

    fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            size: self.config.size,
            bitrate: self.config.bitrate,
            frame_rate: self.config.frame_rate,
        }
    }

    fn prepare_on_worker(&self) -> RecorderResult<Surface> {
        let mut state = self.state.lock();
        if state.phase != HardwarePhase::Idle || state.stopped {
            return Err(RecorderError::InvalidState(format!(
                "hardware pipeline {} already prepared",
                self.position()
            )));
        }
        let surface = self.open_writer(&mut state, SegmentStart::Scheduled)?;
        self.set_phase(&mut state, HardwarePhase::Prepared);
        log::info!(
            "[HW_PIPELINE] {} prepared at {} ({} bps, {} fps)",
            self.position(),
            self.config.size,
            self.config.bitrate,
            self.config.frame_rate
        );
        Ok(surface)
    }

    /// Create and prepare a writer for the next segment.
    fn open_writer(&self, state: &mut HardwareState, start: SegmentStart) -> RecorderResult<Surface> {
        if let Some(current) = state.run.current() {
            return Err(RecorderError::InvalidState(format!(
                "segment {} still open",
                current.index
            )));
        }

        let plan = state.run.plan(start);
        let path = plan.path.clone();
        let mut writer = self.factory.create_writer(&self.writer_config())?;
        let surface = match writer.prepare(&path) {
            Ok(surface) => surface,
            Err(e) => {
                writer.release();
                discard_file(&path);
                return Err(e);
            },
        };

        let index = match state.run.begin_segment(plan) {
            Ok(segment) => segment.index,
            Err(e) => {
                writer.release();
                discard_file(&path);
                return Err(e);
            },
        };
        state.monitor.retarget(&path);
        state.writer = Some(ActiveWriter {
            writer,
            path: path.clone(),
            started: false,
        });
        log::info!(
            "[HW_PIPELINE] {} segment {} -> {}",
            self.position(),
            index,
            path.display()
        );
        self.emit(PipelineEvent::SegmentOpened {
            position: self.position(),
            index,
            path,
        });
        Ok(surface)
    }

    fn start_writer(&self, state: &mut HardwareState) -> RecorderResult<()> {
        let active = state
            .writer
            .as_mut()
            .ok_or_else(|| RecorderError::InvalidState("no writer to start".to_string()))?;
        active.writer.start()?;
        active.started = true;
        Ok(())
    }

    /// Stop and release the writer, then validate its file. An undersized
    /// file skips the stop and is deleted.
    fn close_writer(&self, state: &mut HardwareState) -> Option<SegmentOutcome> {
        if let Some(mut active) = state.writer.take() {
            let bytes = file_size(&active.path);
            if active.started && bytes >= MIN_SEGMENT_BYTES {
                if let Err(e) = active.writer.stop() {
                    log::warn!("[HW_PIPELINE] {} writer stop: {}", self.position(), e);
                }
            } else if active.started {
                log::debug!(
                    "[HW_PIPELINE] {} skipping stop for undersized file ({} bytes)",
                    self.position(),
                    bytes
                );
            }
            active.writer.release();
        }

        let (segment, outcome) = state.run.close_current()?;
        self.emit(PipelineEvent::SegmentClosed {
            position: self.position(),
            index: segment.index,
            path: segment.path.clone(),
            bytes: outcome.bytes(),
            kept: outcome.is_kept(),
        });
        if !outcome.is_kept() {
            let name = segment
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.emit(PipelineEvent::CorruptedFilesDeleted {
                position: self.position(),
                files: vec![name],
            });
        }
        Some(outcome)
    }

    fn start_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != HardwarePhase::Prepared {
            log::warn!(
                "[HW_PIPELINE] {} start ignored in {:?}",
                self.position(),
                state.phase
            );
            return;
        }

        self.arm_rotation();
        self.arm_watchdog();
        match self.start_writer(state) {
            Ok(()) => {
                self.set_phase(state, HardwarePhase::Recording);
                log::info!(
                    "[HW_PIPELINE] {} recording, segments every {:?}",
                    self.position(),
                    self.context.timings.segment_duration
                );
                self.emit(PipelineEvent::Started {
                    position: self.position(),
                });
            },
            Err(e) => {
                log::error!("[HW_PIPELINE] {} writer start failed: {}", self.position(), e);
                self.enter_recovery(state, e);
            },
        }
    }

    fn arm_rotation(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.rotation_timer.arm(
            &self.context.clock,
            "hw-rotation",
            self.context.timings.segment_duration,
            move || post_to_worker(&weak, |inner| inner.rotate_on_worker()),
        );
    }

    fn arm_watchdog(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.watchdog_timer.arm(
            &self.context.clock,
            "hw-watchdog",
            self.context.timings.size_check_interval,
            move || post_to_worker(&weak, |inner| inner.watchdog()),
        );
    }

    fn arm_reconfigure_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.reconfigure_timer.arm(
            &self.context.clock,
            "hw-reconfigure-timeout",
            self.context.timings.reconfigure_timeout,
            move || post_to_worker(&weak, |inner| inner.reconfigure_timed_out()),
        );
    }

    fn rotate_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.stopped || state.phase == HardwarePhase::Stopping {
            return;
        }
        self.arm_rotation();
        state.run.tick();
        if state.phase != HardwarePhase::Recording {
            log::debug!(
                "[HW_PIPELINE] {} rotation skipped in {:?}",
                self.position(),
                state.phase
            );
            return;
        }

        self.set_phase(state, HardwarePhase::SwitchingSegment);
        state.pending_completed = self
            .close_writer(state)
            .filter(SegmentOutcome::is_kept)
            .map(|outcome| outcome.path().to_path_buf());

        match self.open_writer(state, SegmentStart::Scheduled) {
            Ok(surface) => self.await_reconfiguration(state, surface),
            Err(e) => {
                log::error!("[HW_PIPELINE] {} rotation failed: {}", self.position(), e);
                self.enter_recovery(state, e);
            },
        }
    }

    fn await_reconfiguration(self: &Arc<Self>, state: &mut HardwareState, surface: Surface) {
        self.set_phase(state, HardwarePhase::AwaitingReconfiguration);
        self.arm_reconfigure_timeout();
        self.emit(PipelineEvent::SurfaceReplaced {
            position: self.position(),
            surface,
        });
    }

    fn resume_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != HardwarePhase::AwaitingReconfiguration {
            return;
        }
        self.reconfigure_timer.cancel(&self.context.clock);

        if let Err(e) = self.start_writer(state) {
            log::error!("[HW_PIPELINE] {} writer start failed: {}", self.position(), e);
            self.enter_recovery(state, e);
            return;
        }
        self.set_phase(state, HardwarePhase::Recording);

        let new_index = state.run.current().map(|s| s.index).unwrap_or_default();
        if state.recovery.is_recovering() {
            let attempts = state.recovery.succeeded();
            log::info!(
                "[HW_PIPELINE] {} recovered after {} attempt(s), segment {}",
                self.position(),
                attempts,
                new_index
            );
            self.emit(PipelineEvent::Recovered {
                position: self.position(),
                attempts,
            });
        } else {
            log::info!(
                "[HW_PIPELINE] {} rotated to segment {}",
                self.position(),
                new_index
            );
        }
        self.emit(PipelineEvent::SegmentSwitched {
            position: self.position(),
            completed: state.pending_completed.take(),
            new_index,
        });
    }

    fn reconfigure_timed_out(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != HardwarePhase::AwaitingReconfiguration {
            return;
        }
        let error = RecorderError::Timeout(format!(
            "session did not pick up the new surface within {:?}",
            self.context.timings.reconfigure_timeout
        ));
        self.enter_recovery(state, error);
    }

    fn watchdog(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.stopped || state.phase == HardwarePhase::Stopping {
            return;
        }
        self.arm_watchdog();
        if state.phase != HardwarePhase::Recording {
            return;
        }

        let check = state.monitor.check();
        log::debug!(
            "[HW_PIPELINE] {} file {} bytes (+{})",
            self.position(),
            check.bytes,
            check.grown_by
        );
        if check.stalled_checks >= self.context.timings.stall_checks {
            let error = RecorderError::WriterError(format!(
                "no output growth for {} checks",
                check.stalled_checks
            ));
            self.enter_recovery(state, error);
        }
    }

    fn enter_recovery(self: &Arc<Self>, state: &mut HardwareState, error: RecorderError) {
        self.set_phase(state, HardwarePhase::Recovering);
        self.reconfigure_timer.cancel(&self.context.clock);
        self.close_writer(state);

        let delay = state.recovery.next_delay();
        match delay {
            RecoveryDelay::Fast { attempt, delay } => log::warn!(
                "[HW_PIPELINE] {} recovery attempt {}/{} in {:?}: {}",
                self.position(),
                attempt,
                self.context.timings.max_recovery_attempts,
                delay,
                error
            ),
            RecoveryDelay::Normal { attempt, delay } => log::error!(
                "[HW_PIPELINE] {} still failing after {} attempts, retrying every {:?}: {}",
                self.position(),
                attempt - 1,
                delay,
                error
            ),
        }
        self.emit(PipelineEvent::Error {
            position: self.position(),
            message: error.to_string(),
            recovering: true,
        });

        let weak = Arc::downgrade(self);
        self.recovery_timer.arm(
            &self.context.clock,
            "hw-recovery",
            delay.delay(),
            move || post_to_worker(&weak, |inner| inner.recover_on_worker()),
        );
    }

    fn recover_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != HardwarePhase::Recovering {
            return;
        }
        let opened_at = Local::now().naive_local();
        match self.open_writer(state, SegmentStart::Recovered(opened_at)) {
            Ok(surface) => self.await_reconfiguration(state, surface),
            Err(e) => self.enter_recovery(state, e),
        }
    }

    fn stop_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.stopped {
            log::debug!("[HW_PIPELINE] {} already stopped", self.position());
            return;
        }

        let clock = &self.context.clock;
        self.rotation_timer.cancel(clock);
        self.recovery_timer.cancel(clock);
        self.reconfigure_timer.cancel(clock);
        self.watchdog_timer.cancel(clock);

        let started = !matches!(state.phase, HardwarePhase::Idle | HardwarePhase::Prepared);
        self.set_phase(state, HardwarePhase::Stopping);
        if started {
            self.close_writer(state);
        } else {
            if let Some(mut active) = state.writer.take() {
                active.writer.release();
            }
            if let Some(segment) = state.run.abandon_current() {
                self.emit(PipelineEvent::SegmentDiscarded {
                    position: self.position(),
                    path: segment.path,
                });
            }
        }
        state.stopped = true;
        self.set_phase(state, HardwarePhase::Idle);

        let files = state.run.files().to_vec();
        let deleted = state.run.deleted().len();
        log::info!(
            "[HW_PIPELINE] {} stopped: {} file(s) kept, {} deleted",
            self.position(),
            files.len(),
            deleted
        );
        self.emit(PipelineEvent::Stopped {
            position: self.position(),
            files,
            deleted,
        });
    }
}
