//! GPU-composited recording path.
//!
//! Camera frames land on the renderer's input surface. Each frame-available
//! notification is forwarded to the pipeline's worker, which renders the
//! frame into the encoder's input (or just consumes it when not recording)
//! and drains whatever the encoder produced into the muxer. The worker owns
//! the render context, so every GPU call happens on one thread.
//!
//! Rotation closes the muxer, recreates the encoder and rebinds the
//! renderer's output. The camera keeps rendering into the same input surface
//! throughout, so no session reconfiguration is needed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::Mutex;

use super::monitor::FileSizeMonitor;
use super::recovery::{RecoveryDelay, RecoveryTracker};
use super::segment::{discard_file, RecordingRun, SegmentOutcome, SegmentStart};
use super::{PipelineConfig, PipelineContext, PipelineEvent};
use crate::camera::SlotPosition;
use crate::error::{RecorderError, RecorderResult};
use crate::media::{
    ContainerMuxer, EncoderFactory, EncoderFormat, EncoderOutput, PtsGuard, SegmentClock,
    Surface, VideoEncoder,
};
use crate::render::{create_render_context, FrameRenderer, RendererOptions};
use crate::runtime::{TimerSlot, Worker};

/// Poll interval while waiting for end of stream.
const EOS_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftwarePhase {
    Idle,
    Prepared,
    Recording,
    /// Encoder or muxer failed; a rebuild is scheduled.
    Recovering,
    Stopped,
}

/// Encoder plus muxer for the open segment.
struct EncoderStage {
    encoder: Box<dyn VideoEncoder>,
    muxer: Box<dyn ContainerMuxer>,
    track: Option<usize>,
}

impl EncoderStage {
    /// Release both halves, logging instead of failing.
    fn release(mut self, position: SlotPosition) {
        if let Err(e) = self.encoder.stop() {
            log::warn!("[SW_PIPELINE] {} encoder stop: {}", position, e);
        }
        self.encoder.release();
        if self.track.is_some() {
            if let Err(e) = self.muxer.stop() {
                log::warn!("[SW_PIPELINE] {} muxer stop: {}", position, e);
            }
        }
        self.muxer.release();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DrainStats {
    samples: u64,
    end_of_stream: bool,
}

/// Move every available encoder output into the muxer.
fn drain_stage(
    stage: &mut EncoderStage,
    pts: &mut PtsGuard,
    clock: &SegmentClock,
    timeout: Duration,
) -> RecorderResult<DrainStats> {
    let mut stats = DrainStats::default();
    loop {
        match stage.encoder.dequeue_output(timeout)? {
            EncoderOutput::TryAgainLater => return Ok(stats),
            EncoderOutput::FormatChanged(format) => {
                if stage.track.is_some() {
                    log::warn!("[SW_PIPELINE] Ignoring second format change ({})", format.size);
                    continue;
                }
                let track = stage.muxer.add_track(&format)?;
                stage.muxer.start()?;
                stage.track = Some(track);
            },
            EncoderOutput::Sample(sample) => {
                if sample.codec_config {
                    continue;
                }
                let Some(track) = stage.track else {
                    log::debug!("[SW_PIPELINE] Dropping sample before format is known");
                    continue;
                };
                let pts_us = pts.process(clock.elapsed_us());
                stage.muxer.write_sample(track, &sample, pts_us)?;
                stats.samples += 1;
            },
            EncoderOutput::EndOfStream => {
                stats.end_of_stream = true;
                return Ok(stats);
            },
        }
    }
}

struct SoftwareState {
    phase: SoftwarePhase,
    run: RecordingRun,
    renderer: Option<FrameRenderer>,
    stage: Option<EncoderStage>,
    segment_clock: SegmentClock,
    pts: PtsGuard,
    recovery: RecoveryTracker,
    monitor: FileSizeMonitor,
    frames_without_output: u32,
    drain_failed: bool,
    samples_written: u64,
}

struct SoftwareInner {
    config: PipelineConfig,
    context: PipelineContext,
    factory: Arc<dyn EncoderFactory>,
    worker: Worker,
    state: Mutex<SoftwareState>,
    frame_task_queued: AtomicBool,
    recording: AtomicBool,
    rotation_timer: TimerSlot,
    recovery_timer: TimerSlot,
    health_timer: TimerSlot,
    monitor_timer: TimerSlot,
    first_write_timer: TimerSlot,
}

/// Software-encoder pipeline for one camera.
pub struct SoftwarePipeline {
    inner: Arc<SoftwareInner>,
}

impl SoftwarePipeline {
    pub fn new(
        config: PipelineConfig,
        factory: Arc<dyn EncoderFactory>,
        context: PipelineContext,
    ) -> RecorderResult<Self> {
        let worker = Worker::spawn(format!("sw-pipeline-{}", config.position))?;
        let timings = context.timings;
        let run = RecordingRun::new(
            config.run_id,
            config.position,
            config.output_dir.clone(),
            timings.segment_duration,
        );
        let stream_name = format!("SW_PIPELINE:{}", config.position);
        Ok(Self {
            inner: Arc::new(SoftwareInner {
                state: Mutex::new(SoftwareState {
                    phase: SoftwarePhase::Idle,
                    monitor: FileSizeMonitor::new(run.plan(SegmentStart::Scheduled).path),
                    run,
                    renderer: None,
                    stage: None,
                    segment_clock: SegmentClock::start_now(),
                    pts: PtsGuard::new(stream_name),
                    recovery: timings.recovery_tracker(),
                    frames_without_output: 0,
                    drain_failed: false,
                    samples_written: 0,
                }),
                config,
                context,
                factory,
                worker,
                frame_task_queued: AtomicBool::new(false),
                recording: AtomicBool::new(false),
                rotation_timer: TimerSlot::new(),
                recovery_timer: TimerSlot::new(),
                health_timer: TimerSlot::new(),
                monitor_timer: TimerSlot::new(),
                first_write_timer: TimerSlot::new(),
            }),
        })
    }

    pub fn position(&self) -> SlotPosition {
        self.inner.config.position
    }

    pub fn phase(&self) -> SoftwarePhase {
        self.inner.state.lock().phase
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    /// Build encoder, muxer and renderer on the pipeline thread and return
    /// the renderer's input surface. Waits for the pipeline thread to finish
    /// initialising, bounded by the init timeout.
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

    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || inner.stop_on_worker());
    }

    pub fn shutdown(&self) {
        self.stop();
        self.inner.worker.shutdown();
    }

    /// Samples written to disk over the whole run.
    pub fn samples_written(&self) -> u64 {
        self.inner.state.lock().samples_written
    }
}

fn post_to_worker<F>(weak: &Weak<SoftwareInner>, task: F)
where
    F: FnOnce(&Arc<SoftwareInner>) + Send + 'static,
{
    if let Some(inner) = weak.upgrade() {
        let target = Arc::clone(&inner);
        inner.worker.post(move || task(&target));
    }
}

impl SoftwareInner {
    fn position(&self) -> SlotPosition {
        self.config.position
    }

    fn emit(&self, event: PipelineEvent) {
        self.context.emit(event);
    }

    fn set_phase(&self, state: &mut SoftwareState, phase: SoftwarePhase) {
        if state.phase != phase {
            log::debug!(
                "[SW_PIPELINE] {} {:?} -> {:?}",
                self.position(),
                state.phase,
                phase
            );
        }
        state.phase = phase;
        self.recording
            .store(phase == SoftwarePhase::Recording, Ordering::SeqCst);
    }

    fn prepare_on_worker(self: &Arc<Self>) -> RecorderResult<Surface> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != SoftwarePhase::Idle {
            return Err(RecorderError::InvalidState(format!(
                "software pipeline {} already prepared",
                self.position()
            )));
        }

        self.install_stage(state, SegmentStart::Scheduled)?;

        let options = RendererOptions {
            watermark: self.config.watermark,
            mirror: self.config.mirror,
            cpu_copy: self.config.cpu_copy,
        };
        let mut renderer =
            FrameRenderer::new(create_render_context(self.config.prefer_gpu), options);
        let output = state
            .stage
            .as_ref()
            .map(|stage| stage.encoder.input_surface())
            .ok_or_else(|| RecorderError::InvalidState("encoder missing after install".into()))?;

        let input = match renderer.initialize(output, self.config.size) {
            Ok(input) => input,
            Err(e) => {
                log::error!(
                    "[SW_PIPELINE] {} renderer init failed: {}",
                    self.position(),
                    e
                );
                if let Some(stage) = state.stage.take() {
                    stage.release(self.position());
                }
                if let Some((segment, _)) = state.run.close_current() {
                    discard_file(&segment.path);
                }
                return Err(e);
            },
        };

        let weak = Arc::downgrade(self);
        input.set_frame_listener(move || {
            if let Some(inner) = weak.upgrade() {
                inner.frame_available();
            }
        });

        state.renderer = Some(renderer);
        self.set_phase(state, SoftwarePhase::Prepared);
        log::info!(
            "[SW_PIPELINE] {} prepared at {} ({} bps, {} fps, watermark={})",
            self.position(),
            self.config.size,
            self.config.bitrate,
            self.config.frame_rate,
            self.config.watermark
        );
        Ok(input)
    }

    /// Create an encoder and muxer for the next segment and bind the renderer
    /// (if any) to the new encoder. Nothing is left behind on failure.
    fn install_stage(&self, state: &mut SoftwareState, start: SegmentStart) -> RecorderResult<u32> {
        if let Some(current) = state.run.current() {
            return Err(RecorderError::InvalidState(format!(
                "segment {} still open",
                current.index
            )));
        }

        let plan = state.run.plan(start);
        let path = plan.path.clone();
        let stage = self.build_stage(&path)?;

        if let Some(renderer) = state.renderer.as_mut() {
            if let Err(e) = renderer.rebind_output(stage.encoder.input_surface()) {
                stage.release(self.position());
                discard_file(&path);
                return Err(e);
            }
        }

        let index = match state.run.begin_segment(plan) {
            Ok(segment) => segment.index,
            Err(e) => {
                stage.release(self.position());
                discard_file(&path);
                return Err(e);
            },
        };
        state.stage = Some(stage);
        state.pts.reset();
        state.segment_clock.restart();
        state.frames_without_output = 0;
        state.drain_failed = false;
        state.monitor.retarget(&path);

        log::info!(
            "[SW_PIPELINE] {} segment {} -> {}",
            self.position(),
            index,
            path.display()
        );
        self.emit(PipelineEvent::SegmentOpened {
            position: self.position(),
            index,
            path,
        });
        Ok(index)
    }

    fn build_stage(&self, path: &Path) -> RecorderResult<EncoderStage> {
        let format = EncoderFormat::avc(self.config.size, self.config.bitrate, self.config.frame_rate);
        let mut encoder = self.factory.create_encoder(&format)?;
        if let Err(e) = encoder.start() {
            encoder.release();
            return Err(e);
        }
        let muxer = match self.factory.create_muxer(path) {
            Ok(muxer) => muxer,
            Err(e) => {
                encoder.release();
                discard_file(path);
                return Err(e);
            },
        };
        Ok(EncoderStage {
            encoder,
            muxer,
            track: None,
        })
    }

    /// Drain to end of stream, release the stage and validate the file.
    fn finish_stage(&self, state: &mut SoftwareState) -> Option<SegmentOutcome> {
        if let Some(mut stage) = state.stage.take() {
            match stage.encoder.signal_end_of_input() {
                Ok(()) => {
                    let deadline = Instant::now() + self.context.timings.eos_timeout;
                    loop {
                        match drain_stage(&mut stage, &mut state.pts, &state.segment_clock, EOS_POLL)
                        {
                            Ok(stats) => {
                                state.samples_written += stats.samples;
                                if let Some(segment) = state.run.current_mut() {
                                    segment.frames += stats.samples;
                                }
                                if stats.end_of_stream {
                                    break;
                                }
                            },
                            Err(e) => {
                                log::warn!(
                                    "[SW_PIPELINE] {} drain at close failed: {}",
                                    self.position(),
                                    e
                                );
                                break;
                            },
                        }
                        if Instant::now() >= deadline {
                            log::warn!(
                                "[SW_PIPELINE] {} no end of stream within {:?}",
                                self.position(),
                                self.context.timings.eos_timeout
                            );
                            break;
                        }
                    }
                },
                Err(e) => log::warn!(
                    "[SW_PIPELINE] {} end of input failed: {}",
                    self.position(),
                    e
                ),
            }
            stage.release(self.position());
            if let Some(renderer) = state.renderer.as_mut() {
                // Keep the camera flowing until the next encoder is bound
                if let Err(e) = renderer.consume_only() {
                    log::warn!(
                        "[SW_PIPELINE] {} renderer unbind failed: {}",
                        self.position(),
                        e
                    );
                }
            }
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

    fn frame_available(self: &Arc<Self>) {
        if self.frame_task_queued.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        self.worker.post(move || inner.on_frame());
    }

    fn on_frame(self: &Arc<Self>) {
        self.frame_task_queued.store(false, Ordering::SeqCst);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(renderer) = state.renderer.as_mut() else {
            return;
        };

        if state.phase != SoftwarePhase::Recording || state.stage.is_none() {
            if let Err(e) = renderer.consume_only() {
                log::debug!("[SW_PIPELINE] {} consume failed: {}", self.position(), e);
            }
            return;
        }

        let timestamp_ns = state.segment_clock.elapsed_us() * 1000;
        match renderer.render_frame(timestamp_ns) {
            Ok(true) => state.frames_without_output += 1,
            Ok(false) => {},
            Err(e) => {
                self.enter_recovery(state, e);
                return;
            },
        }

        let Some(stage) = state.stage.as_mut() else {
            return;
        };
        match drain_stage(stage, &mut state.pts, &state.segment_clock, Duration::ZERO) {
            Ok(stats) if stats.samples > 0 => {
                state.frames_without_output = 0;
                state.samples_written += stats.samples;
                if let Some(segment) = state.run.current_mut() {
                    segment.frames += stats.samples;
                }
                if state.samples_written == stats.samples {
                    log::info!("[SW_PIPELINE] {} first samples written", self.position());
                    self.first_write_timer.cancel(&self.context.clock);
                }
            },
            Ok(_) => {},
            Err(e) => {
                if !state.drain_failed {
                    log::warn!("[SW_PIPELINE] {} drain failed: {}", self.position(), e);
                }
                state.drain_failed = true;
            },
        }
    }

    fn start_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != SoftwarePhase::Prepared {
            log::warn!(
                "[SW_PIPELINE] {} start ignored in {:?}",
                self.position(),
                state.phase
            );
            return;
        }
        state.segment_clock.restart();
        state.pts.reset();
        self.set_phase(state, SoftwarePhase::Recording);

        let timings = self.context.timings;
        self.arm_rotation();
        self.arm_health_check();
        self.arm_size_check(timings.first_size_check);
        let weak = Arc::downgrade(self);
        self.first_write_timer.arm(
            &self.context.clock,
            "sw-first-write",
            timings.first_write_timeout,
            move || post_to_worker(&weak, |inner| inner.first_write_deadline()),
        );

        log::info!(
            "[SW_PIPELINE] {} recording, segments every {:?}",
            self.position(),
            timings.segment_duration
        );
        self.emit(PipelineEvent::Started {
            position: self.position(),
        });
    }

    fn arm_rotation(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.rotation_timer.arm(
            &self.context.clock,
            "sw-rotation",
            self.context.timings.segment_duration,
            move || post_to_worker(&weak, |inner| inner.rotate_on_worker()),
        );
    }

    fn arm_health_check(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.health_timer.arm(
            &self.context.clock,
            "sw-health",
            self.context.timings.health_check_interval,
            move || post_to_worker(&weak, |inner| inner.health_check()),
        );
    }

    fn arm_size_check(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.monitor_timer.arm(
            &self.context.clock,
            "sw-size-check",
            delay,
            move || post_to_worker(&weak, |inner| inner.size_check()),
        );
    }

    fn rotate_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.phase {
            SoftwarePhase::Recording => {},
            SoftwarePhase::Recovering => {
                // Recovery owns the next segment; keep the cadence
                self.arm_rotation();
                state.run.tick();
                return;
            },
            _ => return,
        }
        self.arm_rotation();
        state.run.tick();

        let completed = self
            .finish_stage(state)
            .filter(SegmentOutcome::is_kept)
            .map(|outcome| outcome.path().to_path_buf());

        match self.install_stage(state, SegmentStart::Scheduled) {
            Ok(new_index) => {
                log::info!(
                    "[SW_PIPELINE] {} rotated to segment {}",
                    self.position(),
                    new_index
                );
                self.emit(PipelineEvent::SegmentSwitched {
                    position: self.position(),
                    completed,
                    new_index,
                });
            },
            Err(e) => {
                log::error!("[SW_PIPELINE] {} rotation failed: {}", self.position(), e);
                self.enter_recovery(state, e);
            },
        }
    }

    /// Close whatever is open and schedule a rebuild.
    fn enter_recovery(self: &Arc<Self>, state: &mut SoftwareState, error: RecorderError) {
        self.set_phase(state, SoftwarePhase::Recovering);
        self.finish_stage(state);

        let delay = state.recovery.next_delay();
        match delay {
            RecoveryDelay::Fast { attempt, delay } => log::warn!(
                "[SW_PIPELINE] {} recovery attempt {}/{} in {:?}: {}",
                self.position(),
                attempt,
                self.context.timings.max_recovery_attempts,
                delay,
                error
            ),
            RecoveryDelay::Normal { attempt, delay } => log::error!(
                "[SW_PIPELINE] {} still failing after {} attempts, retrying every {:?}: {}",
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
            "sw-recovery",
            delay.delay(),
            move || post_to_worker(&weak, |inner| inner.recover_on_worker()),
        );
    }

    fn recover_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != SoftwarePhase::Recovering {
            return;
        }
        match self.install_stage(state, SegmentStart::Recovered(Local::now().naive_local())) {
            Ok(index) => {
                let attempts = state.recovery.succeeded();
                self.set_phase(state, SoftwarePhase::Recording);
                log::info!(
                    "[SW_PIPELINE] {} recovered after {} attempt(s), segment {}",
                    self.position(),
                    attempts,
                    index
                );
                self.emit(PipelineEvent::Recovered {
                    position: self.position(),
                    attempts,
                });
            },
            Err(e) => self.enter_recovery(state, e),
        }
    }

    fn health_check(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.phase {
            SoftwarePhase::Recording => {},
            SoftwarePhase::Recovering => {
                self.arm_health_check();
                return;
            },
            _ => return,
        }
        self.arm_health_check();

        let threshold = self.context.timings.unhealthy_frame_threshold;
        if state.drain_failed || state.frames_without_output > threshold {
            let reason = if state.drain_failed {
                "encoder drain failed".to_string()
            } else {
                format!(
                    "{} frames rendered without encoder output",
                    state.frames_without_output
                )
            };
            self.enter_recovery(state, RecorderError::EncoderError(reason));
        }
    }

    fn size_check(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !matches!(
            state.phase,
            SoftwarePhase::Recording | SoftwarePhase::Recovering
        ) {
            return;
        }
        self.arm_size_check(self.context.timings.size_check_interval);
        if state.phase != SoftwarePhase::Recording {
            return;
        }

        let check = state.monitor.check();
        if check.grown_by == 0 {
            log::warn!(
                "[SW_PIPELINE] {} file not growing ({} bytes, {} checks)",
                self.position(),
                check.bytes,
                check.stalled_checks
            );
        } else {
            log::debug!(
                "[SW_PIPELINE] {} file {} bytes (+{})",
                self.position(),
                check.bytes,
                check.grown_by
            );
        }
    }

    fn first_write_deadline(self: &Arc<Self>) {
        let state = self.state.lock();
        if state.samples_written > 0 || state.phase == SoftwarePhase::Stopped {
            return;
        }
        log::error!(
            "[SW_PIPELINE] {} nothing written within {:?}",
            self.position(),
            self.context.timings.first_write_timeout
        );
        self.emit(PipelineEvent::Error {
            position: self.position(),
            message: format!(
                "no data written within {:?}",
                self.context.timings.first_write_timeout
            ),
            recovering: state.phase == SoftwarePhase::Recovering,
        });
    }

    fn stop_on_worker(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase == SoftwarePhase::Stopped {
            log::debug!("[SW_PIPELINE] {} already stopped", self.position());
            return;
        }

        let clock = &self.context.clock;
        self.rotation_timer.cancel(clock);
        self.recovery_timer.cancel(clock);
        self.health_timer.cancel(clock);
        self.monitor_timer.cancel(clock);
        self.first_write_timer.cancel(clock);

        let started = !matches!(state.phase, SoftwarePhase::Idle | SoftwarePhase::Prepared);
        self.set_phase(state, SoftwarePhase::Stopped);
        if started {
            self.finish_stage(state);
        } else {
            if let Some(stage) = state.stage.take() {
                stage.release(self.position());
            }
            if let Some(segment) = state.run.abandon_current() {
                self.emit(PipelineEvent::SegmentDiscarded {
                    position: self.position(),
                    path: segment.path,
                });
            }
        }
        if let Some(mut renderer) = state.renderer.take() {
            renderer.release();
        }

        let files = state.run.files().to_vec();
        let deleted = state.run.deleted().len();
        log::info!(
            "[SW_PIPELINE] {} stopped: {} file(s) kept, {} deleted, {} samples",
            self.position(),
            files.len(),
            deleted,
            state.samples_written
        );
        if state.pts.anomaly_count() > 0 {
            log::info!("{}", state.pts.summary());
        }
        self.emit(PipelineEvent::Stopped {
            position: self.position(),
            files,
            deleted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameSize, VideoFrame};
    use crate::pipeline::segment::STAMP_FORMAT;
    use crate::pipeline::{PipelineTimings, RunId};
    use crate::runtime::CoordinationClock;
    use crate::sim::{read_container, SimEncoderFactory};

    const SIZE: FrameSize = FrameSize::new(32, 24);
    const WAIT: Duration = Duration::from_secs(3);

    struct Harness {
        dir: tempfile::TempDir,
        clock: CoordinationClock,
        factory: SimEncoderFactory,
        events: flume::Receiver<PipelineEvent>,
        tx: flume::Sender<PipelineEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, events) = flume::unbounded();
            Self {
                dir: tempfile::tempdir().unwrap(),
                clock: CoordinationClock::start("test-clock").unwrap(),
                factory: SimEncoderFactory::new(),
                events,
                tx,
            }
        }

        fn pipeline(&self, timings: PipelineTimings) -> SoftwarePipeline {
            let config = PipelineConfig {
                position: SlotPosition::Front,
                run_id: RunId::now(),
                output_dir: self.dir.path().to_path_buf(),
                size: SIZE,
                bitrate: 1_000_000,
                frame_rate: 30,
                watermark: false,
                mirror: false,
                prefer_gpu: false,
                cpu_copy: false,
            };
            SoftwarePipeline::new(
                config,
                Arc::new(self.factory.clone()),
                PipelineContext {
                    clock: self.clock.clone(),
                    timings,
                    events: self.tx.clone(),
                },
            )
            .unwrap()
        }

        fn wait_for<F: FnMut(&PipelineEvent) -> bool>(&self, mut pred: F) -> PipelineEvent {
            let deadline = Instant::now() + WAIT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let event = self
                    .events
                    .recv_timeout(remaining)
                    .expect("expected pipeline event did not arrive");
                if pred(&event) {
                    return event;
                }
            }
        }
    }

    fn timings(segment: Duration) -> PipelineTimings {
        PipelineTimings {
            recovery_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(200),
            first_size_check: Duration::from_millis(50),
            size_check_interval: Duration::from_millis(100),
            ..PipelineTimings::default().with_segment_duration(segment)
        }
    }

    /// Feed frames into `input` every 10ms until `stop` is set.
    fn feed(input: Surface, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut n = 0i64;
            while !stop.load(Ordering::SeqCst) {
                input.queue_frame(VideoFrame::solid(SIZE, [200, 10, 10, 255], n));
                n += 1;
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    }

    fn stopped_files(event: PipelineEvent) -> Vec<std::path::PathBuf> {
        match event {
            PipelineEvent::Stopped { files, .. } => files,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_records_and_stops() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_secs(30)));
        let input = pipeline.prepare().unwrap();
        assert_eq!(pipeline.phase(), SoftwarePhase::Prepared);

        let stop = Arc::new(AtomicBool::new(false));
        let feeder = feed(input, Arc::clone(&stop));
        pipeline.start();
        h.wait_for(|e| matches!(e, PipelineEvent::Started { .. }));
        std::thread::sleep(Duration::from_millis(200));
        pipeline.stop();

        let files = stopped_files(h.wait_for(|e| matches!(e, PipelineEvent::Stopped { .. })));
        stop.store(true, Ordering::SeqCst);
        feeder.join().unwrap();

        assert_eq!(files.len(), 1);
        let container = read_container(&files[0]).unwrap();
        assert_eq!(container.size, SIZE);
        assert!(!container.samples.is_empty());
        let timestamps = container.timestamps();
        assert!(timestamps.windows(2).all(|w| w[1] > w[0]));
        assert!(pipeline.samples_written() > 0);
        pipeline.shutdown();
    }

    #[test]
    fn test_consumes_frames_before_start() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_secs(30)));
        let input = pipeline.prepare().unwrap();

        input.queue_frame(VideoFrame::solid(SIZE, [0, 0, 0, 255], 0));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!input.has_pending());
        assert_eq!(pipeline.samples_written(), 0);
        pipeline.shutdown();
    }

    #[test]
    fn test_rotation_keeps_input_surface() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_millis(250)));
        let input = pipeline.prepare().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let feeder = feed(input.clone(), Arc::clone(&stop));
        pipeline.start();

        let switched = h.wait_for(|e| matches!(e, PipelineEvent::SegmentSwitched { .. }));
        match switched {
            PipelineEvent::SegmentSwitched {
                completed,
                new_index,
                ..
            } => {
                assert_eq!(new_index, 1);
                assert!(completed.is_some());
            },
            _ => unreachable!(),
        }
        std::thread::sleep(Duration::from_millis(100));
        assert!(!input.is_released());
        pipeline.stop();
        let files = stopped_files(h.wait_for(|e| matches!(e, PipelineEvent::Stopped { .. })));
        stop.store(true, Ordering::SeqCst);
        feeder.join().unwrap();

        assert_eq!(files.len(), 2);
        assert_ne!(files[0], files[1]);
        assert_eq!(h.factory.encoders_created(), 2);
        pipeline.shutdown();
    }

    #[test]
    fn test_rotation_failure_recovers() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_millis(300)));
        let input = pipeline.prepare().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let feeder = feed(input, Arc::clone(&stop));
        pipeline.start();
        h.wait_for(|e| matches!(e, PipelineEvent::Started { .. }));

        h.factory.fail_next_encoder_creations(1);
        h.wait_for(|e| matches!(e, PipelineEvent::Error { recovering: true, .. }));
        let recovered = h.wait_for(|e| matches!(e, PipelineEvent::Recovered { .. }));
        assert!(matches!(recovered, PipelineEvent::Recovered { attempts: 1, .. }));

        // The normal cadence continues after recovery
        h.wait_for(|e| matches!(e, PipelineEvent::SegmentSwitched { new_index: 2, .. }));
        std::thread::sleep(Duration::from_millis(100));
        pipeline.stop();
        let files = stopped_files(h.wait_for(|e| matches!(e, PipelineEvent::Stopped { .. })));
        stop.store(true, Ordering::SeqCst);
        feeder.join().unwrap();
        assert_eq!(files.len(), 3);
        pipeline.shutdown();
    }

    #[test]
    fn test_undersized_segment_reported_once() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_secs(30)));
        pipeline.prepare().unwrap();
        pipeline.start();
        // No frames: the segment stays empty
        pipeline.stop();
        pipeline.stop();

        let deleted = h.wait_for(|e| matches!(e, PipelineEvent::CorruptedFilesDeleted { .. }));
        let PipelineEvent::CorruptedFilesDeleted { files, .. } = deleted else {
            unreachable!()
        };
        assert_eq!(files.len(), 1);
        let stopped = h.wait_for(|e| matches!(e, PipelineEvent::Stopped { .. }));
        assert!(matches!(stopped, PipelineEvent::Stopped { deleted: 1, .. }));
        pipeline.shutdown();
        let late = h.events.try_iter().filter(|e| {
            matches!(
                e,
                PipelineEvent::CorruptedFilesDeleted { .. } | PipelineEvent::Stopped { .. }
            )
        });
        assert_eq!(late.count(), 0);
    }

    #[test]
    fn test_stop_before_start_discards_placeholder() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_secs(30)));
        pipeline.prepare().unwrap();
        pipeline.stop();

        let mut seen = Vec::new();
        let stopped = h.wait_for(|e| {
            seen.push(format!("{:?}", e));
            matches!(e, PipelineEvent::Stopped { .. })
        });
        assert!(matches!(stopped, PipelineEvent::Stopped { deleted: 0, .. }));
        assert!(stopped_files(stopped).is_empty());
        pipeline.shutdown();

        seen.extend(h.events.try_iter().map(|e| format!("{:?}", e)));
        let reported = seen
            .iter()
            .any(|e| e.starts_with("CorruptedFilesDeleted") || e.starts_with("SegmentClosed"));
        assert!(!reported, "unexpected reports: {:?}", seen);
        let leftovers = std::fs::read_dir(h.dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_stalled_encoder_triggers_rebuild() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_secs(30)));
        let input = pipeline.prepare().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let feeder = feed(input, Arc::clone(&stop));
        pipeline.start();
        h.wait_for(|e| matches!(e, PipelineEvent::Started { .. }));

        h.factory.set_stall_output(true);
        h.wait_for(|e| matches!(e, PipelineEvent::Error { recovering: true, .. }));
        h.factory.set_stall_output(false);
        h.wait_for(|e| matches!(e, PipelineEvent::Recovered { .. }));

        pipeline.stop();
        h.wait_for(|e| matches!(e, PipelineEvent::Stopped { .. }));
        stop.store(true, Ordering::SeqCst);
        feeder.join().unwrap();
        pipeline.shutdown();
    }

    #[test]
    fn test_recovered_segment_named_at_open_time() {
        let h = Harness::new();
        let pipeline = h.pipeline(timings(Duration::from_secs(4)));
        let input = pipeline.prepare().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let feeder = feed(input, Arc::clone(&stop));
        pipeline.start();
        h.wait_for(|e| matches!(e, PipelineEvent::Started { .. }));

        // Rebuild well inside the first 4 s interval
        h.factory.set_stall_output(true);
        h.wait_for(|e| matches!(e, PipelineEvent::Error { recovering: true, .. }));
        h.factory.set_stall_output(false);
        let opened = h.wait_for(|e| matches!(e, PipelineEvent::SegmentOpened { index: 1, .. }));
        let opened_at = Local::now().naive_local();
        let PipelineEvent::SegmentOpened { path, .. } = opened else {
            unreachable!()
        };

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let named = chrono::NaiveDateTime::parse_from_str(&name[..15], STAMP_FORMAT).unwrap();
        let skew_ms = (named - opened_at).num_milliseconds();
        assert!(
            skew_ms.abs() <= 1500,
            "{} is {} ms away from its open time",
            name,
            skew_ms
        );

        pipeline.stop();
        h.wait_for(|e| matches!(e, PipelineEvent::Stopped { .. }));
        stop.store(true, Ordering::SeqCst);
        feeder.join().unwrap();
        pipeline.shutdown();
    }

    #[test]
    fn test_prepare_failure_leaves_no_file() {
        let h = Harness::new();
        h.factory.fail_next_muxer_creations(1);
        let pipeline = h.pipeline(timings(Duration::from_secs(30)));
        assert!(pipeline.prepare().is_err());
        assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);
        assert_eq!(pipeline.phase(), SoftwarePhase::Idle);
        pipeline.shutdown();
    }
}
