//! Multi-camera coordination.
//!
//! [`MultiCameraCoordinator`] owns one [`CameraSession`] per slot and, while
//! recording, one [`RecordingPipeline`] per opened primary camera. All of its
//! own bookkeeping runs on a single control worker: session notices and
//! pipeline events are forwarded there by two small dispatcher threads, and
//! the public control methods only post work, so no caller ever blocks on a
//! device or an encoder.
//!
//! Recording start goes through a [`StartBarrier`]: every prepared camera is
//! reconfigured with its record target and the pipelines start together once
//! all of them report back, or once the barrier times out.

pub mod barrier;
pub mod events;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::camera::{
    CameraErrorCode, CameraProvider, CameraSession, SessionNotice, SessionTimings, SlotPosition,
};
use crate::config::RecorderConfig;
use crate::error::{RecorderError, RecorderResult};
use crate::manifest::{recover_interrupted, ManifestWriter};
use crate::media::Surface;
use crate::pipeline::{
    snapshot_file_name, PipelineBackends, PipelineConfig, PipelineContext, PipelineEvent,
    PipelineKind, PipelineTimings, RecordingPipeline, RunId,
};
use crate::runtime::{CoordinationClock, TimerSlot, Worker};

pub use barrier::{BarrierProgress, BarrierTimings, StartBarrier, BARRIER_TIMEOUT_MS};
pub use events::RecorderEvent;

/// How often dispatcher threads look for a shutdown request.
const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// Every timing knob of a coordinator and the components it creates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorTimings {
    pub session: SessionTimings,
    pub pipeline: PipelineTimings,
    pub barrier: BarrierTimings,
    /// Delay between consecutive cameras of a snapshot burst.
    pub snapshot_stagger: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for CoordinatorTimings {
    fn default() -> Self {
        Self {
            session: SessionTimings::default(),
            pipeline: PipelineTimings::default(),
            barrier: BarrierTimings::default(),
            snapshot_stagger: Duration::from_millis(300),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl CoordinatorTimings {
    /// Defaults with the configured segment duration.
    pub fn for_config(config: &RecorderConfig) -> Self {
        let mut timings = Self::default();
        timings.pipeline.segment_duration = config.segment_duration();
        timings
    }
}

struct CameraEntry {
    session: CameraSession,
    preview: Surface,
    /// Primary slot whose capture session also feeds this slot's preview.
    host: Option<SlotPosition>,
    /// Within the open-device limit.
    enabled: bool,
}

struct PipelineSlot {
    pipeline: RecordingPipeline,
    started: bool,
    stopped: bool,
}

struct ActiveRun {
    run_id: RunId,
    kind: PipelineKind,
    pipelines: BTreeMap<SlotPosition, PipelineSlot>,
    barrier: Option<StartBarrier>,
    manifest: Option<ManifestWriter>,
    stopping: bool,
    files: Vec<PathBuf>,
}

impl ActiveRun {
    fn new(run_id: RunId, kind: PipelineKind) -> Self {
        Self {
            run_id,
            kind,
            pipelines: BTreeMap::new(),
            barrier: None,
            manifest: None,
            stopping: false,
            files: Vec::new(),
        }
    }

    fn all_stopped(&self) -> bool {
        self.pipelines.values().all(|slot| slot.stopped)
    }
}

struct CoordinatorInner {
    config: RecorderConfig,
    backends: PipelineBackends,
    timings: CoordinatorTimings,
    clock: CoordinationClock,
    worker: Worker,
    cameras: Vec<CameraEntry>,
    pipeline_events: flume::Sender<PipelineEvent>,
    run: Mutex<Option<ActiveRun>>,
    barrier_timer: TimerSlot,
    subscribers: Mutex<Vec<flume::Sender<RecorderEvent>>>,
    shutting_down: AtomicBool,
}

/// Owner of every camera session and of the active recording run.
pub struct MultiCameraCoordinator {
    inner: Arc<CoordinatorInner>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    dispatch_stop: Arc<AtomicBool>,
}

impl MultiCameraCoordinator {
    /// Build sessions for every configured slot. No device is opened yet.
    ///
    /// Interrupted runs left in the output directory are finalised first.
    pub fn new(
        config: RecorderConfig,
        provider: Arc<dyn CameraProvider>,
        backends: PipelineBackends,
        timings: CoordinatorTimings,
    ) -> RecorderResult<Self> {
        match recover_interrupted(&config.output_dir) {
            Ok(runs) if !runs.is_empty() => {
                log::info!("[COORDINATOR] Finalised {} interrupted run(s)", runs.len())
            },
            Ok(_) => {},
            Err(e) => log::warn!("[COORDINATOR] Interrupted run recovery failed: {}", e),
        }

        let clock = CoordinationClock::start("coordination-clock")?;
        let worker = Worker::spawn("coordinator")?;
        let (session_tx, session_rx) = flume::unbounded();
        let (pipeline_tx, pipeline_rx) = flume::unbounded();

        let slots = config.camera_slots();
        let mut sessions = Vec::with_capacity(slots.len());
        for slot in slots {
            sessions.push(CameraSession::new(
                slot,
                Arc::clone(&provider),
                clock.clone(),
                timings.session,
                config.target_size(),
                session_tx.clone(),
            )?);
        }
        let cameras = build_camera_entries(sessions, config.max_open_cameras);

        let inner = Arc::new(CoordinatorInner {
            config,
            backends,
            timings,
            clock,
            worker,
            cameras,
            pipeline_events: pipeline_tx,
            run: Mutex::new(None),
            barrier_timer: TimerSlot::new(),
            subscribers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });

        let dispatch_stop = Arc::new(AtomicBool::new(false));
        let dispatchers = vec![
            spawn_dispatcher(
                "coordinator-sessions",
                session_rx,
                Arc::downgrade(&inner),
                Arc::clone(&dispatch_stop),
                CoordinatorInner::on_session_notice,
            )?,
            spawn_dispatcher(
                "coordinator-pipelines",
                pipeline_rx,
                Arc::downgrade(&inner),
                Arc::clone(&dispatch_stop),
                CoordinatorInner::on_pipeline_event,
            )?,
        ];

        log::info!(
            "[COORDINATOR] {} slot(s), {} backend",
            inner.cameras.len(),
            if inner.config.use_software_pipeline() {
                "software"
            } else {
                "hardware"
            }
        );

        Ok(Self {
            inner,
            dispatchers: Mutex::new(dispatchers),
            dispatch_stop,
        })
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> flume::Receiver<RecorderEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn pipeline_kind(&self) -> PipelineKind {
        self.inner.pipeline_kind()
    }

    pub fn slots(&self) -> Vec<SlotPosition> {
        self.inner
            .cameras
            .iter()
            .map(|entry| entry.session.position())
            .collect()
    }

    pub fn session(&self, slot: SlotPosition) -> Option<CameraSession> {
        self.inner.entry(slot).map(|entry| entry.session.clone())
    }

    /// The surface a host reads this slot's preview frames from.
    pub fn preview_surface(&self, slot: SlotPosition) -> Option<Surface> {
        self.inner.entry(slot).map(|entry| entry.preview.clone())
    }

    /// The primary slot whose device feeds `slot`, for secondary slots.
    pub fn mirror_source(&self, slot: SlotPosition) -> Option<SlotPosition> {
        self.inner.entry(slot).and_then(|entry| entry.host)
    }

    /// Open every primary camera within the open-device limit.
    pub fn open_all(&self) {
        let mut opened = 0;
        for entry in self.inner.device_owners() {
            entry.session.open();
            opened += 1;
        }
        log::info!("[COORDINATOR] Opening {} camera(s)", opened);
    }

    /// Stop any recording, then close every camera.
    pub fn close_all(&self) {
        self.inner.post(|inner| {
            inner.stop_on_worker();
            for entry in &inner.cameras {
                entry.session.close();
            }
        });
    }

    pub fn pause_all(&self) {
        for entry in self.inner.device_owners() {
            entry.session.pause();
        }
    }

    pub fn resume_all(&self) {
        for entry in self.inner.device_owners() {
            entry.session.resume();
        }
    }

    pub fn force_reopen_all(&self) {
        for entry in self.inner.device_owners() {
            entry.session.force_reopen();
        }
    }

    /// Force-reopen every camera that is not connected. Returns how many.
    pub fn check_and_repair(&self) -> usize {
        let mut repaired = 0;
        for entry in self.inner.device_owners() {
            if !entry.session.is_connected() {
                log::info!(
                    "[COORDINATOR] {} is {:?}, forcing reopen",
                    entry.session.position(),
                    entry.session.state()
                );
                entry.session.force_reopen();
                repaired += 1;
            }
        }
        repaired
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .device_owners()
            .filter(|entry| entry.session.is_connected())
            .count()
    }

    pub fn has_connected_cameras(&self) -> bool {
        self.connected_count() > 0
    }

    /// True from an accepted [`start_recording`](Self::start_recording) until
    /// a stop is requested.
    pub fn is_recording(&self) -> bool {
        self.inner
            .run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.stopping)
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.inner.run.lock().as_ref().map(|run| run.run_id)
    }

    /// Request a recording run. Returns false if a run is already active or
    /// no camera is connected. Progress is reported through events.
    pub fn start_recording(&self, run_id: RunId) -> bool {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut run = self.inner.run.lock();
            if let Some(active) = run.as_ref() {
                log::warn!(
                    "[COORDINATOR] Run {} still active, ignoring start",
                    active.run_id
                );
                return false;
            }
            if !self.has_connected_cameras() {
                log::warn!("[COORDINATOR] No connected camera, cannot record");
                return false;
            }
            *run = Some(ActiveRun::new(run_id, self.inner.pipeline_kind()));
        }
        log::info!("[COORDINATOR] Starting run {}", run_id);
        self.inner.post(|inner| inner.start_on_worker());
        true
    }

    /// Stop the active run. Safe to call at any time, any number of times.
    pub fn stop_recording(&self) {
        self.inner.post(|inner| inner.stop_on_worker());
    }

    /// Capture one still per connected camera, all sharing `run_id`'s stamp.
    /// Camera `i` fires `i` staggers after the first. Returns the planned paths;
    /// results arrive as [`RecorderEvent::SnapshotTaken`].
    pub fn take_snapshot(&self, run_id: RunId) -> RecorderResult<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.inner.config.output_dir)?;
        let stamp = run_id.stamp();
        let mut planned = Vec::new();
        for entry in self.inner.device_owners() {
            if !entry.session.is_connected() {
                continue;
            }
            let position = entry.session.position();
            let path = self
                .inner
                .config
                .output_dir
                .join(snapshot_file_name(&stamp, position));
            let delay = self.inner.timings.snapshot_stagger * planned.len() as u32;
            let session = entry.session.clone();
            let target = path.clone();
            self.inner.clock.schedule("snapshot", delay, move || {
                session.capture_still(target);
            });
            planned.push(path);
        }
        log::info!(
            "[COORDINATOR] Snapshot burst {} for {} camera(s)",
            stamp,
            planned.len()
        );
        Ok(planned)
    }

    /// Stop recording, close every camera and join all threads. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[COORDINATOR] Shutting down");
        let inner = Arc::clone(&self.inner);
        if let Err(e) = self
            .inner
            .worker
            .call(self.inner.timings.shutdown_timeout, move || {
                inner.shutdown_on_worker()
            })
        {
            log::warn!("[COORDINATOR] Shutdown did not finish in time: {}", e);
        }
        self.inner.worker.shutdown();

        self.dispatch_stop.store(true, Ordering::SeqCst);
        for dispatcher in self.dispatchers.lock().drain(..) {
            if dispatcher.join().is_err() {
                log::warn!("[COORDINATOR] Dispatcher thread panicked");
            }
        }
        self.inner.clock.shutdown();
    }
}

impl Drop for MultiCameraCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pair each slot with its preview surface and route secondary previews
/// through the primary that owns the device.
fn build_camera_entries(sessions: Vec<CameraSession>, max_open: usize) -> Vec<CameraEntry> {
    let mut owners: Vec<(String, SlotPosition, bool)> = Vec::new();
    let mut entries = Vec::with_capacity(sessions.len());

    for session in sessions {
        let slot = session.slot().clone();
        let preview = Surface::new(format!("preview-{}", slot.position));

        if slot.primary {
            let enabled = owners.len() < max_open;
            if !enabled {
                log::info!(
                    "[COORDINATOR] {} exceeds the open-device limit of {}, not opening",
                    slot.position,
                    max_open
                );
            }
            owners.push((slot.device_id.clone(), slot.position, enabled));
            session.add_preview_output(preview.clone());
            entries.push(CameraEntry {
                session,
                preview,
                host: None,
                enabled,
            });
            continue;
        }

        let owner = owners
            .iter()
            .find(|(device_id, _, _)| *device_id == slot.device_id)
            .map(|(_, position, enabled)| (*position, *enabled));
        let (host, enabled) = match owner {
            Some((host, enabled)) => (Some(host), enabled),
            None => (None, false),
        };
        let host_entry = host.and_then(|h| {
            entries
                .iter()
                .find(|e: &&CameraEntry| e.session.position() == h)
        });
        if let Some(host_entry) = host_entry {
            host_entry.session.add_preview_output(preview.clone());
            log::info!(
                "[COORDINATOR] {} mirrors {} (device {})",
                slot.position,
                host_entry.session.position(),
                slot.device_id
            );
        }
        entries.push(CameraEntry {
            session,
            preview,
            host,
            enabled,
        });
    }
    entries
}

fn spawn_dispatcher<T>(
    name: &str,
    rx: flume::Receiver<T>,
    inner: Weak<CoordinatorInner>,
    stop: Arc<AtomicBool>,
    handle: fn(&Arc<CoordinatorInner>, T),
) -> RecorderResult<JoinHandle<()>>
where
    T: Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            loop {
                match rx.recv_timeout(DISPATCH_POLL) {
                    Ok(message) => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        let target = Arc::clone(&inner);
                        inner.worker.post(move || handle(&target, message));
                    },
                    Err(flume::RecvTimeoutError::Timeout) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                    },
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                }
            }
            log::debug!("[COORDINATOR] '{}' exiting", thread_name);
        })
        .map_err(|e| RecorderError::Other(format!("Failed to spawn {}: {}", name, e)))
}

impl CoordinatorInner {
    fn post<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(&Arc<CoordinatorInner>) + Send + 'static,
    {
        let target = Arc::clone(self);
        self.worker.post(move || task(&target));
    }

    fn emit(&self, event: RecorderEvent) {
        log::debug!("[COORDINATOR] event {:?}", event);
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn pipeline_kind(&self) -> PipelineKind {
        if self.config.use_software_pipeline() {
            PipelineKind::Software
        } else {
            PipelineKind::Hardware
        }
    }

    fn entry(&self, slot: SlotPosition) -> Option<&CameraEntry> {
        self.cameras
            .iter()
            .find(|entry| entry.session.position() == slot)
    }

    fn session(&self, slot: SlotPosition) -> Option<&CameraSession> {
        self.entry(slot).map(|entry| &entry.session)
    }

    /// Primaries within the open-device limit.
    fn device_owners(&self) -> impl Iterator<Item = &CameraEntry> {
        self.cameras
            .iter()
            .filter(|entry| entry.enabled && entry.session.is_primary())
    }

    fn strip_record_target(&self, slot: SlotPosition) {
        if let Some(session) = self.session(slot) {
            session.set_record_target(None);
            if session.is_connected() {
                session.reconfigure();
            }
        }
    }

    fn pipeline_config(&self, session: &CameraSession, run_id: RunId) -> PipelineConfig {
        let size = session
            .preview_size()
            .unwrap_or_else(|| self.config.target_size());
        PipelineConfig {
            position: session.position(),
            run_id,
            output_dir: self.config.output_dir.clone(),
            size,
            bitrate: self.config.bitrate_for(size),
            frame_rate: self.config.fps(),
            watermark: self.config.watermark_enabled,
            mirror: session.slot().mirror,
            prefer_gpu: cfg!(feature = "gpu"),
            cpu_copy: false,
        }
    }

    fn prepare_pipeline(
        &self,
        kind: PipelineKind,
        config: PipelineConfig,
    ) -> RecorderResult<(RecordingPipeline, Surface)> {
        let context = PipelineContext {
            clock: self.clock.clone(),
            timings: self.timings.pipeline,
            events: self.pipeline_events.clone(),
        };
        let pipeline = RecordingPipeline::new(kind, config, &self.backends, context)?;
        match pipeline.prepare() {
            Ok(surface) => Ok((pipeline, surface)),
            Err(e) => {
                pipeline.shutdown();
                Err(e)
            },
        }
    }

    fn start_on_worker(self: &Arc<Self>) {
        let (run_id, kind) = match self.run.lock().as_ref() {
            Some(run) if !run.stopping && run.pipelines.is_empty() => (run.run_id, run.kind),
            _ => return,
        };

        let manifest = match ManifestWriter::create(&self.config.output_dir, run_id) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                log::warn!("[COORDINATOR] Run {} has no manifest: {}", run_id, e);
                None
            },
        };

        let mut prepared = BTreeMap::new();
        for entry in self.device_owners() {
            let position = entry.session.position();
            if !entry.session.is_connected() {
                log::info!(
                    "[COORDINATOR] {} not connected ({:?}), not recording it",
                    position,
                    entry.session.state()
                );
                continue;
            }
            let config = self.pipeline_config(&entry.session, run_id);
            match self.prepare_pipeline(kind, config) {
                Ok((pipeline, surface)) => {
                    entry.session.set_record_target(Some(surface));
                    prepared.insert(
                        position,
                        PipelineSlot {
                            pipeline,
                            started: false,
                            stopped: false,
                        },
                    );
                },
                Err(e) => {
                    log::error!("[COORDINATOR] {} pipeline prepare failed: {}", position, e);
                    self.emit(RecorderEvent::PipelineError {
                        slot: position,
                        message: e.to_string(),
                        recovering: false,
                    });
                },
            }
        }

        let slots: Vec<SlotPosition> = prepared.keys().copied().collect();
        let mut guard = self.run.lock();
        if prepared.is_empty() || guard.is_none() {
            *guard = None;
            drop(guard);
            if let Some(mut manifest) = manifest {
                manifest.finalize();
            }
            for (position, slot) in prepared {
                slot.pipeline.shutdown();
                self.strip_record_target(position);
            }
            log::error!("[COORDINATOR] Run {} has no camera to record", run_id);
            self.emit(RecorderEvent::RecordingError {
                message: "no camera could be prepared for recording".to_string(),
            });
            return;
        }
        if let Some(run) = guard.as_mut() {
            run.manifest = manifest;
            run.pipelines = prepared;
            run.barrier = Some(StartBarrier::new(slots.iter().copied()));
        }
        drop(guard);

        log::info!(
            "[COORDINATOR] Run {}: {} pipeline(s) prepared, waiting for {:?}",
            run_id,
            slots.len(),
            slots
        );
        let weak = Arc::downgrade(self);
        self.barrier_timer.arm(
            &self.clock,
            "start-barrier-timeout",
            self.timings.barrier.timeout,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.post(|inner| inner.barrier_timed_out());
                }
            },
        );
        for position in slots {
            if let Some(session) = self.session(position) {
                session.reconfigure();
            }
        }
    }

    fn barrier_timed_out(self: &Arc<Self>) {
        let ready = {
            let mut guard = self.run.lock();
            let Some(run) = guard.as_mut() else {
                return;
            };
            if run.stopping {
                return;
            }
            let Some(mut barrier) = run.barrier.take() else {
                return;
            };
            log::warn!(
                "[COORDINATOR] Start barrier timed out with {}/{} camera(s) configured",
                barrier.configured(),
                barrier.expected()
            );
            barrier.force().unwrap_or_default()
        };
        self.run_start_action(ready);
    }

    /// Start the pipelines of every slot that made it through the barrier.
    fn run_start_action(self: &Arc<Self>, mut ready: Vec<SlotPosition>) {
        ready.sort();
        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            return;
        };
        if run.stopping {
            return;
        }

        let mut started = Vec::new();
        for position in ready {
            if let Some(slot) = run.pipelines.get_mut(&position) {
                if !slot.started {
                    slot.pipeline.start();
                    slot.started = true;
                    started.push(position);
                }
            }
        }

        if started.is_empty() {
            let run = guard.take();
            drop(guard);
            log::error!("[COORDINATOR] No camera configured for recording, releasing run");
            if let Some(run) = run {
                self.release_run(run);
            }
            self.emit(RecorderEvent::RecordingError {
                message: "no camera configured for recording".to_string(),
            });
            return;
        }

        let run_id = run.run_id;
        let waiting = run.pipelines.len() - started.len();
        drop(guard);
        log::info!(
            "[COORDINATOR] Run {} recording on {:?} ({} still joining)",
            run_id,
            started,
            waiting
        );
        self.emit(RecorderEvent::RecordingStarted {
            run_id: run_id.stamp(),
            slots: started,
        });
    }

    /// Tear down a run that never started.
    fn release_run(&self, mut run: ActiveRun) {
        run.stopping = true;
        for (position, slot) in std::mem::take(&mut run.pipelines) {
            slot.pipeline.shutdown();
            self.strip_record_target(position);
        }
        if let Some(manifest) = run.manifest.as_mut() {
            manifest.finalize();
        }
    }

    fn on_session_notice(self: &Arc<Self>, notice: SessionNotice) {
        match notice {
            SessionNotice::Opened { position } => {
                self.emit(RecorderEvent::CameraOpened { slot: position });
            },
            SessionNotice::PreviewSizeChosen { position, size } => {
                self.emit(RecorderEvent::preview_size(position, size));
            },
            SessionNotice::Configured {
                position,
                with_record,
            } => {
                self.emit(RecorderEvent::CameraConfigured {
                    slot: position,
                    recording: with_record,
                });
                if with_record {
                    self.on_record_configured(position);
                }
            },
            SessionNotice::ConfigureFailed {
                position,
                had_record,
            } => {
                if had_record {
                    self.emit(RecorderEvent::CameraError {
                        slot: position,
                        code: CameraErrorCode::SessionConfigureFailed.code(),
                        message: "record session configuration failed".to_string(),
                        reconnecting: false,
                    });
                    self.exclude_from_barrier(position);
                }
            },
            SessionNotice::Error {
                position,
                code,
                reconnecting,
            } => {
                self.emit(RecorderEvent::CameraError {
                    slot: position,
                    code: code.code(),
                    message: code.description().to_string(),
                    reconnecting,
                });
                self.exclude_from_barrier(position);
            },
            SessionNotice::Closed { position } => {
                self.emit(RecorderEvent::CameraClosed { slot: position });
            },
            SessionNotice::StillCaptured {
                position,
                path,
                error,
            } => {
                self.emit(RecorderEvent::SnapshotTaken {
                    slot: position,
                    path,
                    error,
                });
            },
        }
    }

    fn on_record_configured(self: &Arc<Self>, position: SlotPosition) {
        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            return;
        };
        if run.stopping {
            return;
        }

        let progress = run
            .barrier
            .as_mut()
            .map(|barrier| barrier.mark_configured(position));
        match progress {
            Some(BarrierProgress::Complete(ready)) => {
                run.barrier = None;
                drop(guard);
                self.barrier_timer.cancel(&self.clock);
                log::info!("[COORDINATOR] Start barrier complete: {:?}", ready);
                self.post(move |inner| inner.run_start_action(ready));
            },
            Some(BarrierProgress::Waiting) => {
                log::debug!("[COORDINATOR] {} configured, barrier waiting", position);
            },
            Some(BarrierProgress::Ignored) | None => {
                let barrier_open = run.barrier.is_some();
                let Some(slot) = run.pipelines.get_mut(&position) else {
                    return;
                };
                if slot.started {
                    slot.pipeline.on_session_configured();
                } else if !barrier_open {
                    log::info!("[COORDINATOR] {} joined the run late", position);
                    slot.pipeline.start();
                    slot.started = true;
                    drop(guard);
                    self.emit(RecorderEvent::RecordingJoined { slot: position });
                }
            },
        }
    }

    /// Drop `position` from an open start barrier.
    fn exclude_from_barrier(self: &Arc<Self>, position: SlotPosition) {
        let (excluded, resolved) = {
            let mut guard = self.run.lock();
            let Some(run) = guard.as_mut() else {
                return;
            };
            if run.stopping {
                return;
            }
            let Some(barrier) = run.barrier.as_mut() else {
                return;
            };
            let resolved = match barrier.mark_failed(position) {
                BarrierProgress::Ignored => return,
                BarrierProgress::Waiting => None,
                BarrierProgress::Complete(ready) => Some(ready),
            };
            if resolved.is_some() {
                run.barrier = None;
            }
            (run.pipelines.remove(&position), resolved)
        };

        log::warn!("[COORDINATOR] {} excluded from this run", position);
        if let Some(session) = self.session(position) {
            session.set_record_target(None);
        }
        if let Some(slot) = excluded {
            slot.pipeline.shutdown();
        }
        if let Some(ready) = resolved {
            self.barrier_timer.cancel(&self.clock);
            self.post(move |inner| inner.run_start_action(ready));
        }
    }

    fn on_pipeline_event(self: &Arc<Self>, event: PipelineEvent) {
        match event {
            PipelineEvent::Started { position } => {
                log::debug!("[COORDINATOR] {} pipeline started", position);
            },
            PipelineEvent::SegmentOpened {
                position,
                index,
                path,
            } => {
                if let Some(manifest) = self.run.lock().as_mut().and_then(|r| r.manifest.as_mut())
                {
                    manifest.segment_started(position, index, path);
                }
            },
            PipelineEvent::SegmentClosed {
                path, bytes, kept, ..
            } => {
                if let Some(manifest) = self.run.lock().as_mut().and_then(|r| r.manifest.as_mut())
                {
                    manifest.segment_closed(&path, bytes, kept);
                }
            },
            PipelineEvent::SegmentDiscarded { path, .. } => {
                if let Some(manifest) = self.run.lock().as_mut().and_then(|r| r.manifest.as_mut())
                {
                    manifest.segment_discarded(&path);
                }
            },
            PipelineEvent::SegmentSwitched {
                position,
                completed,
                new_index,
            } => {
                self.emit(RecorderEvent::SegmentSwitched {
                    slot: position,
                    completed_file: completed,
                    new_index,
                });
            },
            PipelineEvent::SurfaceReplaced { position, surface } => {
                let active = self.run.lock().as_ref().is_some_and(|run| {
                    !run.stopping && run.pipelines.contains_key(&position)
                });
                if !active {
                    return;
                }
                if let Some(session) = self.session(position) {
                    log::debug!("[COORDINATOR] {} swapping record surface", position);
                    session.set_record_target(Some(surface));
                    session.reconfigure();
                }
            },
            PipelineEvent::CorruptedFilesDeleted { position, files } => {
                self.emit(RecorderEvent::CorruptedFilesDeleted {
                    slot: position,
                    files,
                });
            },
            PipelineEvent::Error {
                position,
                message,
                recovering,
            } => {
                self.emit(RecorderEvent::PipelineError {
                    slot: position,
                    message,
                    recovering,
                });
            },
            PipelineEvent::Recovered { position, attempts } => {
                self.emit(RecorderEvent::PipelineRecovered {
                    slot: position,
                    attempts,
                });
            },
            PipelineEvent::Stopped {
                position, files, ..
            } => self.on_pipeline_stopped(position, files),
        }
    }

    fn on_pipeline_stopped(self: &Arc<Self>, position: SlotPosition, files: Vec<PathBuf>) {
        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            return;
        };
        let Some(slot) = run.pipelines.get_mut(&position) else {
            return;
        };
        if slot.stopped {
            return;
        }
        slot.stopped = true;
        run.files.extend(files);

        if !run.stopping {
            log::warn!("[COORDINATOR] {} pipeline stopped on its own", position);
            return;
        }
        if run.all_stopped() {
            let finished = guard.take();
            drop(guard);
            if let Some(run) = finished {
                self.finish_run(run);
            }
        }
    }

    fn stop_on_worker(self: &Arc<Self>) {
        self.barrier_timer.cancel(&self.clock);
        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            log::debug!("[COORDINATOR] No active run to stop");
            return;
        };
        if run.stopping {
            log::debug!("[COORDINATOR] Run {} already stopping", run.run_id);
            return;
        }

        log::info!("[COORDINATOR] Stopping run {}", run.run_id);
        run.stopping = true;
        run.barrier = None;
        for slot in run.pipelines.values() {
            slot.pipeline.stop();
        }
        let positions: Vec<SlotPosition> = run.pipelines.keys().copied().collect();
        let finished = if run.all_stopped() { guard.take() } else { None };
        drop(guard);

        for position in positions {
            self.strip_record_target(position);
        }
        if let Some(run) = finished {
            self.finish_run(run);
        }
    }

    fn finish_run(&self, mut run: ActiveRun) {
        for slot in run.pipelines.values() {
            slot.pipeline.shutdown();
        }
        if let Some(manifest) = run.manifest.as_mut() {
            manifest.finalize();
        }
        run.files.sort();
        log::info!(
            "[COORDINATOR] Run {} stopped with {} file(s)",
            run.run_id,
            run.files.len()
        );
        self.emit(RecorderEvent::RecordingStopped { files: run.files });
    }

    fn shutdown_on_worker(&self) {
        self.barrier_timer.cancel(&self.clock);
        let run = self.run.lock().take();
        if let Some(mut run) = run {
            run.stopping = true;
            for slot in run.pipelines.values() {
                slot.pipeline.shutdown();
            }
            if let Some(manifest) = run.manifest.as_mut() {
                manifest.finalize();
            }
            log::info!("[COORDINATOR] Run {} ended by shutdown", run.run_id);
        }
        for entry in &self.cameras {
            entry.session.set_record_target(None);
            entry.session.shutdown();
            entry.preview.release();
        }
    }
}
