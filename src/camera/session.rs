//! One physical camera: open/close, reconnect and capture-session
//! (re)configuration.
//!
//! All device work happens on the session's own worker thread. Public methods
//! only post tasks, so callers never block on device I/O. Device callbacks
//! arrive through a [`DeviceEventSink`] that re-posts them to the same worker,
//! which keeps every state transition for one camera serialized.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::device::{CameraDevice, CameraProvider, DeviceEvent, DeviceEventSink, SessionTemplate};
use super::reconnect::{
    ReconnectDecision, ReconnectState, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS,
};
use super::size::choose_preview_size;
use super::{CameraErrorCode, CameraSessionState, CameraSlot, SlotPosition};
use crate::error::{RecorderError, RecorderResult};
use crate::media::{FrameSize, Surface};
use crate::runtime::{CoordinationClock, TimerSlot, Worker};

/// Timing knobs for one session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimings {
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Settle time before a forced reopen.
    pub force_reopen_delay: Duration,
    /// Delay before retrying preview-only after a record configuration failed.
    pub configure_retry_delay: Duration,
    /// How long `shutdown` waits for the device to close.
    pub close_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            force_reopen_delay: Duration::from_millis(300),
            configure_retry_delay: Duration::from_millis(500),
            close_timeout: Duration::from_millis(2000),
        }
    }
}

/// Messages a session sends to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Opened {
        position: SlotPosition,
    },
    PreviewSizeChosen {
        position: SlotPosition,
        size: FrameSize,
    },
    /// A capture session is running with the current output set.
    Configured {
        position: SlotPosition,
        with_record: bool,
    },
    /// The last (re)configuration failed.
    ConfigureFailed {
        position: SlotPosition,
        had_record: bool,
    },
    Error {
        position: SlotPosition,
        code: CameraErrorCode,
        reconnecting: bool,
    },
    Closed {
        position: SlotPosition,
    },
    StillCaptured {
        position: SlotPosition,
        path: PathBuf,
        error: Option<String>,
    },
}

impl SessionNotice {
    pub fn position(&self) -> SlotPosition {
        match self {
            SessionNotice::Opened { position }
            | SessionNotice::PreviewSizeChosen { position, .. }
            | SessionNotice::Configured { position, .. }
            | SessionNotice::ConfigureFailed { position, .. }
            | SessionNotice::Error { position, .. }
            | SessionNotice::Closed { position }
            | SessionNotice::StillCaptured { position, .. } => *position,
        }
    }
}

/// Capture session most recently requested from the device.
#[derive(Debug, Default, Clone, Copy)]
struct RequestedSession {
    generation: u64,
    with_record: bool,
}

#[derive(Default)]
struct SessionOutputs {
    previews: Vec<Surface>,
    record: Option<Surface>,
}

struct SessionInner {
    slot: CameraSlot,
    provider: Arc<dyn CameraProvider>,
    clock: CoordinationClock,
    worker: Worker,
    timings: SessionTimings,
    target_size: FrameSize,
    notices: flume::Sender<SessionNotice>,
    state: Mutex<CameraSessionState>,
    reconnect: Mutex<ReconnectState>,
    reconnect_timer: TimerSlot,
    retry_timer: TimerSlot,
    outputs: Mutex<SessionOutputs>,
    device: Mutex<Option<Box<dyn CameraDevice>>>,
    requested: Mutex<RequestedSession>,
    preview_size: Mutex<Option<FrameSize>>,
    paused: AtomicBool,
}

/// Handle to one camera session. Cloning shares the session.
#[derive(Clone)]
pub struct CameraSession {
    inner: Arc<SessionInner>,
}

impl CameraSession {
    /// Create a session and its worker. The device is not opened yet.
    pub fn new(
        slot: CameraSlot,
        provider: Arc<dyn CameraProvider>,
        clock: CoordinationClock,
        timings: SessionTimings,
        target_size: FrameSize,
        notices: flume::Sender<SessionNotice>,
    ) -> RecorderResult<Self> {
        let worker = Worker::spawn(format!("camera-{}", slot.position))?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                reconnect: Mutex::new(ReconnectState::new(timings.max_reconnect_attempts)),
                slot,
                provider,
                clock,
                worker,
                timings,
                target_size,
                notices,
                state: Mutex::new(CameraSessionState::Closed),
                reconnect_timer: TimerSlot::new(),
                retry_timer: TimerSlot::new(),
                outputs: Mutex::new(SessionOutputs::default()),
                device: Mutex::new(None),
                requested: Mutex::new(RequestedSession::default()),
                preview_size: Mutex::new(None),
                paused: AtomicBool::new(false),
            }),
        })
    }

    pub fn slot(&self) -> &CameraSlot {
        &self.inner.slot
    }

    pub fn position(&self) -> SlotPosition {
        self.inner.slot.position
    }

    pub fn is_primary(&self) -> bool {
        self.inner.slot.primary
    }

    pub fn state(&self) -> CameraSessionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Size chosen at the last open, if any.
    pub fn preview_size(&self) -> Option<FrameSize> {
        *self.inner.preview_size.lock()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.lock().attempts()
    }

    /// Open the device. No-op for secondary slots.
    pub fn open(&self) {
        if !self.primary_only("open") {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || {
            {
                let mut reconnect = inner.reconnect.lock();
                reconnect.reset();
                reconnect.enable();
            }
            inner.open_on_worker();
        });
    }

    /// Close the device and disable reconnect. No-op for secondary slots.
    pub fn close(&self) {
        if !self.primary_only("close") {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || inner.close_on_worker());
    }

    /// Tear down and recreate the capture session with the current outputs.
    pub fn reconfigure(&self) {
        if !self.primary_only("reconfigure") {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || inner.configure_on_worker());
    }

    /// Reset reconnect state and reopen immediately.
    pub fn reconnect(&self) {
        if !self.primary_only("reconnect") {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || {
            inner.prepare_manual_reopen();
            inner.open_on_worker();
        });
    }

    /// Reset reconnect state and reopen after a short settle delay,
    /// regardless of the current state.
    pub fn force_reopen(&self) {
        if !self.primary_only("force_reopen") {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || {
            log::info!(
                "[CAMERA_SESSION] {} force reopen requested",
                inner.slot.position
            );
            inner.prepare_manual_reopen();
            let weak = Arc::downgrade(&inner);
            inner.reconnect_timer.arm(
                &inner.clock,
                "camera-force-reopen",
                inner.timings.force_reopen_delay,
                move || post_to_worker(&weak, |inner| inner.open_on_worker()),
            );
        });
    }

    /// Release the device while the host is in the background.
    pub fn pause(&self) {
        if !self.primary_only("pause") {
            return;
        }
        self.inner.paused.store(true, Ordering::SeqCst);
        self.close();
    }

    /// Reopen after [`CameraSession::pause`]. No-op if not paused.
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            self.reconnect();
        }
    }

    /// Set or clear the record output used by the next reconfiguration.
    pub fn set_record_target(&self, target: Option<Surface>) {
        self.inner.outputs.lock().record = target;
    }

    pub fn has_record_target(&self) -> bool {
        self.inner.outputs.lock().record.is_some()
    }

    /// Add a preview output (the slot's own preview or a secondary's mirror).
    pub fn add_preview_output(&self, surface: Surface) {
        let mut outputs = self.inner.outputs.lock();
        if !outputs.previews.iter().any(|s| s.same_as(&surface)) {
            outputs.previews.push(surface);
        }
    }

    pub fn remove_preview_output(&self, surface: &Surface) {
        self.inner
            .outputs
            .lock()
            .previews
            .retain(|s| !s.same_as(surface));
    }

    /// Capture a JPEG still on the session worker. The outcome is reported
    /// as [`SessionNotice::StillCaptured`].
    pub fn capture_still(&self, path: PathBuf) {
        if !self.primary_only("capture_still") {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.worker.post(move || {
            let result = match inner.device.lock().as_mut() {
                Some(device) => device.capture_still(&path),
                None => Err(RecorderError::camera(
                    CameraErrorCode::Disconnected,
                    "no open device",
                )),
            };
            if let Err(e) = &result {
                log::warn!(
                    "[CAMERA_SESSION] {} still capture failed: {}",
                    inner.slot.position,
                    e
                );
            }
            inner.notify(SessionNotice::StillCaptured {
                position: inner.slot.position,
                path,
                error: result.err().map(|e| e.to_string()),
            });
        });
    }

    /// Wait until all tasks posted so far have run.
    pub fn flush(&self, timeout: Duration) -> RecorderResult<()> {
        self.inner.worker.call(timeout, || ())
    }

    /// Close the device (primary) and stop the worker.
    pub fn shutdown(&self) {
        self.inner.reconnect_timer.cancel(&self.inner.clock);
        self.inner.retry_timer.cancel(&self.inner.clock);
        if self.is_primary() {
            let inner = Arc::clone(&self.inner);
            if let Err(e) = self
                .inner
                .worker
                .call(self.inner.timings.close_timeout, move || {
                    inner.close_on_worker()
                })
            {
                log::warn!(
                    "[CAMERA_SESSION] {} close on shutdown: {}",
                    self.position(),
                    e
                );
            }
        }
        self.inner.worker.shutdown();
    }

    fn primary_only(&self, op: &str) -> bool {
        if !self.inner.slot.primary {
            log::debug!(
                "[CAMERA_SESSION] {} is secondary for device {}, skipping {}",
                self.inner.slot.position,
                self.inner.slot.device_id,
                op
            );
        }
        self.inner.slot.primary
    }
}

/// Post a task for a session that may already be gone.
fn post_to_worker<F>(weak: &Weak<SessionInner>, task: F)
where
    F: FnOnce(&Arc<SessionInner>) + Send + 'static,
{
    if let Some(inner) = weak.upgrade() {
        let target = Arc::clone(&inner);
        inner.worker.post(move || task(&target));
    }
}

impl SessionInner {
    fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).is_err() {
            log::trace!("[CAMERA_SESSION] {} notice dropped", self.slot.position);
        }
    }

    fn set_state(&self, next: CameraSessionState) {
        let mut state = self.state.lock();
        if *state != next {
            log::debug!(
                "[CAMERA_SESSION] {} {:?} -> {:?}",
                self.slot.position,
                *state,
                next
            );
            *state = next;
        }
    }

    fn device_sink(self: &Arc<Self>) -> DeviceEventSink {
        let weak = Arc::downgrade(self);
        DeviceEventSink::new(move |event| {
            post_to_worker(&weak, move |inner| inner.on_device_event(event));
        })
    }

    fn resolve_preview_size(&self) -> FrameSize {
        let candidates = match self.provider.output_sizes(&self.slot.device_id) {
            Ok(sizes) => sizes,
            Err(e) => {
                log::warn!(
                    "[CAMERA_SESSION] {} could not query sizes: {}",
                    self.slot.position,
                    e
                );
                Vec::new()
            },
        };
        let size = choose_preview_size(&candidates, self.target_size);
        *self.preview_size.lock() = Some(size);
        self.notify(SessionNotice::PreviewSizeChosen {
            position: self.slot.position,
            size,
        });
        size
    }

    fn open_on_worker(self: &Arc<Self>) {
        let state = *self.state.lock();
        if state.is_active() {
            log::debug!(
                "[CAMERA_SESSION] {} already {:?}, ignoring open",
                self.slot.position,
                state
            );
            return;
        }

        self.set_state(CameraSessionState::Opening);
        let size = self.resolve_preview_size();
        log::info!(
            "[CAMERA_SESSION] Opening {} (device {}) at {}",
            self.slot.position,
            self.slot.device_id,
            size
        );

        match self
            .provider
            .open(&self.slot.device_id, size, self.device_sink())
        {
            Ok(device) => {
                *self.device.lock() = Some(device);
            },
            Err(e) => {
                log::warn!(
                    "[CAMERA_SESSION] {} open failed: {}",
                    self.slot.position,
                    e
                );
                let code = e.camera_code().unwrap_or(CameraErrorCode::AccessFailed);
                self.handle_error(code);
            },
        }
    }

    fn on_device_event(self: &Arc<Self>, event: DeviceEvent) {
        match event {
            DeviceEvent::Opened => {
                if *self.state.lock() != CameraSessionState::Opening {
                    log::debug!(
                        "[CAMERA_SESSION] {} stale open callback ignored",
                        self.slot.position
                    );
                    return;
                }
                self.set_state(CameraSessionState::Open);
                self.reconnect.lock().reset();
                log::info!("[CAMERA_SESSION] {} opened", self.slot.position);
                self.notify(SessionNotice::Opened {
                    position: self.slot.position,
                });
                self.configure_on_worker();
            },
            DeviceEvent::Disconnected => {
                log::warn!("[CAMERA_SESSION] {} disconnected", self.slot.position);
                self.handle_error(CameraErrorCode::Disconnected);
            },
            DeviceEvent::Error(code) => {
                log::error!("[CAMERA_SESSION] {} device error {}", self.slot.position, code);
                self.handle_error(code);
            },
            DeviceEvent::SessionConfigured { generation } => {
                if !self.is_current_generation(generation) {
                    return;
                }
                if *self.state.lock() != CameraSessionState::ConfiguringSession {
                    return;
                }
                self.set_state(CameraSessionState::Previewing);
                let with_record = self.requested.lock().with_record;
                log::info!(
                    "[CAMERA_SESSION] {} session configured (record={})",
                    self.slot.position,
                    with_record
                );
                self.notify(SessionNotice::Configured {
                    position: self.slot.position,
                    with_record,
                });
            },
            DeviceEvent::SessionConfigureFailed { generation } => {
                if !self.is_current_generation(generation) {
                    return;
                }
                self.on_configure_failed();
            },
            DeviceEvent::Closed => {
                log::debug!("[CAMERA_SESSION] {} device closed", self.slot.position);
            },
        }
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        let current = self.requested.lock().generation;
        if generation != current {
            log::debug!(
                "[CAMERA_SESSION] {} ignoring callback for session {} (current {})",
                self.slot.position,
                generation,
                current
            );
        }
        generation == current
    }

    fn configure_on_worker(self: &Arc<Self>) {
        let had_record = self.outputs.lock().record.is_some();
        if !self.state.lock().is_connected() {
            log::warn!(
                "[CAMERA_SESSION] {} cannot configure while {:?}",
                self.slot.position,
                *self.state.lock()
            );
            self.notify(SessionNotice::ConfigureFailed {
                position: self.slot.position,
                had_record,
            });
            return;
        }

        let (surfaces, template) = {
            let outputs = self.outputs.lock();
            let mut surfaces = outputs.previews.clone();
            let template = match &outputs.record {
                Some(record) => {
                    surfaces.push(record.clone());
                    SessionTemplate::Record
                },
                None => SessionTemplate::Preview,
            };
            (surfaces, template)
        };

        let result = {
            let mut device = self.device.lock();
            match device.as_mut() {
                Some(device) => {
                    if let Err(e) = device.close_session() {
                        log::warn!(
                            "[CAMERA_SESSION] {} closing old session: {}",
                            self.slot.position,
                            e
                        );
                    }
                    let generation = {
                        let mut requested = self.requested.lock();
                        requested.generation += 1;
                        requested.with_record = template == SessionTemplate::Record;
                        requested.generation
                    };
                    self.set_state(CameraSessionState::ConfiguringSession);
                    log::debug!(
                        "[CAMERA_SESSION] {} creating session {} with {} outputs ({:?})",
                        self.slot.position,
                        generation,
                        surfaces.len(),
                        template
                    );
                    device.create_session(&surfaces, template, generation)
                },
                None => Err(RecorderError::camera(
                    CameraErrorCode::Disconnected,
                    "no open device",
                )),
            }
        };

        if let Err(e) = result {
            log::warn!(
                "[CAMERA_SESSION] {} session creation failed: {}",
                self.slot.position,
                e
            );
            self.on_configure_failed();
        }
    }

    fn on_configure_failed(self: &Arc<Self>) {
        let had_record = self.outputs.lock().record.take().is_some();
        self.notify(SessionNotice::ConfigureFailed {
            position: self.slot.position,
            had_record,
        });

        if had_record {
            log::warn!(
                "[CAMERA_SESSION] {} record session failed, retrying preview-only",
                self.slot.position
            );
            let weak = Arc::downgrade(self);
            self.retry_timer.arm(
                &self.clock,
                "camera-preview-retry",
                self.timings.configure_retry_delay,
                move || post_to_worker(&weak, |inner| inner.configure_on_worker()),
            );
        } else {
            log::error!(
                "[CAMERA_SESSION] {} preview session failed",
                self.slot.position
            );
            self.set_state(CameraSessionState::Open);
            self.notify(SessionNotice::Error {
                position: self.slot.position,
                code: CameraErrorCode::SessionConfigureFailed,
                reconnecting: false,
            });
        }
    }

    fn handle_error(self: &Arc<Self>, code: CameraErrorCode) {
        self.retry_timer.cancel(&self.clock);
        self.teardown_handles();

        if code.is_permanent() {
            self.reconnect.lock().disable();
            self.reconnect_timer.cancel(&self.clock);
            self.set_state(CameraSessionState::FatalError);
            log::error!(
                "[CAMERA_SESSION] {} permanent error {}, reconnect disabled",
                self.slot.position,
                code
            );
            self.notify(SessionNotice::Error {
                position: self.slot.position,
                code,
                reconnecting: false,
            });
            return;
        }

        self.set_state(CameraSessionState::Disconnected);
        let reconnecting = self.schedule_reconnect();
        self.notify(SessionNotice::Error {
            position: self.slot.position,
            code,
            reconnecting,
        });
    }

    /// Returns true if an attempt is (or already was) scheduled.
    fn schedule_reconnect(self: &Arc<Self>) -> bool {
        let decision = self.reconnect.lock().next_attempt();
        match decision {
            ReconnectDecision::Schedule { attempt } => {
                log::info!(
                    "[CAMERA_SESSION] {} reconnect attempt {}/{} in {:?}",
                    self.slot.position,
                    attempt,
                    self.timings.max_reconnect_attempts,
                    self.timings.reconnect_delay
                );
                let weak = Arc::downgrade(self);
                self.reconnect_timer.arm(
                    &self.clock,
                    "camera-reconnect",
                    self.timings.reconnect_delay,
                    move || post_to_worker(&weak, |inner| inner.reconnect_fire()),
                );
                true
            },
            ReconnectDecision::AlreadyInFlight => true,
            ReconnectDecision::Disabled => {
                log::debug!(
                    "[CAMERA_SESSION] {} reconnect disabled",
                    self.slot.position
                );
                false
            },
            ReconnectDecision::Exhausted => {
                log::error!(
                    "[CAMERA_SESSION] {} gave up after {} reconnect attempts",
                    self.slot.position,
                    self.timings.max_reconnect_attempts
                );
                false
            },
        }
    }

    fn reconnect_fire(self: &Arc<Self>) {
        let enabled = {
            let mut reconnect = self.reconnect.lock();
            reconnect.attempt_started();
            reconnect.is_enabled()
        };
        if !enabled {
            return;
        }
        if self.state.lock().is_active() {
            log::debug!(
                "[CAMERA_SESSION] {} already reconnected",
                self.slot.position
            );
            return;
        }
        self.teardown_handles();
        self.open_on_worker();
    }

    fn prepare_manual_reopen(&self) {
        self.reconnect_timer.cancel(&self.clock);
        self.retry_timer.cancel(&self.clock);
        {
            let mut reconnect = self.reconnect.lock();
            reconnect.reset();
            reconnect.enable();
        }
        self.paused.store(false, Ordering::SeqCst);
        self.teardown_handles();
        self.set_state(CameraSessionState::Disconnected);
    }

    fn close_on_worker(&self) {
        self.reconnect_timer.cancel(&self.clock);
        self.retry_timer.cancel(&self.clock);
        {
            let mut reconnect = self.reconnect.lock();
            reconnect.reset();
            reconnect.disable();
        }
        let was = *self.state.lock();
        self.teardown_handles();
        self.outputs.lock().record = None;
        self.set_state(CameraSessionState::Closed);
        if was != CameraSessionState::Closed {
            log::info!("[CAMERA_SESSION] {} closed", self.slot.position);
            self.notify(SessionNotice::Closed {
                position: self.slot.position,
            });
        }
    }

    /// Close session and device, logging and swallowing every error.
    fn teardown_handles(&self) {
        let Some(mut device) = self.device.lock().take() else {
            return;
        };
        if let Err(e) = device.close_session() {
            log::warn!(
                "[CAMERA_SESSION] {} close session: {}",
                self.slot.position,
                e
            );
        }
        if let Err(e) = device.close() {
            log::warn!(
                "[CAMERA_SESSION] {} close device: {}",
                self.slot.position,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCameraProvider;

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_timings(max_attempts: u32) -> SessionTimings {
        SessionTimings {
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_attempts: max_attempts,
            force_reopen_delay: Duration::from_millis(5),
            configure_retry_delay: Duration::from_millis(10),
            close_timeout: Duration::from_secs(1),
        }
    }

    struct Harness {
        provider: SimCameraProvider,
        clock: CoordinationClock,
        notices: flume::Receiver<SessionNotice>,
        tx: flume::Sender<SessionNotice>,
    }

    impl Harness {
        fn new() -> Self {
            let provider = SimCameraProvider::new();
            provider.add_device("0", vec![FrameSize::new(64, 48)]);
            let (tx, notices) = flume::unbounded();
            Self {
                provider,
                clock: CoordinationClock::start("test-clock").unwrap(),
                notices,
                tx,
            }
        }

        fn session(&self, slot: CameraSlot, max_attempts: u32) -> CameraSession {
            CameraSession::new(
                slot,
                Arc::new(self.provider.clone()),
                self.clock.clone(),
                fast_timings(max_attempts),
                FrameSize::new(64, 48),
                self.tx.clone(),
            )
            .unwrap()
        }

        fn wait_for<F: Fn(&SessionNotice) -> bool>(&self, pred: F) -> SessionNotice {
            let deadline = std::time::Instant::now() + WAIT;
            loop {
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                let notice = self
                    .notices
                    .recv_timeout(remaining)
                    .expect("expected notice did not arrive");
                if pred(&notice) {
                    return notice;
                }
            }
        }
    }

    #[test]
    fn test_open_reaches_previewing() {
        let h = Harness::new();
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 3);
        session.add_preview_output(Surface::new("preview"));
        session.open();

        h.wait_for(|n| matches!(n, SessionNotice::PreviewSizeChosen { .. }));
        h.wait_for(|n| matches!(n, SessionNotice::Configured { with_record: false, .. }));
        assert_eq!(session.state(), CameraSessionState::Previewing);
        assert!(session.is_connected());
        assert_eq!(session.preview_size(), Some(FrameSize::new(64, 48)));
        session.shutdown();
        assert_eq!(h.provider.close_count("0"), 1);
    }

    #[test]
    fn test_reconfigure_with_record_target() {
        let h = Harness::new();
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 3);
        session.open();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));

        let record = Surface::new("record");
        session.set_record_target(Some(record.clone()));
        session.reconfigure();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { with_record: true, .. }));

        std::thread::sleep(Duration::from_millis(100));
        assert!(record.frames_queued() > 0);
        session.shutdown();
    }

    #[test]
    fn test_configured_reports_outputs_of_its_own_request() {
        let h = Harness::new();
        h.provider.set_never_configure("0", true);
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 3);
        session.add_preview_output(Surface::new("preview"));
        session.open();
        h.wait_for(|n| matches!(n, SessionNotice::PreviewSizeChosen { .. }));

        // A record target arrives while the preview-only request is in flight
        let deadline = std::time::Instant::now() + WAIT;
        while session.state() != CameraSessionState::ConfiguringSession {
            assert!(std::time::Instant::now() < deadline, "never started configuring");
            std::thread::sleep(Duration::from_millis(5));
        }
        session.set_record_target(Some(Surface::new("record")));
        while !h.provider.complete_held_configure("0") {
            assert!(std::time::Instant::now() < deadline, "configure was never requested");
            std::thread::sleep(Duration::from_millis(5));
        }

        h.wait_for(|n| matches!(n, SessionNotice::Configured { with_record: false, .. }));
        assert!(session.has_record_target());
        assert_eq!(session.state(), CameraSessionState::Previewing);
        session.shutdown();
    }

    #[test]
    fn test_record_configure_failure_falls_back_to_preview() {
        let h = Harness::new();
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 3);
        session.open();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));

        h.provider.set_fail_record_configure("0", true);
        session.set_record_target(Some(Surface::new("record")));
        session.reconfigure();

        h.wait_for(|n| matches!(n, SessionNotice::ConfigureFailed { had_record: true, .. }));
        h.wait_for(|n| matches!(n, SessionNotice::Configured { with_record: false, .. }));
        assert!(!session.has_record_target());
        session.shutdown();
    }

    #[test]
    fn test_transient_error_reconnects() {
        let h = Harness::new();
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 5);
        session.open();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));

        h.provider.inject_error("0", CameraErrorCode::InUse);
        h.wait_for(|n| {
            matches!(
                n,
                SessionNotice::Error {
                    code: CameraErrorCode::InUse,
                    reconnecting: true,
                    ..
                }
            )
        });
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));
        assert_eq!(h.provider.open_count("0"), 2);
        assert_eq!(session.reconnect_attempts(), 0);
        session.shutdown();
    }

    #[test]
    fn test_permanent_error_disables_reconnect() {
        let h = Harness::new();
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 5);
        session.open();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));

        h.provider.inject_error("0", CameraErrorCode::Disabled);
        h.wait_for(|n| matches!(n, SessionNotice::Error { reconnecting: false, .. }));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(session.state(), CameraSessionState::FatalError);
        assert_eq!(h.provider.open_count("0"), 1);

        session.force_reopen();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));
        assert_eq!(h.provider.open_count("0"), 2);
        session.shutdown();
    }

    #[test]
    fn test_reconnect_attempts_never_exceed_cap() {
        let h = Harness::new();
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 4);
        session.open();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));

        h.provider.set_open_error("0", Some(CameraErrorCode::Service));
        h.provider.disconnect("0");

        std::thread::sleep(Duration::from_millis(400));
        session.flush(WAIT).unwrap();
        // One successful open plus four failed attempts
        assert_eq!(h.provider.open_attempts("0"), 5);
        assert_eq!(session.state(), CameraSessionState::Disconnected);

        h.provider.set_open_error("0", None);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(session.state(), CameraSessionState::Disconnected);

        session.force_reopen();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));
        session.shutdown();
    }

    #[test]
    fn test_secondary_is_noop() {
        let h = Harness::new();
        let primary = h.session(CameraSlot::new(SlotPosition::Front, "0"), 3);
        let secondary = h.session(CameraSlot::new(SlotPosition::Left, "0").secondary(), 3);

        secondary.open();
        secondary.flush(WAIT).unwrap();
        assert_eq!(h.provider.open_count("0"), 0);

        primary.open();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));
        secondary.close();
        secondary.reconnect();
        secondary.flush(WAIT).unwrap();
        assert_eq!(h.provider.close_count("0"), 0);
        assert_eq!(h.provider.open_count("0"), 1);

        primary.close();
        h.wait_for(|n| matches!(n, SessionNotice::Closed { .. }));
        assert_eq!(h.provider.close_count("0"), 1);
        primary.shutdown();
        secondary.shutdown();
        assert_eq!(h.provider.close_count("0"), 1);
    }

    #[test]
    fn test_pause_and_resume() {
        let h = Harness::new();
        let session = h.session(CameraSlot::new(SlotPosition::Front, "0"), 3);
        session.open();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));

        session.pause();
        h.wait_for(|n| matches!(n, SessionNotice::Closed { .. }));
        assert!(!session.is_connected());

        session.resume();
        h.wait_for(|n| matches!(n, SessionNotice::Configured { .. }));
        assert!(session.is_connected());
        session.shutdown();
    }
}
