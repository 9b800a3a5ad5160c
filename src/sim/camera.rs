//! Simulated camera devices.
//!
//! Each registered device produces solid-color frames on its own thread while
//! open and fans them out to the current capture-session outputs. Behaviour
//! switches let tests make opens fail, make (record) session configuration
//! fail or hang, stall frame delivery, and inject disconnects and errors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::camera::{
    CameraDevice, CameraErrorCode, CameraProvider, DeviceEvent, DeviceEventSink, SessionTemplate,
};
use crate::error::{RecorderError, RecorderResult};
use crate::media::{FrameSize, Surface, VideoFrame};

/// Default interval between simulated frames.
pub const SIM_FRAME_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
struct DeviceBehaviour {
    sizes: Vec<FrameSize>,
    open_error: Option<CameraErrorCode>,
    fail_configure: bool,
    fail_record_configure: bool,
    never_configure: bool,
    /// Last session request left unanswered by `never_configure`.
    held_configure: Option<(u64, Vec<Surface>)>,
    opens: u32,
    open_attempts: u32,
    closes: u32,
    configures: u32,
    live: Option<LiveDevice>,
}

/// Shared handles of the currently open instance of a device.
#[derive(Clone)]
struct LiveDevice {
    events: DeviceEventSink,
    outputs: Arc<Mutex<Vec<Surface>>>,
    stop: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
}

struct ProviderState {
    devices: Mutex<HashMap<String, DeviceBehaviour>>,
    frame_interval: Duration,
    epoch: Instant,
}

/// In-process [`CameraProvider`]. Cloning shares the device table.
#[derive(Clone)]
pub struct SimCameraProvider {
    state: Arc<ProviderState>,
}

impl Default for SimCameraProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCameraProvider {
    pub fn new() -> Self {
        Self::with_frame_interval(SIM_FRAME_INTERVAL)
    }

    pub fn with_frame_interval(frame_interval: Duration) -> Self {
        Self {
            state: Arc::new(ProviderState {
                devices: Mutex::new(HashMap::new()),
                frame_interval,
                epoch: Instant::now(),
            }),
        }
    }

    /// Register a device with its supported output sizes.
    pub fn add_device(&self, device_id: &str, sizes: Vec<FrameSize>) {
        self.state.devices.lock().insert(
            device_id.to_string(),
            DeviceBehaviour {
                sizes,
                ..Default::default()
            },
        );
    }

    /// Make subsequent opens fail with `code` (`None` to succeed again).
    pub fn set_open_error(&self, device_id: &str, code: Option<CameraErrorCode>) {
        self.with_device(device_id, |d| d.open_error = code);
    }

    pub fn set_fail_configure(&self, device_id: &str, fail: bool) {
        self.with_device(device_id, |d| d.fail_configure = fail);
    }

    /// Fail only sessions that include a record output.
    pub fn set_fail_record_configure(&self, device_id: &str, fail: bool) {
        self.with_device(device_id, |d| d.fail_record_configure = fail);
    }

    /// Never report a configuration result.
    pub fn set_never_configure(&self, device_id: &str, never: bool) {
        self.with_device(device_id, |d| d.never_configure = never);
    }

    /// Answer the session request held back by `set_never_configure`.
    /// Returns false when nothing was held.
    pub fn complete_held_configure(&self, device_id: &str) -> bool {
        let held = self
            .state
            .devices
            .lock()
            .get_mut(device_id)
            .and_then(|d| d.held_configure.take());
        let (Some((generation, outputs)), Some(live)) = (held, self.live(device_id)) else {
            return false;
        };
        *live.outputs.lock() = outputs;
        live.events.send(DeviceEvent::SessionConfigured { generation });
        true
    }

    /// Keep the device open but stop delivering frames.
    pub fn set_stalled(&self, device_id: &str, stalled: bool) {
        if let Some(live) = self.live(device_id) {
            live.stalled.store(stalled, Ordering::SeqCst);
        }
    }

    /// Simulate the device going away.
    pub fn disconnect(&self, device_id: &str) {
        if let Some(live) = self.live(device_id) {
            live.stop.store(true, Ordering::SeqCst);
            live.events.send(DeviceEvent::Disconnected);
        }
    }

    /// Deliver an asynchronous device error.
    pub fn inject_error(&self, device_id: &str, code: CameraErrorCode) {
        if let Some(live) = self.live(device_id) {
            live.stop.store(true, Ordering::SeqCst);
            live.events.send(DeviceEvent::Error(code));
        }
    }

    /// Successful opens.
    pub fn open_count(&self, device_id: &str) -> u32 {
        self.read_device(device_id, |d| d.opens)
    }

    /// Every call to `open`, including failures.
    pub fn open_attempts(&self, device_id: &str) -> u32 {
        self.read_device(device_id, |d| d.open_attempts)
    }

    pub fn close_count(&self, device_id: &str) -> u32 {
        self.read_device(device_id, |d| d.closes)
    }

    pub fn configure_count(&self, device_id: &str) -> u32 {
        self.read_device(device_id, |d| d.configures)
    }

    pub fn is_open(&self, device_id: &str) -> bool {
        self.read_device(device_id, |d| d.live.is_some())
    }

    fn with_device<F: FnOnce(&mut DeviceBehaviour)>(&self, device_id: &str, f: F) {
        match self.state.devices.lock().get_mut(device_id) {
            Some(device) => f(device),
            None => log::warn!("[SIM_CAMERA] Unknown device {}", device_id),
        }
    }

    fn read_device<R: Default, F: FnOnce(&DeviceBehaviour) -> R>(&self, device_id: &str, f: F) -> R {
        self.state
            .devices
            .lock()
            .get(device_id)
            .map(f)
            .unwrap_or_default()
    }

    fn live(&self, device_id: &str) -> Option<LiveDevice> {
        self.state
            .devices
            .lock()
            .get(device_id)
            .and_then(|d| d.live.clone())
    }
}

impl CameraProvider for SimCameraProvider {
    fn output_sizes(&self, device_id: &str) -> RecorderResult<Vec<FrameSize>> {
        self.state
            .devices
            .lock()
            .get(device_id)
            .map(|d| d.sizes.clone())
            .ok_or_else(|| {
                RecorderError::camera(
                    CameraErrorCode::AccessFailed,
                    format!("unknown device {}", device_id),
                )
            })
    }

    fn open(
        &self,
        device_id: &str,
        size: FrameSize,
        events: DeviceEventSink,
    ) -> RecorderResult<Box<dyn CameraDevice>> {
        let live = {
            let mut devices = self.state.devices.lock();
            let device = devices.get_mut(device_id).ok_or_else(|| {
                RecorderError::camera(
                    CameraErrorCode::AccessFailed,
                    format!("unknown device {}", device_id),
                )
            })?;
            device.open_attempts += 1;
            if let Some(code) = device.open_error {
                return Err(RecorderError::camera(code, "simulated open failure"));
            }
            if let Some(previous) = device.live.take() {
                previous.stop.store(true, Ordering::SeqCst);
            }
            device.opens += 1;
            let live = LiveDevice {
                events,
                outputs: Arc::new(Mutex::new(Vec::new())),
                stop: Arc::new(AtomicBool::new(false)),
                stalled: Arc::new(AtomicBool::new(false)),
            };
            device.live = Some(live.clone());
            live
        };

        spawn_frame_thread(
            device_id,
            size,
            self.state.frame_interval,
            self.state.epoch,
            live.clone(),
        )?;
        live.events.send(DeviceEvent::Opened);

        Ok(Box::new(SimCameraDevice {
            device_id: device_id.to_string(),
            provider: Arc::clone(&self.state),
            live,
            closed: false,
        }))
    }
}

fn device_color(device_id: &str) -> [u8; 4] {
    let seed = device_id.bytes().fold(17u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    [seed, seed.wrapping_mul(3), seed.wrapping_mul(7), 255]
}

fn spawn_frame_thread(
    device_id: &str,
    size: FrameSize,
    interval: Duration,
    epoch: Instant,
    live: LiveDevice,
) -> RecorderResult<()> {
    let color = device_color(device_id);
    std::thread::Builder::new()
        .name(format!("sim-camera-{}", device_id))
        .spawn(move || {
            let mut frame_id = 0u64;
            while !live.stop.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if live.stalled.load(Ordering::SeqCst) {
                    continue;
                }
                let outputs = live.outputs.lock().clone();
                if outputs.is_empty() {
                    continue;
                }
                let timestamp_ns = epoch.elapsed().as_nanos() as i64;
                let frame = VideoFrame::solid(size, color, timestamp_ns)
                    .with_frame_id(frame_id);
                frame_id += 1;
                for surface in &outputs {
                    surface.queue_frame(frame.clone());
                }
            }
        })
        .map_err(|e| RecorderError::Other(format!("Failed to spawn sim camera: {}", e)))?;
    Ok(())
}

struct SimCameraDevice {
    device_id: String,
    provider: Arc<ProviderState>,
    live: LiveDevice,
    closed: bool,
}

impl SimCameraDevice {
    fn ensure_open(&self) -> RecorderResult<()> {
        if self.closed || self.live.stop.load(Ordering::SeqCst) {
            return Err(RecorderError::camera(
                CameraErrorCode::Disconnected,
                format!("device {} is not open", self.device_id),
            ));
        }
        Ok(())
    }
}

impl CameraDevice for SimCameraDevice {
    fn create_session(
        &mut self,
        outputs: &[Surface],
        template: SessionTemplate,
        generation: u64,
    ) -> RecorderResult<()> {
        self.ensure_open()?;
        let (fail, hang) = {
            let mut devices = self.provider.devices.lock();
            match devices.get_mut(&self.device_id) {
                Some(device) => {
                    device.configures += 1;
                    let fail = device.fail_configure
                        || (device.fail_record_configure && template == SessionTemplate::Record);
                    if device.never_configure {
                        device.held_configure = Some((generation, outputs.to_vec()));
                    }
                    (fail, device.never_configure)
                },
                None => (true, false),
            }
        };

        if hang {
            return Ok(());
        }
        if fail {
            self.live
                .events
                .send(DeviceEvent::SessionConfigureFailed { generation });
            return Ok(());
        }

        *self.live.outputs.lock() = outputs.to_vec();
        self.live
            .events
            .send(DeviceEvent::SessionConfigured { generation });
        Ok(())
    }

    fn close_session(&mut self) -> RecorderResult<()> {
        self.live.outputs.lock().clear();
        Ok(())
    }

    fn capture_still(&mut self, path: &Path) -> RecorderResult<()> {
        self.ensure_open()?;
        let [r, g, b, _] = device_color(&self.device_id);
        let image = image::RgbImage::from_pixel(64, 48, image::Rgb([r, g, b]));
        image.save_with_format(path, image::ImageFormat::Jpeg)?;
        Ok(())
    }

    fn close(&mut self) -> RecorderResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.live.stop.store(true, Ordering::SeqCst);
        self.live.outputs.lock().clear();

        let mut devices = self.provider.devices.lock();
        if let Some(device) = devices.get_mut(&self.device_id) {
            device.closes += 1;
            let same_instance = device
                .live
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(&live.stop, &self.live.stop));
            if same_instance {
                device.live = None;
            }
        }
        drop(devices);

        self.live.events.send(DeviceEvent::Closed);
        Ok(())
    }
}

impl Drop for SimCameraDevice {
    fn drop(&mut self) {
        self.live.stop.store(true, Ordering::SeqCst);
    }
}
