//! End-to-end scenarios on the simulated backend.

use super::*;
use crate::camera::{CameraErrorCode, CameraSessionState};
use crate::config::{BackendPolicy, CarModel, SlotConfig};
use crate::manifest::{read_manifest, SegmentStatus};
use crate::media::ffmpeg::FfmpegWriterFactory;
use crate::media::{FrameSize, WriterFactory};
use crate::pipeline::MIN_SEGMENT_BYTES;
use crate::sim::{SimCameraProvider, SimEncoderFactory, SimWriterFactory};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Instant;
use SlotPosition::*;

const WAIT: Duration = Duration::from_secs(10);
const SENSOR: FrameSize = FrameSize::new(64, 48);

fn timings(segment: Duration) -> CoordinatorTimings {
    CoordinatorTimings {
        session: SessionTimings {
            reconnect_delay: Duration::from_millis(50),
            force_reopen_delay: Duration::from_millis(20),
            configure_retry_delay: Duration::from_millis(50),
            ..SessionTimings::default()
        },
        pipeline: PipelineTimings {
            recovery_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(200),
            first_size_check: Duration::from_millis(50),
            size_check_interval: Duration::from_millis(100),
            reconfigure_timeout: Duration::from_millis(500),
            ..PipelineTimings::default().with_segment_duration(segment)
        },
        barrier: BarrierTimings {
            timeout: Duration::from_millis(400),
        },
        snapshot_stagger: Duration::from_millis(30),
        shutdown_timeout: Duration::from_secs(5),
    }
}

struct Harness {
    dir: tempfile::TempDir,
    provider: SimCameraProvider,
    encoders: SimEncoderFactory,
    coordinator: MultiCameraCoordinator,
    events: flume::Receiver<RecorderEvent>,
}

impl Harness {
    fn new(slots: Vec<SlotConfig>, backend: BackendPolicy, timings: CoordinatorTimings) -> Self {
        Self::with_writers(slots, backend, timings, Arc::new(SimWriterFactory::new()))
    }

    fn with_writers(
        slots: Vec<SlotConfig>,
        backend: BackendPolicy,
        timings: CoordinatorTimings,
        writers: Arc<dyn WriterFactory>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let provider = SimCameraProvider::new();
        for slot in &slots {
            provider.add_device(&slot.device_id, vec![SENSOR]);
        }
        let config = RecorderConfig {
            output_dir: dir.path().to_path_buf(),
            car_model: CarModel::Custom,
            camera_count: slots.len() as u8,
            slots,
            backend,
            ..RecorderConfig::default()
        };
        let encoders = SimEncoderFactory::new();
        let backends = PipelineBackends {
            encoders: Arc::new(encoders.clone()),
            writers,
        };
        let coordinator =
            MultiCameraCoordinator::new(config, Arc::new(provider.clone()), backends, timings)
                .unwrap();
        let events = coordinator.subscribe();
        Self {
            dir,
            provider,
            encoders,
            coordinator,
            events,
        }
    }

    fn wait_for<F: Fn(&RecorderEvent) -> bool>(&self, pred: F) -> RecorderEvent {
        self.collect_until(pred).pop().unwrap()
    }

    /// Every event up to and including the first one matching `pred`.
    fn collect_until<F: Fn(&RecorderEvent) -> bool>(&self, pred: F) -> Vec<RecorderEvent> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self
                .events
                .recv_timeout(remaining)
                .unwrap_or_else(|_| panic!("expected event did not arrive, saw {:?}", seen));
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Open every camera and wait until each previews.
    fn open(&self, cameras: usize) {
        self.coordinator.open_all();
        let mut previewing = BTreeSet::new();
        while previewing.len() < cameras {
            if let RecorderEvent::CameraConfigured {
                slot,
                recording: false,
            } = self.wait_for(|e| matches!(e, RecorderEvent::CameraConfigured { .. }))
            {
                previewing.insert(slot);
            }
        }
    }

    fn start(&self, run_id: RunId) -> Vec<SlotPosition> {
        assert!(self.coordinator.start_recording(run_id));
        match self.wait_for(|e| matches!(e, RecorderEvent::RecordingStarted { .. })) {
            RecorderEvent::RecordingStarted { slots, .. } => slots,
            _ => unreachable!(),
        }
    }

    fn stop(&self) -> Vec<PathBuf> {
        self.coordinator.stop_recording();
        match self.wait_for(|e| matches!(e, RecorderEvent::RecordingStopped { .. })) {
            RecorderEvent::RecordingStopped { files } => files,
            _ => unreachable!(),
        }
    }
}

fn wait_until<F: Fn() -> bool>(cond: F) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn run_id() -> RunId {
    RunId::parse("20240601_120000").unwrap()
}

fn four_slots() -> Vec<SlotConfig> {
    vec![
        SlotConfig::new(Front, "0"),
        SlotConfig::new(Back, "1"),
        SlotConfig::new(Left, "2"),
        SlotConfig::new(Right, "3"),
    ]
}

fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

/// Group files by their stamp prefix.
fn by_prefix(files: &[PathBuf]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for file in files {
        let name = file_name(file);
        let (prefix, slot) = name.rsplit_once('_').unwrap();
        groups
            .entry(prefix.to_string())
            .or_default()
            .push(slot.to_string());
    }
    groups
}

#[test]
fn test_four_cameras_three_segments_share_prefix() {
    let h = Harness::new(
        four_slots(),
        BackendPolicy::Software,
        timings(Duration::from_millis(400)),
    );
    h.open(4);

    let started = h.start(run_id());
    assert_eq!(started.len(), 4);
    std::thread::sleep(Duration::from_millis(1000));
    let files = h.stop();

    assert_eq!(files.len(), 12, "{:?}", files);
    for file in &files {
        assert!(std::fs::metadata(file).unwrap().len() >= MIN_SEGMENT_BYTES);
    }
    let groups = by_prefix(&files);
    assert_eq!(groups.len(), 3);
    assert!(groups.contains_key(&run_id().stamp()));
    for slots in groups.values() {
        let distinct: BTreeSet<&String> = slots.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    let manifest = read_manifest(&h.dir.path().join(run_id().manifest_name())).unwrap();
    assert!(manifest.is_complete);
    assert_eq!(manifest.segments.len(), 12);
    assert!(manifest
        .segments
        .iter()
        .all(|s| s.status == SegmentStatus::Complete));
    assert!(!h.coordinator.is_recording());
}

#[test]
fn test_barrier_timeout_starts_configured_subset() {
    let slots = vec![
        SlotConfig::new(Front, "0"),
        SlotConfig::new(Back, "1"),
        SlotConfig::new(Left, "2"),
    ];
    let h = Harness::new(
        slots,
        BackendPolicy::Software,
        timings(Duration::from_secs(30)),
    );
    h.open(3);
    h.provider.set_never_configure("2", true);

    let requested = Instant::now();
    let started = h.start(run_id());
    let elapsed = requested.elapsed();
    assert_eq!(started, vec![Front, Back]);
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);

    std::thread::sleep(Duration::from_millis(200));
    let files = h.stop();
    let names: Vec<String> = files.iter().map(|f| file_name(f)).collect();
    assert_eq!(names.len(), 2, "{:?}", names);
    assert!(names.iter().all(|n| !n.ends_with("_left.mp4")));
}

#[test]
fn test_late_camera_joins_after_timeout() {
    let slots = vec![SlotConfig::new(Front, "0"), SlotConfig::new(Back, "1")];
    let h = Harness::new(
        slots,
        BackendPolicy::Software,
        timings(Duration::from_secs(30)),
    );
    h.open(2);
    h.provider.set_never_configure("1", true);

    assert_eq!(h.start(run_id()), vec![Front]);
    h.provider.set_never_configure("1", false);
    h.coordinator.session(Back).unwrap().reconfigure();

    let joined = h.wait_for(|e| matches!(e, RecorderEvent::RecordingJoined { .. }));
    assert_eq!(joined, RecorderEvent::RecordingJoined { slot: Back });

    std::thread::sleep(Duration::from_millis(200));
    let files = h.stop();
    assert_eq!(files.len(), 2, "{:?}", files);
}

#[test]
fn test_record_configure_failure_excludes_camera() {
    let slots = vec![SlotConfig::new(Front, "0"), SlotConfig::new(Back, "1")];
    let mut slow_barrier = timings(Duration::from_secs(30));
    slow_barrier.barrier.timeout = Duration::from_secs(5);
    let h = Harness::new(slots, BackendPolicy::Software, slow_barrier);
    h.open(2);
    h.provider.set_fail_record_configure("1", true);

    let requested = Instant::now();
    assert_eq!(h.start(run_id()), vec![Front]);
    assert!(requested.elapsed() < Duration::from_secs(3));

    // The excluded camera falls back to preview-only.
    let back = h.coordinator.session(Back).unwrap();
    wait_until(|| back.state() == CameraSessionState::Previewing && !back.has_record_target());

    std::thread::sleep(Duration::from_millis(200));
    let files = h.stop();
    assert_eq!(files.len(), 1);
    assert!(file_name(&files[0]).ends_with("_front.mp4"));
}

#[test]
fn test_no_configured_camera_reports_error() {
    let h = Harness::new(
        vec![SlotConfig::new(Front, "0")],
        BackendPolicy::Hardware,
        timings(Duration::from_secs(30)),
    );
    h.open(1);
    h.provider.set_fail_record_configure("0", true);

    assert!(h.coordinator.start_recording(run_id()));
    let events = h.collect_until(|e| matches!(e, RecorderEvent::RecordingError { .. }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RecorderEvent::RecordingStarted { .. })));
    assert_eq!(h.coordinator.current_run(), None);

    // Releasing the failed run leaves the coordinator ready for another one.
    h.provider.set_fail_record_configure("0", false);
    let next = RunId::parse("20240601_130000").unwrap();
    assert_eq!(h.start(next), vec![Front]);
    h.stop();
}

#[test]
fn test_software_rotation_failure_recovers() {
    let h = Harness::new(
        vec![SlotConfig::new(Front, "0")],
        BackendPolicy::Software,
        timings(Duration::from_millis(500)),
    );
    h.open(1);
    h.start(run_id());
    h.encoders.fail_next_encoder_creations(1);

    let events = h.collect_until(|e| matches!(e, RecorderEvent::PipelineRecovered { .. }));
    assert!(events.iter().any(|e| matches!(
        e,
        RecorderEvent::PipelineError {
            recovering: true,
            ..
        }
    )));
    assert_eq!(
        events.last(),
        Some(&RecorderEvent::PipelineRecovered {
            slot: Front,
            attempts: 1
        })
    );

    // The regular cadence continues after the recovery.
    h.wait_for(|e| matches!(e, RecorderEvent::SegmentSwitched { .. }));
    std::thread::sleep(Duration::from_millis(150));
    let files = h.stop();
    assert!(files.len() >= 3, "{:?}", files);
    for file in &files {
        assert!(std::fs::metadata(file).unwrap().len() >= MIN_SEGMENT_BYTES);
    }
}

#[test]
fn test_hardware_rotation_reconfigures_sessions() {
    let slots = vec![SlotConfig::new(Front, "0"), SlotConfig::new(Back, "1")];
    let h = Harness::new(
        slots,
        BackendPolicy::Hardware,
        timings(Duration::from_millis(400)),
    );
    h.open(2);
    let configures_before = h.provider.configure_count("0");

    assert_eq!(h.start(run_id()), vec![Front, Back]);
    let mut switched = BTreeSet::new();
    while switched.len() < 2 {
        if let RecorderEvent::SegmentSwitched {
            slot, new_index, ..
        } = h.wait_for(|e| matches!(e, RecorderEvent::SegmentSwitched { .. }))
        {
            assert_eq!(new_index, 1);
            switched.insert(slot);
        }
    }
    assert!(h.provider.configure_count("0") >= configures_before + 2);

    std::thread::sleep(Duration::from_millis(150));
    let files = h.stop();
    let groups = by_prefix(&files);
    assert_eq!(groups.len(), 2, "{:?}", files);
    for file in &files {
        assert!(std::fs::metadata(file).unwrap().len() >= MIN_SEGMENT_BYTES);
    }
}

#[test]
fn test_ffmpeg_writer_records_through_hardware_path() {
    let Ok(writers) = FfmpegWriterFactory::locate(None) else {
        eprintln!("ffmpeg not available, skipping");
        return;
    };
    let mut timings = timings(Duration::from_secs(30));
    // Muxer output is bursty; keep the growth watchdog out of the way
    timings.pipeline.size_check_interval = Duration::from_secs(5);
    let h = Harness::with_writers(
        vec![SlotConfig::new(Front, "0")],
        BackendPolicy::Hardware,
        timings,
        Arc::new(writers),
    );
    assert_eq!(h.coordinator.pipeline_kind(), PipelineKind::Hardware);
    h.open(1);

    assert_eq!(h.start(run_id()), vec![Front]);
    std::thread::sleep(Duration::from_millis(1500));
    h.coordinator.stop_recording();
    let seen = h.collect_until(|e| matches!(e, RecorderEvent::RecordingStopped { .. }));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, RecorderEvent::PipelineError { .. })),
        "{:?}",
        seen
    );

    let manifest = read_manifest(&h.dir.path().join(run_id().manifest_name())).unwrap();
    assert!(manifest.is_complete);
    assert_eq!(manifest.segments.len(), 1);
    let segment = &manifest.segments[0];
    assert_eq!(segment.slot, Front);
    assert_ne!(segment.status, SegmentStatus::InProgress);
    if segment.status == SegmentStatus::Complete {
        assert!(segment.path.exists());
    }
}

#[test]
fn test_shared_device_closes_once() {
    let slots = vec![SlotConfig::new(Front, "7"), SlotConfig::new(Back, "7")];
    let h = Harness::new(
        slots,
        BackendPolicy::Hardware,
        timings(Duration::from_secs(30)),
    );
    h.open(1);
    assert_eq!(h.provider.open_count("7"), 1);
    assert_eq!(h.coordinator.mirror_source(Back), Some(Front));
    assert_eq!(h.coordinator.connected_count(), 1);

    std::thread::sleep(Duration::from_millis(100));
    let mirror = h.coordinator.preview_surface(Back).unwrap();
    assert!(mirror.frames_queued() > 0);

    let secondary = h.coordinator.session(Back).unwrap();
    secondary.close();
    secondary.flush(WAIT).unwrap();
    assert_eq!(h.provider.close_count("7"), 0);
    assert!(h.provider.is_open("7"));

    h.coordinator.close_all();
    h.wait_for(|e| matches!(e, RecorderEvent::CameraClosed { slot: Front }));
    assert_eq!(h.provider.close_count("7"), 1);
    assert!(!h.provider.is_open("7"));
}

#[test]
fn test_stop_is_idempotent() {
    let h = Harness::new(
        vec![SlotConfig::new(Front, "0")],
        BackendPolicy::Software,
        timings(Duration::from_secs(30)),
    );
    h.open(1);
    h.coordinator.stop_recording();

    h.start(run_id());
    assert!(!h.coordinator.start_recording(run_id()));
    std::thread::sleep(Duration::from_millis(200));
    h.coordinator.stop_recording();
    let files = h.stop();
    assert_eq!(files.len(), 1);

    std::thread::sleep(Duration::from_millis(300));
    assert!(h
        .events
        .try_iter()
        .all(|e| !matches!(e, RecorderEvent::RecordingStopped { .. })));
    assert!(!h.coordinator.is_recording());
    h.coordinator.stop_recording();
}

#[test]
fn test_stop_while_barrier_pending_cancels_start() {
    let slots = vec![SlotConfig::new(Front, "0"), SlotConfig::new(Back, "1")];
    let h = Harness::new(
        slots,
        BackendPolicy::Software,
        timings(Duration::from_secs(30)),
    );
    h.open(2);
    h.provider.set_never_configure("1", true);

    assert!(h.coordinator.start_recording(run_id()));
    h.coordinator.stop_recording();
    let seen = h.collect_until(|e| matches!(e, RecorderEvent::RecordingStopped { .. }));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, RecorderEvent::RecordingStarted { .. })),
        "{:?}",
        seen
    );
    assert_eq!(
        seen.last(),
        Some(&RecorderEvent::RecordingStopped { files: Vec::new() })
    );
    assert!(!h
        .coordinator
        .inner
        .barrier_timer
        .is_armed(&h.coordinator.inner.clock));

    // Well past the barrier timeout: the cancelled start never fires
    std::thread::sleep(Duration::from_millis(700));
    let late: Vec<RecorderEvent> = h.events.try_iter().collect();
    assert!(
        late.iter().all(|e| !matches!(
            e,
            RecorderEvent::RecordingStarted { .. } | RecorderEvent::CorruptedFilesDeleted { .. }
        )),
        "{:?}",
        late
    );
    assert!(!h.coordinator.is_recording());
    let manifest = read_manifest(&h.dir.path().join(run_id().manifest_name())).unwrap();
    assert!(manifest.is_complete);
    assert!(manifest.segments.is_empty(), "{:?}", manifest.segments);
    let leftovers = std::fs::read_dir(h.dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "mp4"))
        .count();
    assert_eq!(leftovers, 0);

    h.provider.set_never_configure("1", false);
    h.coordinator.session(Back).unwrap().reconfigure();
    h.wait_for(|e| {
        matches!(
            e,
            RecorderEvent::CameraConfigured {
                slot: Back,
                recording: false
            }
        )
    });

    let second = RunId::parse("20240601_120500").unwrap();
    assert_eq!(h.start(second), vec![Front, Back]);
    std::thread::sleep(Duration::from_millis(200));
    let files = h.stop();
    assert_eq!(files.len(), 2, "{:?}", files);
    assert!(files
        .iter()
        .all(|f| file_name(f).starts_with(&second.stamp())));
}

#[test]
fn test_start_rejected_without_connected_camera() {
    let h = Harness::new(
        vec![SlotConfig::new(Front, "0")],
        BackendPolicy::Software,
        timings(Duration::from_secs(30)),
    );
    assert!(!h.coordinator.start_recording(run_id()));
    assert!(!h.coordinator.has_connected_cameras());
}

#[test]
fn test_snapshot_burst_shares_stamp() {
    let slots = vec![SlotConfig::new(Front, "0"), SlotConfig::new(Back, "1")];
    let h = Harness::new(
        slots,
        BackendPolicy::Hardware,
        timings(Duration::from_secs(30)),
    );
    h.open(2);

    let planned = h.coordinator.take_snapshot(run_id()).unwrap();
    assert_eq!(planned.len(), 2);
    let mut taken = BTreeSet::new();
    while taken.len() < 2 {
        if let RecorderEvent::SnapshotTaken { path, error, .. } =
            h.wait_for(|e| matches!(e, RecorderEvent::SnapshotTaken { .. }))
        {
            assert_eq!(error, None);
            assert!(path.exists());
            taken.insert(file_name(&path));
        }
    }
    let expected: BTreeSet<String> = [
        "20240601_120000_front.jpg".to_string(),
        "20240601_120000_back.jpg".to_string(),
    ]
    .into_iter()
    .collect();
    assert_eq!(taken, expected);
}

#[test]
fn test_check_and_repair_reopens_failed_camera() {
    let slots = vec![SlotConfig::new(Front, "0"), SlotConfig::new(Back, "1")];
    let h = Harness::new(
        slots,
        BackendPolicy::Hardware,
        timings(Duration::from_secs(30)),
    );
    h.open(2);

    h.provider.inject_error("1", CameraErrorCode::Disabled);
    let error = h.wait_for(|e| matches!(e, RecorderEvent::CameraError { .. }));
    assert_eq!(
        error,
        RecorderEvent::CameraError {
            slot: Back,
            code: CameraErrorCode::Disabled.code(),
            message: CameraErrorCode::Disabled.description().to_string(),
            reconnecting: false,
        }
    );
    assert_eq!(h.coordinator.connected_count(), 1);

    assert_eq!(h.coordinator.check_and_repair(), 1);
    h.wait_for(|e| matches!(e, RecorderEvent::CameraOpened { slot: Back }));
    h.wait_for(|e| matches!(e, RecorderEvent::CameraConfigured { slot: Back, .. }));
    assert_eq!(h.coordinator.connected_count(), 2);
    assert_eq!(h.coordinator.check_and_repair(), 0);
}

#[test]
fn test_open_limit_skips_extra_cameras() {
    let dir = tempfile::tempdir().unwrap();
    let provider = SimCameraProvider::new();
    for id in ["0", "1", "2", "3"] {
        provider.add_device(id, vec![SENSOR]);
    }
    let config = RecorderConfig {
        output_dir: dir.path().to_path_buf(),
        car_model: CarModel::Custom,
        camera_count: 4,
        slots: four_slots(),
        max_open_cameras: 2,
        ..RecorderConfig::default()
    };
    let backends = PipelineBackends {
        encoders: Arc::new(SimEncoderFactory::new()),
        writers: Arc::new(SimWriterFactory::new()),
    };
    let coordinator = MultiCameraCoordinator::new(
        config,
        Arc::new(provider.clone()),
        backends,
        timings(Duration::from_secs(30)),
    )
    .unwrap();
    coordinator.open_all();
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(provider.open_attempts("0"), 1);
    assert_eq!(provider.open_attempts("1"), 1);
    assert_eq!(provider.open_attempts("2"), 0);
    assert_eq!(provider.open_attempts("3"), 0);
    coordinator.shutdown();
}
