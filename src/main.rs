//! Dry run of the full recording flow on simulated cameras.
//!
//! `multicam-recorder [--ffmpeg[=PATH]] [config.json] [seconds]`
//!
//! With `--ffmpeg` the segments are encoded to real H.264 files by an ffmpeg
//! child process per camera instead of the in-process simulated writer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use multicam_recorder::config::{BackendPolicy, RecorderConfig};
use multicam_recorder::media::ffmpeg::FfmpegWriterFactory;
use multicam_recorder::media::{FrameSize, WriterFactory};
use multicam_recorder::pipeline::{PipelineBackends, RunId};
use multicam_recorder::sim::{SimCameraProvider, SimEncoderFactory, SimWriterFactory};
use multicam_recorder::{
    init_logging, CoordinatorTimings, MultiCameraCoordinator, RecorderEvent, RecorderResult,
};

const DEFAULT_SECONDS: u64 = 10;
const SETTLE: Duration = Duration::from_secs(2);

fn main() {
    init_logging();
    if let Err(e) = run() {
        log::error!("[MAIN] {}", e);
        std::process::exit(1);
    }
}

/// Parsed command line.
#[derive(Debug, Default, PartialEq)]
struct Args {
    /// `Some(None)` for a bare `--ffmpeg`, `Some(Some(path))` for `--ffmpeg=PATH`.
    ffmpeg: Option<Option<PathBuf>>,
    config: Option<PathBuf>,
    seconds: Option<u64>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Args {
    let mut parsed = Args::default();
    let mut positional = Vec::new();
    for arg in args {
        if arg == "--ffmpeg" {
            parsed.ffmpeg = Some(None);
        } else if let Some(path) = arg.strip_prefix("--ffmpeg=") {
            parsed.ffmpeg = Some(Some(PathBuf::from(path)));
        } else {
            positional.push(arg);
        }
    }
    let mut positional = positional.into_iter();
    parsed.config = positional.next().map(PathBuf::from);
    parsed.seconds = positional.next().and_then(|s| s.parse().ok());
    parsed
}

/// Writer backend for the hardware path. ffmpeg forces that path on.
fn writer_backend(
    ffmpeg: Option<&Option<PathBuf>>,
    config: &mut RecorderConfig,
) -> RecorderResult<Arc<dyn WriterFactory>> {
    match ffmpeg {
        Some(explicit) => {
            let factory = FfmpegWriterFactory::locate(explicit.as_deref())?;
            config.backend = BackendPolicy::Hardware;
            Ok(Arc::new(factory))
        },
        None => Ok(Arc::new(SimWriterFactory::new())),
    }
}

fn run() -> RecorderResult<()> {
    let args = parse_args(std::env::args().skip(1));
    let mut config = match &args.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    let seconds = args.seconds.unwrap_or(DEFAULT_SECONDS);
    let writers = writer_backend(args.ffmpeg.as_ref(), &mut config)?;

    let provider = SimCameraProvider::new();
    for slot in config.camera_slots() {
        provider.add_device(
            &slot.device_id,
            vec![
                FrameSize::new(640, 480),
                FrameSize::new(1280, 720),
                FrameSize::new(1280, 800),
                FrameSize::new(1920, 1080),
            ],
        );
    }
    let backends = PipelineBackends {
        encoders: Arc::new(SimEncoderFactory::new()),
        writers,
    };

    let timings = CoordinatorTimings::for_config(&config);
    let coordinator =
        MultiCameraCoordinator::new(config, Arc::new(provider), backends, timings)?;
    let events = coordinator.subscribe();

    coordinator.open_all();
    let deadline = Instant::now() + SETTLE;
    while coordinator.connected_count() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }

    let run_id = RunId::now();
    if !coordinator.start_recording(run_id) {
        coordinator.shutdown();
        return Err(multicam_recorder::RecorderError::InvalidState(
            "recording did not start".to_string(),
        ));
    }
    println!("Recording run {} for {}s", run_id, seconds);
    std::thread::sleep(Duration::from_secs(seconds));

    let snapshots = coordinator.take_snapshot(RunId::now())?;
    println!("Snapshot burst: {} camera(s)", snapshots.len());
    coordinator.stop_recording();

    let deadline = Instant::now() + Duration::from_secs(seconds.max(10));
    let mut files = Vec::new();
    while let Ok(event) = events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        match event {
            RecorderEvent::RecordingStopped { files: stopped } => {
                files = stopped;
                break;
            },
            RecorderEvent::CorruptedFilesDeleted { slot, files } => {
                println!("{}: deleted {:?}", slot, files);
            },
            _ => {},
        }
    }

    coordinator.shutdown();
    println!("{} file(s):", files.len());
    for file in files {
        println!("  {}", file.display());
    }
    Ok(())
}
