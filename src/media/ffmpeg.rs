//! FFmpeg-backed [`MediaWriter`] for hosts without a platform encoder.
//!
//! Each writer spawns one ffmpeg process that reads raw RGBA frames from
//! stdin and writes an H.264 MP4. Frames are pumped from the writer's input
//! surface by a dedicated thread.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ChildStdin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ffmpeg_sidecar::child::FfmpegChild;
use ffmpeg_sidecar::command::FfmpegCommand;

use super::frame::{swap_red_blue, PixelFormat};
use super::surface::Surface;
use super::writer::{MediaWriter, WriterConfig, WriterFactory};
use crate::error::{RecorderError, RecorderResult};

/// Overrides every other ffmpeg location when set.
pub const FFMPEG_ENV: &str = "MULTICAM_FFMPEG";

const FFMPEG_BINARY: &str = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };

/// Where ffmpeg is looked for, most specific first: an explicit path, the
/// [`FFMPEG_ENV`] override, the sidecar download location, then every `PATH`
/// entry that holds a binary.
pub fn ffmpeg_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = explicit.map(Path::to_path_buf).into_iter().collect();
    if let Some(path) = std::env::var_os(FFMPEG_ENV).filter(|p| !p.is_empty()) {
        candidates.push(PathBuf::from(path));
    }
    candidates.push(ffmpeg_sidecar::paths::ffmpeg_path());
    if let Some(path_var) = std::env::var_os("PATH") {
        candidates.extend(
            std::env::split_paths(&path_var)
                .map(|dir| dir.join(FFMPEG_BINARY))
                .filter(|path| path.is_file()),
        );
    }
    candidates.dedup();
    candidates
}

/// First candidate that answers `-version`, with the version it reported.
pub fn locate_ffmpeg(explicit: Option<&Path>) -> Option<(PathBuf, String)> {
    for candidate in ffmpeg_candidates(explicit) {
        match ffmpeg_sidecar::version::ffmpeg_version_with_path(&candidate) {
            Ok(version) => {
                log::info!("[FFMPEG] Using {} ({})", candidate.display(), version);
                return Some((candidate, version));
            },
            Err(e) => log::debug!("[FFMPEG] Skipping {}: {}", candidate.display(), e),
        }
    }
    log::warn!("[FFMPEG] No working ffmpeg found");
    None
}

/// Build the ffmpeg argument list for one segment.
pub fn writer_args(config: &WriterConfig, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostats".into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgba".into(),
        "-s".into(),
        config.size.to_string(),
        "-framerate".into(),
        config.frame_rate.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-b:v".into(),
        config.bitrate.to_string(),
        "-g".into(),
        config.frame_rate.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-movflags".into(),
        "+faststart".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Creates [`FfmpegWriter`]s bound to one resolved ffmpeg binary.
pub struct FfmpegWriterFactory {
    ffmpeg_path: PathBuf,
}

impl FfmpegWriterFactory {
    /// Resolve a working ffmpeg, preferring `explicit` when given.
    pub fn locate(explicit: Option<&Path>) -> RecorderResult<Self> {
        locate_ffmpeg(explicit)
            .map(|(path, _)| Self::with_path(path))
            .ok_or(RecorderError::FfmpegNotFound)
    }

    pub fn with_path(ffmpeg_path: PathBuf) -> Self {
        Self { ffmpeg_path }
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn create_writer(&self, config: &WriterConfig) -> RecorderResult<Box<dyn MediaWriter>> {
        Ok(Box::new(FfmpegWriter::new(
            self.ffmpeg_path.clone(),
            config.clone(),
        )))
    }
}

/// Writer backed by one ffmpeg child process.
pub struct FfmpegWriter {
    ffmpeg_path: PathBuf,
    config: WriterConfig,
    output: Option<PathBuf>,
    surface: Option<Surface>,
    child: Option<FfmpegChild>,
    pump: Option<JoinHandle<u64>>,
    stop_signal: Arc<AtomicBool>,
}

impl FfmpegWriter {
    pub fn new(ffmpeg_path: PathBuf, config: WriterConfig) -> Self {
        Self {
            ffmpeg_path,
            config,
            output: None,
            surface: None,
            child: None,
            pump: None,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    fn join_pump(&mut self) {
        if let Some(surface) = &self.surface {
            surface.clear_frame_listener();
        }
        if let Some(pump) = self.pump.take() {
            match pump.join() {
                Ok(frames) => log::debug!("[FFMPEG] Pump wrote {} frames", frames),
                Err(_) => log::warn!("[FFMPEG] Pump thread panicked"),
            }
        }
    }
}

impl MediaWriter for FfmpegWriter {
    fn prepare(&mut self, path: &Path) -> RecorderResult<Surface> {
        if self.output.is_some() {
            return Err(RecorderError::InvalidState(
                "ffmpeg writer already prepared".into(),
            ));
        }
        let surface = Surface::new(format!("ffmpeg-input:{}", path.display()));
        self.output = Some(path.to_path_buf());
        self.surface = Some(surface.clone());
        Ok(surface)
    }

    fn start(&mut self) -> RecorderResult<()> {
        let output = self
            .output
            .clone()
            .ok_or_else(|| RecorderError::InvalidState("ffmpeg writer not prepared".into()))?;
        let surface = self
            .surface
            .clone()
            .ok_or_else(|| RecorderError::InvalidState("ffmpeg writer not prepared".into()))?;

        let mut child = FfmpegCommand::new_with_path(&self.ffmpeg_path)
            .args(writer_args(&self.config, &output))
            .spawn()
            .map_err(|e| RecorderError::WriterError(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = child
            .take_stdin()
            .ok_or_else(|| RecorderError::WriterError("Failed to get FFmpeg stdin".into()))?;

        let (notify_tx, notify_rx) = flume::bounded::<()>(1);
        surface.set_frame_listener(move || {
            let _ = notify_tx.try_send(());
        });

        let stop_signal = Arc::clone(&self.stop_signal);
        let size = self.config.size;
        let pump = match std::thread::Builder::new()
            .name("ffmpeg-writer".to_string())
            .spawn(move || pump_frames(surface, notify_rx, stdin, size, stop_signal))
        {
            Ok(pump) => pump,
            Err(e) => {
                if let Err(kill) = child.kill() {
                    log::debug!("[FFMPEG] Kill after failed start: {}", kill);
                }
                return Err(RecorderError::WriterError(format!(
                    "Failed to spawn writer thread: {}",
                    e
                )));
            },
        };

        self.child = Some(child);
        self.pump = Some(pump);
        log::info!("[FFMPEG] Writer started: {}", output.display());
        Ok(())
    }

    fn stop(&mut self) -> RecorderResult<()> {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.join_pump();

        let mut child = self
            .child
            .take()
            .ok_or_else(|| RecorderError::InvalidState("ffmpeg writer not started".into()))?;
        let status = child
            .wait()
            .map_err(|e| RecorderError::WriterError(format!("FFmpeg wait failed: {}", e)))?;
        if !status.success() {
            return Err(RecorderError::WriterError(format!(
                "FFmpeg exited with {}",
                status
            )));
        }
        Ok(())
    }

    fn release(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.join_pump();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::debug!("[FFMPEG] Kill on release: {}", e);
            }
            if let Err(e) = child.wait() {
                log::debug!("[FFMPEG] Wait on release: {}", e);
            }
        }
        if let Some(surface) = self.surface.take() {
            surface.release();
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        self.release();
    }
}

fn pump_frames(
    surface: Surface,
    notify_rx: flume::Receiver<()>,
    mut stdin: ChildStdin,
    size: crate::media::FrameSize,
    stop_signal: Arc<AtomicBool>,
) -> u64 {
    let mut frames = 0u64;
    let mut size_warned = false;

    loop {
        match notify_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {},
            Err(flume::RecvTimeoutError::Timeout) => {
                if stop_signal.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            },
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
        if stop_signal.load(Ordering::SeqCst) {
            break;
        }

        let Some(frame) = surface.acquire_latest() else {
            continue;
        };
        if frame.size != size || !frame.is_well_formed() {
            if !size_warned {
                log::warn!(
                    "[FFMPEG] Dropping {} frame, writer expects {}",
                    frame.size,
                    size
                );
                size_warned = true;
            }
            continue;
        }

        let result = match frame.format {
            PixelFormat::Rgba8 => stdin.write_all(&frame.data),
            PixelFormat::Bgra8 => {
                let mut buf = frame.data.to_vec();
                swap_red_blue(&mut buf);
                stdin.write_all(&buf)
            },
        };
        if let Err(e) = result {
            log::warn!("[FFMPEG] Write to ffmpeg failed: {}", e);
            break;
        }
        frames += 1;
    }

    let _ = stdin.flush();
    frames
}
