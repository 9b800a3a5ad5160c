//! Simulated direct writer for the hardware pipeline.
//!
//! While started, a pump thread latches frames from the input surface and
//! appends one bitrate-sized record per frame to the output file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{RecorderError, RecorderResult};
use crate::media::{MediaWriter, Surface, WriterConfig, WriterFactory};

#[derive(Default)]
struct WriterFaults {
    fail_creations: AtomicU32,
    fail_starts: AtomicU32,
    created: AtomicU32,
}

/// Factory for [`SimWriter`]s with fault injection.
#[derive(Clone, Default)]
pub struct SimWriterFactory {
    faults: Arc<WriterFaults>,
}

impl SimWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_creations(&self, count: u32) {
        self.faults.fail_creations.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.faults.fail_starts.store(count, Ordering::SeqCst);
    }

    pub fn writers_created(&self) -> u32 {
        self.faults.created.load(Ordering::SeqCst)
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl WriterFactory for SimWriterFactory {
    fn create_writer(&self, config: &WriterConfig) -> RecorderResult<Box<dyn MediaWriter>> {
        if take_fault(&self.faults.fail_creations) {
            return Err(RecorderError::WriterError(
                "simulated writer creation failure".to_string(),
            ));
        }
        self.faults.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimWriter {
            config: config.clone(),
            faults: Arc::clone(&self.faults),
            path: None,
            input: None,
            running: Arc::new(AtomicBool::new(false)),
            pump: None,
        }))
    }
}

pub struct SimWriter {
    config: WriterConfig,
    faults: Arc<WriterFaults>,
    path: Option<PathBuf>,
    input: Option<Surface>,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<RecorderResult<()>>>,
}

impl SimWriter {
    fn record_len(&self) -> usize {
        (self.config.bitrate as usize / 8 / self.config.frame_rate.max(1) as usize).max(16)
    }
}

impl MediaWriter for SimWriter {
    fn prepare(&mut self, path: &Path) -> RecorderResult<Surface> {
        if self.input.is_some() {
            return Err(RecorderError::InvalidState(
                "writer already prepared".to_string(),
            ));
        }
        File::create(path)?;
        let surface = Surface::new("sim-writer-input");
        self.path = Some(path.to_path_buf());
        self.input = Some(surface.clone());
        Ok(surface)
    }

    fn start(&mut self) -> RecorderResult<()> {
        let (Some(path), Some(input)) = (self.path.clone(), self.input.clone()) else {
            return Err(RecorderError::InvalidState(
                "writer started before prepare".to_string(),
            ));
        };
        if take_fault(&self.faults.fail_starts) {
            return Err(RecorderError::WriterError(
                "simulated writer start failure".to_string(),
            ));
        }

        let (tx, rx) = flume::bounded::<()>(1);
        input.set_frame_listener(move || {
            let _ = tx.try_send(());
        });

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let record_len = self.record_len();
        let pump = std::thread::Builder::new()
            .name("sim-writer".to_string())
            .spawn(move || -> RecorderResult<()> {
                let mut file = OpenOptions::new().append(true).open(&path)?;
                while running.load(Ordering::SeqCst) {
                    if rx.recv_timeout(Duration::from_millis(20)).is_err() {
                        continue;
                    }
                    let Some(frame) = input.acquire_latest() else {
                        continue;
                    };
                    let record: Vec<u8> = frame.data.iter().copied().cycle().take(record_len).collect();
                    file.write_all(&frame.timestamp_ns.to_le_bytes())?;
                    file.write_all(&record)?;
                }
                file.sync_all()?;
                Ok(())
            })
            .map_err(|e| RecorderError::WriterError(format!("Failed to spawn writer pump: {}", e)))?;
        self.pump = Some(pump);
        Ok(())
    }

    fn stop(&mut self) -> RecorderResult<()> {
        let Some(pump) = self.pump.take() else {
            return Err(RecorderError::InvalidState(
                "writer stopped before start".to_string(),
            ));
        };
        self.running.store(false, Ordering::SeqCst);
        pump.join()
            .map_err(|_| RecorderError::WriterError("writer pump panicked".to_string()))?
    }

    fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        if let Some(input) = self.input.take() {
            input.release();
        }
    }
}

impl Drop for SimWriter {
    fn drop(&mut self) {
        self.release();
    }
}
