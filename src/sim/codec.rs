//! Simulated encoder and container muxer for the software pipeline.
//!
//! The encoder turns each latched input frame into one sample whose size
//! follows the configured bitrate, so file-size diagnostics behave like the
//! real thing. The muxer writes a small length-prefixed container that
//! [`read_container`] can parse back in tests.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{RecorderError, RecorderResult};
use crate::media::{
    ContainerMuxer, EncodedSample, EncoderFactory, EncoderFormat, EncoderOutput, FrameSize,
    Surface, TrackFormat, VideoEncoder,
};

const CONTAINER_MAGIC: &[u8; 4] = b"SIMV";

#[derive(Default)]
struct CodecFaults {
    fail_encoder_creations: AtomicU32,
    fail_muxer_creations: AtomicU32,
    stall_output: AtomicBool,
    encoders_created: AtomicU32,
    muxers_created: AtomicU32,
}

/// Factory for [`SimEncoder`]s and [`SimMuxer`]s with fault injection.
#[derive(Clone, Default)]
pub struct SimEncoderFactory {
    faults: Arc<CodecFaults>,
}

impl SimEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` encoder creations fail.
    pub fn fail_next_encoder_creations(&self, count: u32) {
        self.faults
            .fail_encoder_creations
            .store(count, Ordering::SeqCst);
    }

    /// The next `count` muxer creations fail.
    pub fn fail_next_muxer_creations(&self, count: u32) {
        self.faults.fail_muxer_creations.store(count, Ordering::SeqCst);
    }

    /// Encoders accept frames but never produce output while set.
    pub fn set_stall_output(&self, stall: bool) {
        self.faults.stall_output.store(stall, Ordering::SeqCst);
    }

    pub fn encoders_created(&self) -> u32 {
        self.faults.encoders_created.load(Ordering::SeqCst)
    }

    pub fn muxers_created(&self) -> u32 {
        self.faults.muxers_created.load(Ordering::SeqCst)
    }
}

/// Decrement a fault counter; true when this call should fail.
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl EncoderFactory for SimEncoderFactory {
    fn create_encoder(&self, format: &EncoderFormat) -> RecorderResult<Box<dyn VideoEncoder>> {
        if take_fault(&self.faults.fail_encoder_creations) {
            return Err(RecorderError::EncoderError(
                "simulated encoder creation failure".to_string(),
            ));
        }
        self.faults.encoders_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimEncoder::new(format.clone(), Arc::clone(&self.faults))))
    }

    fn create_muxer(&self, path: &Path) -> RecorderResult<Box<dyn ContainerMuxer>> {
        if take_fault(&self.faults.fail_muxer_creations) {
            return Err(RecorderError::WriterError(
                "simulated muxer creation failure".to_string(),
            ));
        }
        self.faults.muxers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimMuxer::create(path)?))
    }
}

/// Encoder with a surface input.
pub struct SimEncoder {
    format: EncoderFormat,
    faults: Arc<CodecFaults>,
    input: Surface,
    frame_ready: flume::Receiver<()>,
    started: bool,
    format_sent: bool,
    end_of_input: bool,
    held: Option<EncodedSample>,
    frames_encoded: u64,
}

impl SimEncoder {
    fn new(format: EncoderFormat, faults: Arc<CodecFaults>) -> Self {
        let input = Surface::new("sim-encoder-input");
        let (tx, rx) = flume::bounded(1);
        input.set_frame_listener(move || {
            let _ = tx.try_send(());
        });
        Self {
            format,
            faults,
            input,
            frame_ready: rx,
            started: false,
            format_sent: false,
            end_of_input: false,
            held: None,
            frames_encoded: 0,
        }
    }

    fn sample_len(&self) -> usize {
        let fps = self.format.frame_rate.max(1) as usize;
        (self.format.bitrate as usize / 8 / fps).max(16)
    }

    fn encode(&mut self, pixels: &[u8]) -> EncodedSample {
        let len = self.sample_len();
        let data = if pixels.is_empty() {
            vec![0u8; len]
        } else {
            pixels.iter().copied().cycle().take(len).collect()
        };
        let gop = (self.format.frame_rate * self.format.i_frame_interval_secs).max(1) as u64;
        let key_frame = self.frames_encoded % gop == 0;
        self.frames_encoded += 1;
        EncodedSample {
            data,
            key_frame,
            codec_config: false,
        }
    }
}

impl VideoEncoder for SimEncoder {
    fn input_surface(&self) -> Surface {
        self.input.clone()
    }

    fn start(&mut self) -> RecorderResult<()> {
        if self.input.is_released() {
            return Err(RecorderError::Released("encoder"));
        }
        self.started = true;
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> RecorderResult<EncoderOutput> {
        if !self.started {
            return Err(RecorderError::EncoderError("encoder not started".to_string()));
        }
        if let Some(sample) = self.held.take() {
            return Ok(EncoderOutput::Sample(sample));
        }
        if self.end_of_input {
            return Ok(EncoderOutput::EndOfStream);
        }
        if self.faults.stall_output.load(Ordering::SeqCst) {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            self.input.acquire_latest();
            return Ok(EncoderOutput::TryAgainLater);
        }

        let frame = match self.input.acquire_latest() {
            Some(frame) => frame,
            None => {
                if self.frame_ready.recv_timeout(timeout).is_err() {
                    return Ok(EncoderOutput::TryAgainLater);
                }
                match self.input.acquire_latest() {
                    Some(frame) => frame,
                    None => return Ok(EncoderOutput::TryAgainLater),
                }
            },
        };

        let sample = self.encode(&frame.data);
        if !self.format_sent {
            self.format_sent = true;
            self.held = Some(sample);
            return Ok(EncoderOutput::FormatChanged(TrackFormat {
                mime: self.format.mime.to_string(),
                size: self.format.size,
                codec_config: vec![0, 0, 0, 1, 0x67, 0x42],
            }));
        }
        Ok(EncoderOutput::Sample(sample))
    }

    fn signal_end_of_input(&mut self) -> RecorderResult<()> {
        if !self.started {
            return Err(RecorderError::EncoderError("encoder not started".to_string()));
        }
        self.end_of_input = true;
        Ok(())
    }

    fn stop(&mut self) -> RecorderResult<()> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.input.release();
    }
}

/// Container writer producing `SIMV` files.
pub struct SimMuxer {
    path: PathBuf,
    file: Option<File>,
    track: Option<TrackFormat>,
    started: bool,
    samples: u64,
}

impl SimMuxer {
    pub fn create(path: &Path) -> RecorderResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            track: None,
            started: false,
            samples: 0,
        })
    }

    fn file(&mut self) -> RecorderResult<&mut File> {
        self.file
            .as_mut()
            .ok_or(RecorderError::Released("muxer"))
    }
}

impl ContainerMuxer for SimMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> RecorderResult<usize> {
        if self.started {
            return Err(RecorderError::WriterError(
                "cannot add a track after start".to_string(),
            ));
        }
        self.track = Some(format.clone());
        Ok(0)
    }

    fn start(&mut self) -> RecorderResult<()> {
        let track = self
            .track
            .clone()
            .ok_or_else(|| RecorderError::WriterError("no track added".to_string()))?;
        let file = self.file()?;
        file.write_all(CONTAINER_MAGIC)?;
        file.write_all(&track.size.width.to_le_bytes())?;
        file.write_all(&track.size.height.to_le_bytes())?;
        file.write_all(&(track.codec_config.len() as u32).to_le_bytes())?;
        file.write_all(&track.codec_config)?;
        self.started = true;
        Ok(())
    }

    fn write_sample(
        &mut self,
        track: usize,
        sample: &EncodedSample,
        pts_us: i64,
    ) -> RecorderResult<()> {
        if !self.started || track != 0 {
            return Err(RecorderError::WriterError(format!(
                "muxer not ready for track {}",
                track
            )));
        }
        let file = self.file()?;
        file.write_all(&(sample.data.len() as u32).to_le_bytes())?;
        file.write_all(&pts_us.to_le_bytes())?;
        file.write_all(&[sample.key_frame as u8])?;
        file.write_all(&sample.data)?;
        self.samples += 1;
        Ok(())
    }

    fn stop(&mut self) -> RecorderResult<()> {
        if !self.started {
            return Err(RecorderError::WriterError(format!(
                "muxer for {} stopped before start",
                self.path.display()
            )));
        }
        self.started = false;
        self.file()?.sync_all()?;
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.file.take();
    }
}

/// Parsed `SIMV` file.
#[derive(Debug, Clone, PartialEq)]
pub struct SimContainer {
    pub size: FrameSize,
    /// (pts_us, key_frame, byte length) per sample.
    pub samples: Vec<(i64, bool, usize)>,
}

impl SimContainer {
    pub fn timestamps(&self) -> Vec<i64> {
        self.samples.iter().map(|(pts, _, _)| *pts).collect()
    }
}

/// Parse a file written by [`SimMuxer`]. A truncated trailing sample is ignored.
pub fn read_container(path: &Path) -> RecorderResult<SimContainer> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut cursor = ByteCursor::new(&bytes);
    if cursor.take(4) != Some(CONTAINER_MAGIC.as_slice()) {
        return Err(RecorderError::WriterError(format!(
            "{} is not a sim container",
            path.display()
        )));
    }
    let header_err = || RecorderError::WriterError("truncated header".to_string());
    let width = cursor.u32().ok_or_else(header_err)?;
    let height = cursor.u32().ok_or_else(header_err)?;
    let config_len = cursor.u32().ok_or_else(header_err)? as usize;
    cursor.take(config_len).ok_or_else(header_err)?;

    let mut samples = Vec::new();
    while let (Some(len), Some(pts), Some(flags)) = (cursor.u32(), cursor.i64(), cursor.take(1)) {
        if cursor.take(len as usize).is_none() {
            break;
        }
        samples.push((pts, flags[0] != 0, len as usize));
    }

    Ok(SimContainer {
        size: FrameSize::new(width, height),
        samples,
    })
}

struct ByteCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let slice = self.bytes.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8)
            .and_then(|b| b.try_into().ok())
            .map(i64::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VideoFrame;

    fn format() -> EncoderFormat {
        EncoderFormat::avc(FrameSize::new(8, 8), 240_000, 30)
    }

    #[test]
    fn test_format_changed_precedes_first_sample() {
        let factory = SimEncoderFactory::new();
        let mut encoder = factory.create_encoder(&format()).unwrap();
        encoder.start().unwrap();

        let timeout = Duration::from_millis(20);
        assert!(matches!(
            encoder.dequeue_output(timeout).unwrap(),
            EncoderOutput::TryAgainLater
        ));

        let input = encoder.input_surface();
        input.queue_frame(VideoFrame::solid(FrameSize::new(8, 8), [1, 2, 3, 255], 0));
        assert!(matches!(
            encoder.dequeue_output(timeout).unwrap(),
            EncoderOutput::FormatChanged(_)
        ));
        match encoder.dequeue_output(timeout).unwrap() {
            EncoderOutput::Sample(sample) => {
                assert!(sample.key_frame);
                assert_eq!(sample.data.len(), 1000);
            },
            other => panic!("expected sample, got {:?}", other),
        }

        encoder.signal_end_of_input().unwrap();
        assert!(matches!(
            encoder.dequeue_output(timeout).unwrap(),
            EncoderOutput::EndOfStream
        ));
        encoder.release();
        assert!(input.is_released());
    }

    #[test]
    fn test_creation_faults_are_consumed() {
        let factory = SimEncoderFactory::new();
        factory.fail_next_encoder_creations(1);
        assert!(factory.create_encoder(&format()).is_err());
        assert!(factory.create_encoder(&format()).is_ok());
        assert_eq!(factory.encoders_created(), 1);
    }

    #[test]
    fn test_muxer_writes_readable_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.mp4");
        let mut muxer = SimMuxer::create(&path).unwrap();
        let track = muxer
            .add_track(&TrackFormat {
                mime: "video/avc".to_string(),
                size: FrameSize::new(8, 8),
                codec_config: vec![1, 2, 3],
            })
            .unwrap();
        muxer.start().unwrap();
        for pts in [0i64, 33_333, 66_666] {
            let sample = EncodedSample {
                data: vec![9; 10],
                key_frame: pts == 0,
                codec_config: false,
            };
            muxer.write_sample(track, &sample, pts).unwrap();
        }
        muxer.stop().unwrap();
        muxer.release();

        let container = read_container(&path).unwrap();
        assert_eq!(container.size, FrameSize::new(8, 8));
        assert_eq!(container.timestamps(), vec![0, 33_333, 66_666]);
        assert!(container.samples[0].1);
        assert!(!container.samples[1].1);
    }

    #[test]
    fn test_stop_before_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut muxer = SimMuxer::create(&dir.path().join("x.mp4")).unwrap();
        assert!(muxer.stop().is_err());
    }
}
