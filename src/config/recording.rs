//! Recording configuration.
//!
//! Everything the host supplies for a recording run lives in one typed
//! struct: resolution policy, bitrate and frame-rate levels, segment length,
//! watermark toggle, backend policy and per-slot camera bindings. The struct
//! is owned by whoever drives the coordinator; there is no global instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cameras::{CarModel, SlotConfig};
use crate::camera::size::HIGHEST_TARGET_SIZE;
use crate::camera::{assign_primaries, normalize_rotation, CameraSlot, DEFAULT_PREVIEW_SIZE};
use crate::error::{RecorderError, RecorderResult, ResultExt};
use crate::media::FrameSize;

/// Bits per pixel per frame used for the medium bitrate level.
const BASE_BITS_PER_PIXEL: f64 = 0.1;

const MIN_BITRATE: u32 = 1_000_000;
const MAX_BITRATE: u32 = 20_000_000;

/// How the preview/record size is chosen from the device's supported sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum ResolutionPolicy {
    /// Closest to 1280x800.
    #[default]
    Default,
    /// Closest to an explicit size.
    Target { width: u32, height: u32 },
    /// Largest supported size.
    Highest,
}

/// Bitrate level, mapped to bits per second from size and frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BitrateLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl BitrateLevel {
    pub fn multiplier(&self) -> f64 {
        match self {
            BitrateLevel::Low => 0.5,
            BitrateLevel::Medium => 1.0,
            BitrateLevel::High => 1.5,
        }
    }

    /// Bits per second for the given size and frame rate.
    pub fn bits_per_second(&self, size: FrameSize, fps: u32) -> u32 {
        let raw = BASE_BITS_PER_PIXEL * self.multiplier() * size.pixel_count() as f64 * fps as f64;
        (raw.round() as u64).clamp(MIN_BITRATE as u64, MAX_BITRATE as u64) as u32
    }
}

/// Frame-rate level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum FrameRateLevel {
    Low,
    Medium,
    #[default]
    Standard,
}

impl FrameRateLevel {
    pub fn fps(&self) -> u32 {
        match self {
            FrameRateLevel::Low => 15,
            FrameRateLevel::Medium => 24,
            FrameRateLevel::Standard => 30,
        }
    }
}

/// Which recording pipeline to use for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum BackendPolicy {
    /// Software when the watermark is on or the car model needs it.
    #[default]
    Auto,
    Hardware,
    Software,
}

/// Centralized recorder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Directory for segments, snapshots and manifests.
    pub output_dir: PathBuf,

    pub car_model: CarModel,

    /// Number of cameras for the custom car model (4/2/1).
    pub camera_count: u8,

    /// Explicit slot bindings. Empty means use the car-model preset.
    pub slots: Vec<SlotConfig>,

    pub resolution: ResolutionPolicy,

    pub bitrate: BitrateLevel,

    pub frame_rate: FrameRateLevel,

    /// Segment length in minutes (1-30).
    pub segment_duration_minutes: u32,

    pub watermark_enabled: bool,

    pub backend: BackendPolicy,

    /// Maximum number of physical devices opened at once (1-4).
    pub max_open_cameras: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            car_model: CarModel::default(),
            camera_count: 4,
            slots: Vec::new(),
            resolution: ResolutionPolicy::default(),
            bitrate: BitrateLevel::default(),
            frame_rate: FrameRateLevel::default(),
            segment_duration_minutes: 1,
            watermark_enabled: false,
            backend: BackendPolicy::default(),
            max_open_cameras: 4,
        }
    }
}

impl RecorderConfig {
    /// Validate and clamp settings to acceptable ranges.
    pub fn validate(&mut self) {
        self.segment_duration_minutes = self.segment_duration_minutes.clamp(1, 30);
        self.max_open_cameras = self.max_open_cameras.clamp(1, 4);
        self.camera_count = match self.camera_count {
            0 | 1 => 1,
            2 | 3 => 2,
            _ => 4,
        };
        for slot in &mut self.slots {
            slot.rotation = normalize_rotation(slot.rotation);
        }
        let mut seen = Vec::new();
        self.slots.retain(|slot| {
            let fresh = !seen.contains(&slot.position);
            seen.push(slot.position);
            fresh
        });
    }

    /// Reset all settings to defaults.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Load from a JSON file and validate.
    pub fn load(path: &Path) -> RecorderResult<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: RecorderConfig = serde_json::from_str(&contents)
            .map_err(|e| RecorderError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> RecorderResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_minutes as u64 * 60)
    }

    /// Target size handed to preview-size selection.
    pub fn target_size(&self) -> FrameSize {
        match self.resolution {
            ResolutionPolicy::Default => DEFAULT_PREVIEW_SIZE,
            ResolutionPolicy::Highest => HIGHEST_TARGET_SIZE,
            ResolutionPolicy::Target { width, height } => FrameSize::new(width, height),
        }
    }

    pub fn fps(&self) -> u32 {
        self.frame_rate.fps()
    }

    pub fn bitrate_for(&self, size: FrameSize) -> u32 {
        self.bitrate.bits_per_second(size, self.fps())
    }

    /// Resolve the backend policy to a concrete choice.
    pub fn use_software_pipeline(&self) -> bool {
        match self.backend {
            BackendPolicy::Hardware => false,
            BackendPolicy::Software => true,
            BackendPolicy::Auto => {
                self.watermark_enabled || self.car_model.requires_software_encoding()
            },
        }
    }

    /// Camera slots for this configuration, with primary flags assigned.
    pub fn camera_slots(&self) -> Vec<CameraSlot> {
        let count = match self.car_model {
            CarModel::Custom => self.camera_count as usize,
            model => model.camera_count(),
        };

        let configs: Vec<SlotConfig> = if self.slots.is_empty() {
            self.car_model.preset_slots()
        } else {
            self.slots.clone()
        };

        let mut slots: Vec<CameraSlot> = configs
            .into_iter()
            .take(count)
            .map(|c| {
                let rotation = if self.car_model == CarModel::Custom {
                    c.rotation
                } else {
                    0
                };
                CameraSlot::new(c.position, c.device_id)
                    .with_rotation(rotation)
                    .with_mirror(c.mirror)
            })
            .collect();
        assign_primaries(&mut slots);
        slots
    }
}
