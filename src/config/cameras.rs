//! Camera slot bindings and car-model presets.

use serde::{Deserialize, Serialize};

use crate::camera::SlotPosition;

/// Host-supplied binding of one slot to a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotConfig {
    pub position: SlotPosition,
    pub device_id: String,
    /// Display rotation (custom car model only).
    #[serde(default)]
    pub rotation: u16,
    #[serde(default)]
    pub mirror: bool,
}

impl SlotConfig {
    pub fn new(position: SlotPosition, device_id: impl Into<String>) -> Self {
        Self {
            position,
            device_id: device_id.into(),
            rotation: 0,
            mirror: false,
        }
    }

    pub fn with_rotation(mut self, rotation: u16) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }
}

/// Vehicle preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CarModel {
    #[default]
    GalaxyE5,
    GalaxyL7,
    Custom,
}

impl CarModel {
    /// Number of cameras the preset records. Custom models use the
    /// configured count instead.
    pub fn camera_count(&self) -> usize {
        4
    }

    /// Whether the direct writer path is unreliable on this vehicle.
    pub fn requires_software_encoding(&self) -> bool {
        matches!(self, CarModel::GalaxyL7)
    }

    /// Default slot-to-device bindings. The rear camera is mirrored.
    pub fn preset_slots(&self) -> Vec<SlotConfig> {
        vec![
            SlotConfig::new(SlotPosition::Front, "2"),
            SlotConfig::new(SlotPosition::Back, "1").with_mirror(true),
            SlotConfig::new(SlotPosition::Left, "3"),
            SlotConfig::new(SlotPosition::Right, "0"),
        ]
    }
}
