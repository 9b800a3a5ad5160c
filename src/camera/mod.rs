//! Camera slots, device abstraction and per-device session management.

pub mod device;
pub mod reconnect;
pub mod session;
pub mod size;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use device::{CameraDevice, CameraProvider, DeviceEvent, DeviceEventSink, SessionTemplate};
pub use reconnect::ReconnectState;
pub use session::{CameraSession, SessionNotice, SessionTimings};
pub use size::{choose_preview_size, DEFAULT_PREVIEW_SIZE};

/// Logical camera position on the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPosition {
    Front,
    Back,
    Left,
    Right,
}

impl SlotPosition {
    pub const ALL: [SlotPosition; 4] = [
        SlotPosition::Front,
        SlotPosition::Back,
        SlotPosition::Left,
        SlotPosition::Right,
    ];

    /// Name used in file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotPosition::Front => "front",
            SlotPosition::Back => "back",
            SlotPosition::Left => "left",
            SlotPosition::Right => "right",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for SlotPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical camera position bound to a physical device.
///
/// Only the primary slot for a device identifier performs device I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraSlot {
    pub position: SlotPosition,
    pub device_id: String,
    /// Display rotation in degrees (0, 90, 180, 270).
    pub rotation: u16,
    pub mirror: bool,
    pub primary: bool,
}

impl CameraSlot {
    pub fn new(position: SlotPosition, device_id: impl Into<String>) -> Self {
        Self {
            position,
            device_id: device_id.into(),
            rotation: 0,
            mirror: false,
            primary: true,
        }
    }

    pub fn with_rotation(mut self, rotation: u16) -> Self {
        self.rotation = normalize_rotation(rotation);
        self
    }

    pub fn with_mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }
}

/// Snap a rotation to the nearest supported quarter turn.
pub fn normalize_rotation(degrees: u16) -> u16 {
    (((degrees as u32 % 360 + 45) / 90 * 90) % 360) as u16
}

/// Mark the first slot per physical device as primary and the rest as secondary.
pub fn assign_primaries(slots: &mut [CameraSlot]) {
    let mut seen: Vec<String> = Vec::new();
    for slot in slots.iter_mut() {
        slot.primary = !seen.contains(&slot.device_id);
        if slot.primary {
            seen.push(slot.device_id.clone());
        }
    }
}

/// Lifecycle state of one camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CameraSessionState {
    Closed,
    Opening,
    Open,
    ConfiguringSession,
    Previewing,
    Disconnected,
    FatalError,
}

impl CameraSessionState {
    /// A device handle exists and is usable.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            CameraSessionState::Open
                | CameraSessionState::ConfiguringSession
                | CameraSessionState::Previewing
        )
    }

    /// Open is in progress or already done.
    pub fn is_active(&self) -> bool {
        self.is_connected() || *self == CameraSessionState::Opening
    }
}

/// Camera error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CameraErrorCode {
    /// Device held by another client.
    InUse,
    /// Too many cameras open system-wide.
    MaxCamerasInUse,
    /// Disabled by device policy.
    Disabled,
    /// Fatal device error.
    Device,
    /// Camera service error.
    Service,
    /// Opening the device failed outright.
    AccessFailed,
    PermissionDenied,
    SessionConfigureFailed,
    Disconnected,
}

impl CameraErrorCode {
    /// Numeric code reported to observers.
    pub fn code(&self) -> i32 {
        match self {
            CameraErrorCode::InUse => 1,
            CameraErrorCode::MaxCamerasInUse => 2,
            CameraErrorCode::Disabled => 3,
            CameraErrorCode::Device => 4,
            CameraErrorCode::Service => 5,
            CameraErrorCode::AccessFailed => -1,
            CameraErrorCode::PermissionDenied => -2,
            CameraErrorCode::SessionConfigureFailed => -3,
            CameraErrorCode::Disconnected => -4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => CameraErrorCode::InUse,
            2 => CameraErrorCode::MaxCamerasInUse,
            3 => CameraErrorCode::Disabled,
            4 => CameraErrorCode::Device,
            5 => CameraErrorCode::Service,
            -1 => CameraErrorCode::AccessFailed,
            -2 => CameraErrorCode::PermissionDenied,
            -3 => CameraErrorCode::SessionConfigureFailed,
            -4 => CameraErrorCode::Disconnected,
            _ => return None,
        })
    }

    /// Errors that warrant an automatic reconnect.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CameraErrorCode::InUse
                | CameraErrorCode::MaxCamerasInUse
                | CameraErrorCode::Service
                | CameraErrorCode::AccessFailed
                | CameraErrorCode::Disconnected
        )
    }

    /// Errors that disable reconnect until an explicit force-reopen.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CameraErrorCode::Disabled | CameraErrorCode::Device | CameraErrorCode::PermissionDenied
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            CameraErrorCode::InUse => "camera in use",
            CameraErrorCode::MaxCamerasInUse => "too many cameras open",
            CameraErrorCode::Disabled => "camera disabled by policy",
            CameraErrorCode::Device => "fatal device error",
            CameraErrorCode::Service => "camera service error",
            CameraErrorCode::AccessFailed => "camera access failed",
            CameraErrorCode::PermissionDenied => "camera permission denied",
            CameraErrorCode::SessionConfigureFailed => "capture session configuration failed",
            CameraErrorCode::Disconnected => "camera disconnected",
        }
    }
}

impl fmt::Display for CameraErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        for code in [
            CameraErrorCode::InUse,
            CameraErrorCode::MaxCamerasInUse,
            CameraErrorCode::Service,
        ] {
            assert!(code.is_transient());
            assert!(!code.is_permanent());
        }
        for code in [CameraErrorCode::Disabled, CameraErrorCode::Device] {
            assert!(code.is_permanent());
            assert!(!code.is_transient());
        }
        assert!(!CameraErrorCode::SessionConfigureFailed.is_transient());
        assert!(!CameraErrorCode::SessionConfigureFailed.is_permanent());
    }

    #[test]
    fn test_error_code_roundtrip_values() {
        assert_eq!(CameraErrorCode::InUse.code(), 1);
        assert_eq!(CameraErrorCode::Disconnected.code(), -4);
        assert_eq!(CameraErrorCode::from_code(3), Some(CameraErrorCode::Disabled));
        assert_eq!(CameraErrorCode::from_code(42), None);
    }

    #[test]
    fn test_assign_primaries() {
        let mut slots = vec![
            CameraSlot::new(SlotPosition::Front, "2"),
            CameraSlot::new(SlotPosition::Back, "1"),
            CameraSlot::new(SlotPosition::Left, "2"),
            CameraSlot::new(SlotPosition::Right, "0"),
        ];
        assign_primaries(&mut slots);
        let flags: Vec<bool> = slots.iter().map(|s| s.primary).collect();
        assert_eq!(flags, vec![true, true, false, true]);
    }

    #[test]
    fn test_normalize_rotation() {
        assert_eq!(normalize_rotation(0), 0);
        assert_eq!(normalize_rotation(90), 90);
        assert_eq!(normalize_rotation(100), 90);
        assert_eq!(normalize_rotation(359), 0);
        assert_eq!(normalize_rotation(270), 270);
        assert_eq!(normalize_rotation(450), 90);
    }

    #[test]
    fn test_state_connectivity() {
        assert!(CameraSessionState::Previewing.is_connected());
        assert!(CameraSessionState::ConfiguringSession.is_connected());
        assert!(!CameraSessionState::Opening.is_connected());
        assert!(CameraSessionState::Opening.is_active());
        assert!(!CameraSessionState::Disconnected.is_active());
        assert!(!CameraSessionState::FatalError.is_connected());
    }

    #[test]
    fn test_slot_position_names() {
        assert_eq!(SlotPosition::Back.to_string(), "back");
        assert_eq!(SlotPosition::from_name("left"), Some(SlotPosition::Left));
        assert_eq!(SlotPosition::from_name("top"), None);
    }
}
