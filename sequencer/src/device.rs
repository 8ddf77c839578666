//! Device model as seen by the tasks
//!
//! Devices report changes as property updates carrying a state tag. The set
//! of properties is closed per device kind so every task matches on exactly
//! the properties it cares about.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Device identifier as known to the gateway
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// State tag carried by every property update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyState {
    Idle,
    Ok,
    Busy,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CameraProperty {
    /// Exposure countdown
    Exposure { remaining_us: u64 },
    /// Frame data, typically FITS
    Blob {
        #[serde(skip)]
        bytes: Arc<Vec<u8>>,
        format: String,
    },
    Connected(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FocuserProperty {
    Position(i32),
    Connected(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MountProperty {
    Coordinates { ra_hours: f64, dec_degrees: f64 },
    Tracking(bool),
    /// Manual motion (slew in a direction) active
    Motion(bool),
    Connected(bool),
}

/// Property of any device kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceProperty {
    Camera(CameraProperty),
    Focuser(FocuserProperty),
    Mount(MountProperty),
}

/// One change reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub device: DeviceId,
    pub property: DeviceProperty,
    pub state: PropertyState,
}

impl PropertyUpdate {
    pub fn new(device: impl Into<DeviceId>, property: DeviceProperty, state: PropertyState) -> Self {
        Self {
            device: device.into(),
            property,
            state,
        }
    }

    /// Short property name for logs and alert messages
    pub fn property_name(&self) -> &'static str {
        match &self.property {
            DeviceProperty::Camera(CameraProperty::Exposure { .. }) => "exposure",
            DeviceProperty::Camera(CameraProperty::Blob { .. }) => "blob",
            DeviceProperty::Camera(CameraProperty::Connected(_)) => "connected",
            DeviceProperty::Focuser(FocuserProperty::Position(_)) => "position",
            DeviceProperty::Focuser(FocuserProperty::Connected(_)) => "connected",
            DeviceProperty::Mount(MountProperty::Coordinates { .. }) => "coordinates",
            DeviceProperty::Mount(MountProperty::Tracking(_)) => "tracking",
            DeviceProperty::Mount(MountProperty::Motion(_)) => "motion",
            DeviceProperty::Mount(MountProperty::Connected(_)) => "connected",
        }
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Device kind, used in add/remove notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Camera,
    Focuser,
    Mount,
    Guider,
    FilterWheel,
    Rotator,
}

/// Device lifecycle and property notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEvent {
    Added { device: DeviceId, kind: DeviceKind },
    Removed { device: DeviceId, kind: DeviceKind },
    Updated(PropertyUpdate),
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub name: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocuserInfo {
    pub position: i32,
    pub min: i32,
    pub max: i32,
}

impl FocuserInfo {
    pub fn clamp(&self, position: i32) -> i32 {
        position.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    pub ra_hours: f64,
    pub dec_degrees: f64,
    /// Site latitude, degrees north
    pub latitude: f64,
    /// Site longitude, degrees east
    pub longitude: f64,
    pub tracking: bool,
}

/// Manual motion direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focuser_clamp() {
        let info = FocuserInfo { position: 500, min: 0, max: 1000 };
        assert_eq!(info.clamp(-20), 0);
        assert_eq!(info.clamp(1200), 1000);
        assert_eq!(info.clamp(640), 640);
    }

    #[test]
    fn test_property_names() {
        let update = PropertyUpdate::new(
            "cam",
            DeviceProperty::Camera(CameraProperty::Exposure { remaining_us: 0 }),
            PropertyState::Alert,
        );
        assert_eq!(update.property_name(), "exposure");
        assert_eq!(Direction::East.opposite(), Direction::West);
    }
}
