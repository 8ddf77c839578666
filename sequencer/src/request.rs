//! Capture request types
//!
//! Requests arrive as camelCase JSON. Every duration is converted to whole
//! microseconds once, when the task is built, and carried that way from there.

use crate::device::DeviceId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unit attached to a duration value in a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeUnit {
    #[serde(rename = "us")]
    Microseconds,
    #[serde(rename = "ms")]
    Milliseconds,
    #[default]
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "min")]
    Minutes,
}

impl TimeUnit {
    fn micros_per_unit(&self) -> f64 {
        match self {
            TimeUnit::Microseconds => 1.0,
            TimeUnit::Milliseconds => 1_000.0,
            TimeUnit::Seconds => 1_000_000.0,
            TimeUnit::Minutes => 60_000_000.0,
        }
    }
}

/// A duration as written by the user
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeValue {
    pub value: f64,
    pub unit: TimeUnit,
}

impl TimeValue {
    pub fn new(value: f64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    pub fn seconds(value: f64) -> Self {
        Self::new(value, TimeUnit::Seconds)
    }

    pub fn micros(value: u64) -> Self {
        Self::new(value as f64, TimeUnit::Microseconds)
    }

    /// Whole microseconds, negative and NaN values count as zero
    pub fn as_micros(&self) -> u64 {
        let us = (self.value * self.unit.micros_per_unit()).round();
        if us.is_finite() && us > 0.0 {
            us as u64
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    #[default]
    Light,
    Dark,
    Flat,
    Bias,
}

impl FrameType {
    /// Value of the IMAGETYP keyword, also used in file names
    pub fn keyword(&self) -> &'static str {
        match self {
            FrameType::Light => "LIGHT",
            FrameType::Dark => "DARK",
            FrameType::Flat => "FLAT",
            FrameType::Bias => "BIAS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExposureMode {
    #[default]
    Single,
    Fixed,
    Loop,
}

/// Region of interest in unbinned sensor pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubFolder {
    #[default]
    None,
    Date,
    FrameType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SavePolicy {
    pub autosave: bool,
    pub sub_folder: SubFolder,
    pub directory: Option<PathBuf>,
}

/// Guider dither parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DitherOptions {
    pub amount_pixels: f64,
    pub ra_only: bool,
    pub settle_pixels: f64,
    pub settle_time_secs: f64,
    pub settle_timeout_secs: f64,
    /// Extra pause on the camera side once the guider reports settled
    pub settle_delay_ms: u64,
}

impl Default for DitherOptions {
    fn default() -> Self {
        Self {
            amount_pixels: 5.0,
            ra_only: false,
            settle_pixels: 1.5,
            settle_time_secs: 10.0,
            settle_timeout_secs: 60.0,
            settle_delay_ms: 0,
        }
    }
}

/// Request for one camera capture run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureRequest {
    pub camera: DeviceId,
    pub exposure: TimeValue,
    pub frame_type: FrameType,
    pub mode: ExposureMode,
    /// Ignored unless the mode is FIXED
    pub count: u32,
    pub delay: TimeValue,
    pub roi: Option<Roi>,
    pub binning: u32,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub save: SavePolicy,
    pub dither: bool,
    pub dither_options: DitherOptions,
    pub mount: Option<DeviceId>,
    pub wheel: Option<DeviceId>,
    pub focuser: Option<DeviceId>,
    pub rotator: Option<DeviceId>,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            camera: DeviceId::default(),
            exposure: TimeValue::seconds(1.0),
            frame_type: FrameType::Light,
            mode: ExposureMode::Single,
            count: 1,
            delay: TimeValue::default(),
            roi: None,
            binning: 1,
            gain: None,
            offset: None,
            save: SavePolicy::default(),
            dither: false,
            dither_options: DitherOptions::default(),
            mount: None,
            wheel: None,
            focuser: None,
            rotator: None,
        }
    }
}

impl CaptureRequest {
    /// Single unsaved frame, the shape every wrapping task captures
    pub fn single(camera: impl Into<DeviceId>, exposure_us: u64, frame_type: FrameType) -> Self {
        Self {
            camera: camera.into(),
            exposure: TimeValue::micros(exposure_us),
            frame_type,
            ..Self::default()
        }
    }

    /// Number of frames to take, `None` when looping
    pub fn frame_count(&self) -> Option<u32> {
        match self.mode {
            ExposureMode::Single => Some(1),
            ExposureMode::Fixed => Some(self.count),
            ExposureMode::Loop => None,
        }
    }

    pub fn exposure_us(&self) -> u64 {
        self.exposure.as_micros()
    }

    pub fn delay_us(&self) -> u64 {
        self.delay.as_micros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_normalise_to_micros() {
        assert_eq!(TimeValue::new(2.5, TimeUnit::Seconds).as_micros(), 2_500_000);
        assert_eq!(TimeValue::new(1.5, TimeUnit::Minutes).as_micros(), 90_000_000);
        assert_eq!(TimeValue::new(0.1, TimeUnit::Milliseconds).as_micros(), 100);
        assert_eq!(TimeValue::new(-3.0, TimeUnit::Seconds).as_micros(), 0);
    }

    #[test]
    fn test_request_json() {
        let json = r#"{
            "camera": "ZWO ASI294MC",
            "exposure": { "value": 300, "unit": "ms" },
            "frameType": "DARK",
            "mode": "FIXED",
            "count": 12,
            "delay": { "value": 2 },
            "save": { "autosave": true, "subFolder": "FRAMETYPE" }
        }"#;
        let request: CaptureRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.camera.as_str(), "ZWO ASI294MC");
        assert_eq!(request.exposure_us(), 300_000);
        assert_eq!(request.delay_us(), 2_000_000);
        assert_eq!(request.frame_type, FrameType::Dark);
        assert_eq!(request.frame_count(), Some(12));
        assert_eq!(request.save.sub_folder, SubFolder::FrameType);
        assert_eq!(request.binning, 1);
    }

    #[test]
    fn test_loop_ignores_count() {
        let request = CaptureRequest {
            mode: ExposureMode::Loop,
            count: 4,
            ..CaptureRequest::default()
        };
        assert_eq!(request.frame_count(), None);
        assert_eq!(CaptureRequest::single("cam", 10, FrameType::Flat).frame_count(), Some(1));
    }
}
