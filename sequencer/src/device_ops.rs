//! Device and collaborator interfaces
//!
//! The gateway verbs are fire-and-forget: a returned `Ok` only means the
//! command was accepted. Completion is observed through property updates on
//! the event bus. The collaborator traits (star detection, plate solving,
//! guiding, focus curve fitting, polar alignment math) are implemented
//! elsewhere and injected through [`crate::TaskContext`].

use crate::device::{CameraInfo, DeviceId, Direction, FocuserInfo, MountInfo};
use crate::focus_curve::FocusChart;
use crate::request::{DitherOptions, FrameType, Roi};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result type for device operations
pub type DeviceResult<T> = Result<T, String>;

/// Parameters of one exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureSettings {
    pub exposure_us: u64,
    pub frame_type: FrameType,
    pub roi: Option<Roi>,
    pub binning: u32,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
}

/// Imperative device verbs
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    // =========================================================================
    // CAMERA OPERATIONS
    // =========================================================================

    /// Start an exposure. Progress arrives as `Exposure` updates, the frame
    /// as a `Blob` update.
    async fn camera_start_exposure(&self, camera: &DeviceId, settings: &ExposureSettings) -> DeviceResult<()>;

    /// Abort the current exposure, if any
    async fn camera_stop_exposure(&self, camera: &DeviceId) -> DeviceResult<()>;

    /// Enable or disable frame data transfer
    async fn camera_enable_blob(&self, camera: &DeviceId, enabled: bool) -> DeviceResult<()>;

    async fn camera_info(&self, camera: &DeviceId) -> DeviceResult<CameraInfo>;

    // =========================================================================
    // FOCUSER OPERATIONS
    // =========================================================================

    /// Move to an absolute position
    async fn focuser_move_to(&self, focuser: &DeviceId, position: i32) -> DeviceResult<()>;

    /// Move inward by `steps`
    async fn focuser_move_in(&self, focuser: &DeviceId, steps: i32) -> DeviceResult<()>;

    /// Move outward by `steps`
    async fn focuser_move_out(&self, focuser: &DeviceId, steps: i32) -> DeviceResult<()>;

    async fn focuser_info(&self, focuser: &DeviceId) -> DeviceResult<FocuserInfo>;

    // =========================================================================
    // MOUNT OPERATIONS
    // =========================================================================

    /// Start (`enabled`) or end manual motion in `direction`
    async fn mount_slew(&self, mount: &DeviceId, direction: Direction, enabled: bool) -> DeviceResult<()>;

    /// End manual motion in every direction
    async fn mount_stop_motion(&self, mount: &DeviceId) -> DeviceResult<()>;

    async fn mount_set_tracking(&self, mount: &DeviceId, enabled: bool) -> DeviceResult<()>;

    async fn mount_info(&self, mount: &DeviceId) -> DeviceResult<MountInfo>;
}

/// Thread-safe device gateway handle
pub type SharedDeviceGateway = Arc<dyn DeviceGateway>;

/// Gateway used before a real one is attached. Every verb fails.
pub struct NullDeviceGateway;

fn not_connected<T>() -> DeviceResult<T> {
    Err("No device gateway connected".to_string())
}

#[async_trait]
impl DeviceGateway for NullDeviceGateway {
    async fn camera_start_exposure(&self, _: &DeviceId, _: &ExposureSettings) -> DeviceResult<()> {
        not_connected()
    }
    async fn camera_stop_exposure(&self, _: &DeviceId) -> DeviceResult<()> {
        not_connected()
    }
    async fn camera_enable_blob(&self, _: &DeviceId, _: bool) -> DeviceResult<()> {
        not_connected()
    }
    async fn camera_info(&self, _: &DeviceId) -> DeviceResult<CameraInfo> {
        not_connected()
    }
    async fn focuser_move_to(&self, _: &DeviceId, _: i32) -> DeviceResult<()> {
        not_connected()
    }
    async fn focuser_move_in(&self, _: &DeviceId, _: i32) -> DeviceResult<()> {
        not_connected()
    }
    async fn focuser_move_out(&self, _: &DeviceId, _: i32) -> DeviceResult<()> {
        not_connected()
    }
    async fn focuser_info(&self, _: &DeviceId) -> DeviceResult<FocuserInfo> {
        not_connected()
    }
    async fn mount_slew(&self, _: &DeviceId, _: Direction, _: bool) -> DeviceResult<()> {
        not_connected()
    }
    async fn mount_stop_motion(&self, _: &DeviceId) -> DeviceResult<()> {
        not_connected()
    }
    async fn mount_set_tracking(&self, _: &DeviceId, _: bool) -> DeviceResult<()> {
        not_connected()
    }
    async fn mount_info(&self, _: &DeviceId) -> DeviceResult<MountInfo> {
        not_connected()
    }
}

// =============================================================================
// STAR DETECTION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedStar {
    pub x: f64,
    pub y: f64,
    /// Half flux diameter in pixels
    pub hfd: f64,
    pub flux: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StarDetectionOptions {
    pub min_snr: f64,
    pub max_stars: usize,
    pub roi: Option<Roi>,
}

impl Default for StarDetectionOptions {
    fn default() -> Self {
        Self {
            min_snr: 5.0,
            max_stars: 500,
            roi: None,
        }
    }
}

#[async_trait]
pub trait StarDetector: Send + Sync {
    /// Stars found in the frame cached or stored at `path`
    async fn detect(&self, path: &str, options: &StarDetectionOptions) -> anyhow::Result<Vec<DetectedStar>>;
}

pub type SharedStarDetector = Arc<dyn StarDetector>;

// =============================================================================
// PLATE SOLVING
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateSolveRequest {
    pub id: Uuid,
    pub path: String,
    /// Search center, degrees
    pub ra: f64,
    pub dec: f64,
    /// Search radius, degrees
    pub radius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateSolution {
    /// Degrees
    pub ra: f64,
    pub dec: f64,
    /// Arcseconds per pixel
    pub pixel_scale: f64,
    /// Degrees east of north
    pub rotation: f64,
}

#[async_trait]
pub trait PlateSolver: Send + Sync {
    async fn solve(&self, request: &PlateSolveRequest, cancel: CancellationToken) -> anyhow::Result<PlateSolution>;

    /// Abort the solve started for request `id`
    async fn stop(&self, id: Uuid);
}

pub type SharedPlateSolver = Arc<dyn PlateSolver>;

// =============================================================================
// GUIDING
// =============================================================================

#[async_trait]
pub trait Guider: Send + Sync {
    /// Whether the guider is actively guiding
    async fn is_running(&self) -> bool;

    /// Dither and wait for the guider to settle
    async fn dither(&self, options: &DitherOptions, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Report that the camera side finished settling
    async fn settle_done(&self, success: bool);
}

pub type SharedGuider = Arc<dyn Guider>;

// =============================================================================
// FOCUS CURVE FITTING
// =============================================================================

/// Focuser move requested by the fitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusMove {
    Relative(i32),
    Absolute(i32),
}

/// Fitter verdict after a sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusStep {
    Move(FocusMove),
    Completed { focus_point: i32 },
    Failed(String),
}

pub trait FocusCurveFitter: Send {
    /// Add the HFD measured at `position` and decide what to do next
    fn add(&mut self, position: i32, hfd: f64) -> FocusStep;

    /// Raw samples plus every fitted curve
    fn chart(&self) -> FocusChart;
}

/// Builds a fitter for one run, given the starting position
pub type FocusFitterFactory = Arc<dyn Fn(&crate::focus_curve::FocusFitSettings, i32) -> Box<dyn FocusCurveFitter> + Send + Sync>;

// =============================================================================
// POLAR ALIGNMENT
// =============================================================================

/// Mechanical axis offset from the pole, degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolarError {
    pub azimuth: f64,
    pub altitude: f64,
    pub total: f64,
}

pub trait PolarAlignmentSolver: Send {
    /// Add a solved position (degrees). Returns an estimate once enough
    /// points were added.
    fn add(&mut self, ra: f64, dec: f64, time: DateTime<Utc>, refraction: bool) -> Option<PolarError>;
}

/// Builds a solver for a site (latitude, longitude in degrees)
pub type PolarSolverFactory = Arc<dyn Fn(f64, f64) -> Box<dyn PolarAlignmentSolver> + Send + Sync>;
