//! Flat wizard
//!
//! Bisects the exposure time of single, unsaved flat frames until the frame
//! median lands inside `target ± tolerance`, then writes that frame out as
//! FITS. Levels are on a 0..1 scale (raw / 65535).

use crate::capture::CameraCaptureTask;
use crate::context::TaskContext;
use crate::device::DeviceId;
use crate::error::{TaskError, TaskResult, WaitError};
use crate::event::EventPayload;
use crate::request::{CaptureRequest, FrameType, TimeValue};
use crate::wait::cancellable;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use umbra_imaging::{ExportFormat, Transformation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlatWizardRequest {
    pub camera: DeviceId,
    /// First exposure tried, clamped into the interval
    pub exposure: TimeValue,
    pub min_exposure: TimeValue,
    pub max_exposure: TimeValue,
    /// Target median level, 0..1
    pub target: f64,
    pub tolerance: f64,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub binning: u32,
    /// Directory the accepted flat is written to
    pub directory: Option<PathBuf>,
}

impl Default for FlatWizardRequest {
    fn default() -> Self {
        Self {
            camera: DeviceId::default(),
            exposure: TimeValue::seconds(1.0),
            min_exposure: TimeValue::micros(1_000),
            max_exposure: TimeValue::seconds(10.0),
            target: 0.5,
            tolerance: 0.05,
            gain: None,
            offset: None,
            binning: 1,
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlatWizardState {
    #[default]
    Idle,
    Capturing,
    Computing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatWizardEvent {
    pub camera: DeviceId,
    pub state: FlatWizardState,
    pub iteration: u32,
    pub exposure_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub median: Option<f64>,
    pub saved_path: Option<String>,
    pub message: Option<String>,
}

pub struct FlatWizardTask {
    ctx: TaskContext,
    request: FlatWizardRequest,
    event: FlatWizardEvent,
}

impl FlatWizardTask {
    pub fn new(ctx: TaskContext, request: FlatWizardRequest) -> Self {
        let event = FlatWizardEvent {
            camera: request.camera.clone(),
            state: FlatWizardState::Idle,
            iteration: 0,
            exposure_us: 0,
            min_us: request.min_exposure.as_micros(),
            max_us: request.max_exposure.as_micros(),
            median: None,
            saved_path: None,
            message: None,
        };
        Self { ctx, request, event }
    }

    /// Returns the final IDLE event
    pub async fn run(mut self, token: CancellationToken) -> FlatWizardEvent {
        tracing::info!(
            "Starting flat wizard on {}: target {:.3} ± {:.3}, {}-{} µs",
            self.request.camera,
            self.request.target,
            self.request.tolerance,
            self.event.min_us,
            self.event.max_us
        );

        match self.drive(&token).await {
            Ok(path) => tracing::info!("Flat exposure {} µs saved to {}", self.event.exposure_us, path),
            Err(e) if e.is_cancelled() => tracing::info!("Flat wizard stopped"),
            Err(e) => {
                tracing::error!("Flat wizard failed: {}", e);
                self.event.message = Some(e.to_string());
            }
        }

        self.event.state = FlatWizardState::Idle;
        self.publish();
        self.event
    }

    async fn drive(&mut self, token: &CancellationToken) -> TaskResult<String> {
        let low = self.request.target - self.request.tolerance;
        let high = self.request.target + self.request.tolerance;
        let min_interval = self.ctx.config.flat_min_interval_us;

        let mut min_us = self.event.min_us;
        let mut max_us = self.event.max_us.max(min_us);
        let mut exposure_us = self.request.exposure.as_micros().clamp(min_us, max_us);

        loop {
            if max_us - min_us < min_interval {
                return Err(TaskError::Convergence(format!(
                    "Exposure interval collapsed to {}-{} µs without reaching {:.3}",
                    min_us, max_us, self.request.target
                )));
            }

            self.event.iteration += 1;
            self.event.exposure_us = exposure_us;
            self.event.min_us = min_us;
            self.event.max_us = max_us;
            self.event.state = FlatWizardState::Capturing;
            self.publish();

            let frame = self.capture(exposure_us, token).await?;

            self.event.state = FlatWizardState::Computing;
            self.publish();
            let median = self.median(&frame, token).await?;
            self.event.median = Some(median);
            tracing::debug!(
                "Flat iteration {}: {} µs -> median {:.4}",
                self.event.iteration,
                exposure_us,
                median
            );

            if (low..=high).contains(&median) {
                let path = self.save(&frame).await?;
                self.event.saved_path = Some(path.clone());
                return Ok(path);
            }

            if median < low {
                min_us = exposure_us;
            } else {
                max_us = exposure_us;
            }
            exposure_us = min_us + (max_us - min_us) / 2;
        }
    }

    /// Single flat frame, kept in the cache only
    async fn capture(&self, exposure_us: u64, token: &CancellationToken) -> TaskResult<String> {
        let request = CaptureRequest {
            gain: self.request.gain,
            offset: self.request.offset,
            binning: self.request.binning,
            ..CaptureRequest::single(self.request.camera.clone(), exposure_us, FrameType::Flat)
        };
        let outcome = CameraCaptureTask::new(self.ctx.clone(), request)
            .run(token.child_token())
            .await;
        if outcome.cancelled {
            return Err(WaitError::Cancelled.into());
        }
        if let Some(failure) = outcome.failure {
            return Err(TaskError::Device(failure));
        }
        outcome
            .last_frame()
            .map(str::to_string)
            .ok_or_else(|| TaskError::Imaging("Frame data never arrived".to_string()))
    }

    async fn median(&self, frame: &str, token: &CancellationToken) -> TaskResult<f64> {
        let images = self.ctx.images.clone();
        let camera = self.request.camera.to_string();
        let path = frame.to_string();
        let median = cancellable(
            token,
            tokio::task::spawn_blocking(move || {
                images
                    .transform(&path, None, Some(&camera))
                    .map(|item| item.image.overall_median() as f64)
            }),
        )
        .await?
        .map_err(|e| TaskError::Imaging(e.to_string()))?;
        median.ok_or_else(|| TaskError::Imaging(format!("Could not decode {}", frame)))
    }

    /// Write the accepted frame as FITS with the neutral transformation
    async fn save(&self, frame: &str) -> TaskResult<String> {
        let mut destination = self.request.directory.clone().unwrap_or_default();
        destination.push(format!(
            "{}_{}.fits",
            FrameType::Flat.keyword(),
            Local::now().format("%Y%m%d-%H%M%S-%3f")
        ));

        let images = self.ctx.images.clone();
        let camera = self.request.camera.to_string();
        let path = frame.to_string();
        let target = destination.clone();
        let exported = tokio::task::spawn_blocking(move || {
            let mut neutral = Transformation::neutral();
            images.export(&path, Some(&mut neutral), ExportFormat::Fits, Some(&camera), Some(&target))
        })
        .await
        .map_err(|e| TaskError::Imaging(e.to_string()))??;

        match exported {
            Some(_) => Ok(destination.to_string_lossy().into_owned()),
            None => Err(TaskError::Imaging(format!("Could not decode {}", frame))),
        }
    }

    fn publish(&self) {
        self.ctx.bus.publish(EventPayload::FlatWizard(self.event.clone()));
    }
}
