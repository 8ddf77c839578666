//! Autofocus task
//!
//! Captures single unsaved light frames, measures the median HFD of the
//! detected stars and lets a [`FocusCurveFitter`] steer the focuser until it
//! reports a focus point.

use crate::capture::CameraCaptureTask;
use crate::context::TaskContext;
use crate::device::{DeviceId, DeviceProperty, FocuserInfo, FocuserProperty, PropertyState};
use crate::device_ops::{FocusCurveFitter, FocusMove, FocusStep, SharedStarDetector, StarDetectionOptions};
use crate::error::{TaskError, TaskResult, WaitError};
use crate::event::{EventPayload, Topic};
use crate::focus_curve::{median, CurveFitter, FocusChart, FocusFitSettings};
use crate::request::{CaptureRequest, FrameType, TimeValue};
use crate::wait::{cancellable, wait_for_update};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutofocusRequest {
    pub camera: DeviceId,
    pub focuser: DeviceId,
    pub exposure: TimeValue,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub binning: u32,
    /// Captures per position before giving up on finding stars
    pub max_attempts: u32,
    pub fit: FocusFitSettings,
    pub detection: StarDetectionOptions,
    /// Move back to the starting position when the run fails
    pub restore_on_failure: bool,
}

impl Default for AutofocusRequest {
    fn default() -> Self {
        Self {
            camera: DeviceId::default(),
            focuser: DeviceId::default(),
            exposure: TimeValue::seconds(2.0),
            gain: None,
            offset: None,
            binning: 1,
            max_attempts: 3,
            fit: FocusFitSettings::default(),
            detection: StarDetectionOptions::default(),
            restore_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutofocusState {
    #[default]
    Idle,
    Capturing,
    Computing,
    Moving,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutofocusEvent {
    pub camera: DeviceId,
    pub focuser: DeviceId,
    pub state: AutofocusState,
    pub position: i32,
    pub hfd: Option<f64>,
    pub star_count: usize,
    pub chart: FocusChart,
    pub focus_point: Option<i32>,
    pub message: Option<String>,
}

pub struct AutoFocusTask {
    ctx: TaskContext,
    request: AutofocusRequest,
    event: AutofocusEvent,
}

impl AutoFocusTask {
    pub fn new(ctx: TaskContext, request: AutofocusRequest) -> Self {
        let event = AutofocusEvent {
            camera: request.camera.clone(),
            focuser: request.focuser.clone(),
            state: AutofocusState::Idle,
            position: 0,
            hfd: None,
            star_count: 0,
            chart: FocusChart::default(),
            focus_point: None,
            message: None,
        };
        Self { ctx, request, event }
    }

    /// Returns the final IDLE event
    pub async fn run(mut self, token: CancellationToken) -> AutofocusEvent {
        tracing::info!(
            "Starting autofocus with {} on {}",
            self.request.camera,
            self.request.focuser
        );

        let mut start = None;
        let result = self.drive(&token, &mut start).await;

        match &result {
            Ok(position) => tracing::info!("Autofocus finished at {}", position),
            Err(e) if e.is_cancelled() => tracing::info!("Autofocus stopped"),
            Err(e) => {
                tracing::error!("Autofocus failed: {}", e);
                self.event.message = Some(e.to_string());
                if let (true, Some(position)) = (self.request.restore_on_failure, start) {
                    if let Err(e) = self.ctx.gateway.focuser_move_to(&self.request.focuser, position).await {
                        tracing::warn!("Failed to restore focuser to {}: {}", position, e);
                    }
                }
            }
        }

        self.event.state = AutofocusState::Idle;
        self.publish();
        self.event
    }

    async fn drive(&mut self, token: &CancellationToken, start: &mut Option<i32>) -> TaskResult<i32> {
        let detector = self
            .ctx
            .star_detector
            .clone()
            .ok_or(TaskError::MissingCollaborator("Star detector"))?;
        let info = self
            .ctx
            .gateway
            .focuser_info(&self.request.focuser)
            .await
            .map_err(TaskError::Device)?;
        *start = Some(info.position);

        let mut fitter: Box<dyn FocusCurveFitter> = match &self.ctx.focus_fitter {
            Some(factory) => factory(&self.request.fit, info.position),
            None => Box::new(CurveFitter::new(self.request.fit)),
        };

        let mut position = info.position;
        self.event.position = position;
        loop {
            let hfd = self.measure(&detector, token).await?;

            self.event.state = AutofocusState::Computing;
            let step = fitter.add(position, hfd);
            self.event.chart = fitter.chart();
            self.publish();
            tracing::debug!("HFD {:.2} at {} -> {:?}", hfd, position, step);

            match step {
                FocusStep::Move(motion) => {
                    position = self.move_focuser(&info, position, motion, token).await?;
                }
                FocusStep::Completed { focus_point } => {
                    let target = info.clamp(focus_point);
                    self.event.focus_point = Some(target);
                    self.move_focuser(&info, position, FocusMove::Absolute(target), token).await?;
                    return Ok(target);
                }
                FocusStep::Failed(reason) => return Err(TaskError::Convergence(reason)),
            }
        }
    }

    /// Median HFD of a fresh frame, retrying frames without stars
    async fn measure(&mut self, detector: &SharedStarDetector, token: &CancellationToken) -> TaskResult<f64> {
        let attempts = self.request.max_attempts.max(1);
        for attempt in 1..=attempts {
            self.event.state = AutofocusState::Capturing;
            self.publish();

            let request = CaptureRequest {
                gain: self.request.gain,
                offset: self.request.offset,
                binning: self.request.binning,
                ..CaptureRequest::single(
                    self.request.camera.clone(),
                    self.request.exposure.as_micros(),
                    FrameType::Light,
                )
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
            let Some(path) = outcome.last_frame() else {
                return Err(TaskError::Imaging("Frame data never arrived".to_string()));
            };

            self.event.state = AutofocusState::Computing;
            self.publish();
            let stars = cancellable(token, detector.detect(path, &self.request.detection))
                .await?
                .map_err(|e| TaskError::collaborator("Star detection", e))?;

            self.event.star_count = stars.len();
            if stars.is_empty() {
                tracing::warn!("No stars detected (attempt {}/{})", attempt, attempts);
                continue;
            }

            let mut hfds: Vec<f64> = stars.iter().map(|s| s.hfd).collect();
            let hfd = median(&mut hfds);
            self.event.hfd = Some(hfd);
            return Ok(hfd);
        }
        Err(TaskError::Convergence(format!(
            "No stars detected after {} attempts",
            attempts
        )))
    }

    /// Move and wait until the focuser reports the clamped target
    async fn move_focuser(
        &mut self,
        info: &FocuserInfo,
        position: i32,
        motion: FocusMove,
        token: &CancellationToken,
    ) -> TaskResult<i32> {
        let target = match motion {
            FocusMove::Absolute(p) => info.clamp(p),
            FocusMove::Relative(delta) => info.clamp(position + delta),
        };
        if target == position {
            return Ok(position);
        }

        self.event.state = AutofocusState::Moving;
        self.publish();

        let focuser = self.request.focuser.clone();
        let mut subscription = self.ctx.bus.subscribe_topic(Topic::Device);
        let delta = target - position;
        let sent = match motion {
            FocusMove::Relative(_) if delta < 0 => self.ctx.gateway.focuser_move_in(&focuser, -delta).await,
            FocusMove::Relative(_) => self.ctx.gateway.focuser_move_out(&focuser, delta).await,
            FocusMove::Absolute(_) => self.ctx.gateway.focuser_move_to(&focuser, target).await,
        };
        sent.map_err(TaskError::Device)?;

        let what = format!("{} to reach {}", focuser, target);
        wait_for_update(
            &mut subscription,
            token,
            Some(self.ctx.config.focuser_timeout()),
            &what,
            |update| {
                if update.device != focuser {
                    return None;
                }
                match (&update.property, update.state) {
                    (DeviceProperty::Focuser(FocuserProperty::Position(p)), PropertyState::Ok) if *p == target => {
                        Some(Ok(()))
                    }
                    (DeviceProperty::Focuser(FocuserProperty::Position(_)), PropertyState::Alert) => {
                        Some(Err(WaitError::Alert {
                            device: focuser.to_string(),
                            property: update.property_name().to_string(),
                        }))
                    }
                    _ => None,
                }
            },
        )
        .await?;

        self.event.position = target;
        Ok(target)
    }

    fn publish(&self) {
        self.ctx.bus.publish(EventPayload::Autofocus(self.event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ops::{DetectedStar, StarDetector};
    use crate::testing::{sim_context, SimCall, SimGateway};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Star sizes follow a hyperbola centered on focuser position 5000
    struct HyperbolicStars {
        sim: Arc<SimGateway>,
        stars: usize,
    }

    #[async_trait]
    impl StarDetector for HyperbolicStars {
        async fn detect(&self, _path: &str, _options: &StarDetectionOptions) -> anyhow::Result<Vec<DetectedStar>> {
            let x = self.sim.focuser_position() as f64;
            let hfd = ((0.01 * (x - 5000.0)).powi(2) + 4.0).sqrt();
            Ok(vec![
                DetectedStar {
                    x: 10.0,
                    y: 10.0,
                    hfd,
                    flux: 1000.0
                };
                self.stars
            ])
        }
    }

    fn request() -> AutofocusRequest {
        AutofocusRequest {
            camera: "cam".into(),
            focuser: "focuser".into(),
            exposure: TimeValue::seconds(1.0),
            ..AutofocusRequest::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_autofocus_finds_minimum() {
        let (ctx, sim) = sim_context();
        sim.set_focuser_position(5200);
        let ctx = ctx.with_star_detector(Arc::new(HyperbolicStars { sim: sim.clone(), stars: 5 }));
        let mut events = ctx.bus.subscribe_topic(Topic::Autofocus);

        let result = AutoFocusTask::new(ctx, request()).run(CancellationToken::new()).await;

        assert_eq!(result.message, None);
        let focus = result.focus_point.unwrap();
        assert!((focus - 5000).abs() <= 10, "focus at {}", focus);
        assert_eq!(sim.focuser_position(), focus);
        assert!(!result.chart.curves.is_empty());

        let mut moving = false;
        while let Some(event) = events.try_recv() {
            if let EventPayload::Autofocus(e) = event.payload {
                moving |= e.state == AutofocusState::Moving;
            }
        }
        assert!(moving);
        assert!(sim.calls().iter().any(|c| matches!(c, SimCall::FocuserMoveIn(100))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stars_fails_after_attempts() {
        let (ctx, sim) = sim_context();
        let ctx = ctx.with_star_detector(Arc::new(HyperbolicStars { sim: sim.clone(), stars: 0 }));

        let result = AutoFocusTask::new(ctx, request()).run(CancellationToken::new()).await;

        assert_eq!(result.state, AutofocusState::Idle);
        assert_eq!(result.message.as_deref(), Some("No stars detected after 3 attempts"));
        let exposures = sim
            .calls()
            .iter()
            .filter(|c| matches!(c, SimCall::StartExposure(..)))
            .count();
        assert_eq!(exposures, 3);
    }

    #[tokio::test]
    async fn test_missing_detector() {
        let (ctx, _sim) = sim_context();
        let result = AutoFocusTask::new(ctx, request()).run(CancellationToken::new()).await;
        assert_eq!(result.message.as_deref(), Some("Star detector is not configured"));
    }
}
