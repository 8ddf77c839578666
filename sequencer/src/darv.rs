//! Drift alignment (DARV)
//!
//! One exposure of `initial_pause + duration`. While it runs the mount sits
//! still for the pause, drives one way for half the duration and back for the
//! other half, so a misaligned axis shows as a V-shaped star trail.

use crate::capture::CameraCaptureTask;
use crate::context::TaskContext;
use crate::device::{DeviceId, Direction};
use crate::error::{TaskError, TaskResult};
use crate::event::EventPayload;
use crate::request::{CaptureRequest, FrameType, SavePolicy, TimeValue};
use crate::wait::sleep;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DarvRequest {
    pub camera: DeviceId,
    pub mount: DeviceId,
    pub initial_pause: TimeValue,
    /// Forward plus backward drive time
    pub duration: TimeValue,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub binning: u32,
    pub save: SavePolicy,
}

impl Default for DarvRequest {
    fn default() -> Self {
        Self {
            camera: DeviceId::default(),
            mount: DeviceId::default(),
            initial_pause: TimeValue::seconds(5.0),
            duration: TimeValue::seconds(30.0),
            gain: None,
            offset: None,
            binning: 1,
            save: SavePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DarvState {
    #[default]
    Idle,
    Waiting,
    Forwarding,
    Backwarding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DarvEvent {
    pub id: Uuid,
    pub camera: DeviceId,
    pub mount: DeviceId,
    pub state: DarvState,
    pub direction: Option<Direction>,
    pub saved_path: Option<String>,
    pub message: Option<String>,
}

pub struct DarvTask {
    ctx: TaskContext,
    request: DarvRequest,
    event: DarvEvent,
}

impl DarvTask {
    pub fn new(ctx: TaskContext, request: DarvRequest) -> Self {
        Self::with_id(ctx, request, Uuid::new_v4())
    }

    pub fn with_id(ctx: TaskContext, request: DarvRequest, id: Uuid) -> Self {
        let event = DarvEvent {
            id,
            camera: request.camera.clone(),
            mount: request.mount.clone(),
            state: DarvState::Idle,
            direction: None,
            saved_path: None,
            message: None,
        };
        Self { ctx, request, event }
    }

    pub fn id(&self) -> Uuid {
        self.event.id
    }

    /// Returns the final IDLE event. Motion is always stopped before it.
    pub async fn run(mut self, token: CancellationToken) -> DarvEvent {
        tracing::info!(
            "Starting DARV {} with {} on {}",
            self.event.id,
            self.request.camera,
            self.request.mount
        );

        let result = self.drive(&token).await;

        if let Err(e) = self.ctx.gateway.mount_stop_motion(&self.request.mount).await {
            tracing::warn!("Failed to stop {}: {}", self.request.mount, e);
        }

        match result {
            Ok(()) => tracing::info!("DARV {} finished", self.event.id),
            Err(e) if e.is_cancelled() => tracing::info!("DARV {} stopped", self.event.id),
            Err(e) => {
                tracing::error!("DARV failed: {}", e);
                self.event.message = Some(e.to_string());
            }
        }

        self.event.state = DarvState::Idle;
        self.event.direction = None;
        self.publish();
        self.event
    }

    async fn drive(&mut self, token: &CancellationToken) -> TaskResult<()> {
        let site = self
            .ctx
            .gateway
            .mount_info(&self.request.mount)
            .await
            .map_err(TaskError::Device)?;
        let forward = if site.latitude >= 0.0 {
            Direction::East
        } else {
            Direction::West
        };

        let pause_us = self.request.initial_pause.as_micros();
        let duration_us = self.request.duration.as_micros();
        let request = CaptureRequest {
            gain: self.request.gain,
            offset: self.request.offset,
            binning: self.request.binning,
            save: self.request.save.clone(),
            ..CaptureRequest::single(self.request.camera.clone(), pause_us + duration_us, FrameType::Light)
        };

        // A failed capture ends the drift and a failed drift ends the capture
        let inner = token.child_token();
        let capture = {
            let inner = inner.clone();
            let task = CameraCaptureTask::new(self.ctx.clone(), request);
            async move {
                let outcome = task.run(inner.child_token()).await;
                if !outcome.is_success() {
                    inner.cancel();
                }
                outcome
            }
        };
        let motion = async {
            let result = self.drift(forward, pause_us, duration_us, &inner).await;
            if result.is_err() {
                inner.cancel();
            }
            result
        };

        let (outcome, drift) = tokio::join!(capture, motion);

        if token.is_cancelled() {
            return Err(crate::error::WaitError::Cancelled.into());
        }
        if let Some(failure) = outcome.failure {
            return Err(TaskError::Device(failure));
        }
        drift?;
        self.event.saved_path = outcome.saved_paths.last().cloned();
        Ok(())
    }

    async fn drift(
        &mut self,
        forward: Direction,
        pause_us: u64,
        duration_us: u64,
        token: &CancellationToken,
    ) -> TaskResult<()> {
        let mount = self.request.mount.clone();
        let half = Duration::from_micros(duration_us / 2);

        self.event.state = DarvState::Waiting;
        self.publish();
        sleep(Duration::from_micros(pause_us), token).await?;

        self.event.state = DarvState::Forwarding;
        self.event.direction = Some(forward);
        self.publish();
        self.ctx
            .gateway
            .mount_slew(&mount, forward, true)
            .await
            .map_err(TaskError::Device)?;
        sleep(half, token).await?;
        self.ctx
            .gateway
            .mount_slew(&mount, forward, false)
            .await
            .map_err(TaskError::Device)?;

        let backward = forward.opposite();
        self.event.state = DarvState::Backwarding;
        self.event.direction = Some(backward);
        self.publish();
        self.ctx
            .gateway
            .mount_slew(&mount, backward, true)
            .await
            .map_err(TaskError::Device)?;
        sleep(half, token).await?;

        self.ctx
            .gateway
            .mount_stop_motion(&mount)
            .await
            .map_err(TaskError::Device)
    }

    fn publish(&self) {
        self.ctx.bus.publish(EventPayload::Darv(self.event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Topic;
    use crate::testing::{sim_context, SimCall};
    use tokio::time::Instant;

    fn request() -> DarvRequest {
        DarvRequest {
            camera: "cam".into(),
            mount: "mount".into(),
            initial_pause: TimeValue::seconds(5.0),
            duration: TimeValue::seconds(30.0),
            ..DarvRequest::default()
        }
    }

    fn seconds_since(start: Instant, at: Instant) -> u64 {
        (at - start).as_secs_f64().round() as u64
    }

    #[tokio::test(start_paused = true)]
    async fn test_northern_timeline() {
        let (ctx, sim) = sim_context();
        let mut events = ctx.bus.subscribe_topic(Topic::Darv);
        let start = Instant::now();
        let task = tokio::spawn(DarvTask::new(ctx, request()).run(CancellationToken::new()));

        let mut timeline = Vec::new();
        while let Some(event) = events.recv().await {
            let EventPayload::Darv(e) = event.payload else { continue };
            timeline.push((e.state, seconds_since(start, Instant::now())));
            if e.state == DarvState::Idle {
                break;
            }
        }
        let result = task.await.unwrap();

        assert_eq!(result.message, None);
        assert_eq!(
            &timeline[..3],
            &[
                (DarvState::Waiting, 0),
                (DarvState::Forwarding, 5),
                (DarvState::Backwarding, 20)
            ]
        );
        assert_eq!(timeline.last().unwrap().0, DarvState::Idle);

        let calls = sim.timed_calls();
        let at = |wanted: &SimCall| {
            calls
                .iter()
                .find(|(_, c)| c == wanted)
                .map(|(t, _)| seconds_since(start, *t))
                .unwrap()
        };
        assert_eq!(at(&SimCall::StartExposure("cam".into(), 35_000_000)), 0);
        assert_eq!(at(&SimCall::Slew(Direction::East, true)), 5);
        assert_eq!(at(&SimCall::Slew(Direction::West, true)), 20);
        assert!(at(&SimCall::StopMotion) <= 35);
    }

    #[tokio::test(start_paused = true)]
    async fn test_southern_drifts_west_first() {
        let (ctx, sim) = sim_context();
        sim.set_latitude(-33.0);
        let result = DarvTask::new(ctx, request()).run(CancellationToken::new()).await;

        assert_eq!(result.message, None);
        let slews: Vec<Direction> = sim
            .calls()
            .iter()
            .filter_map(|c| match c {
                SimCall::Slew(d, true) => Some(*d),
                _ => None,
            })
            .collect();
        assert_eq!(slews, vec![Direction::West, Direction::East]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_motion_and_exposure() {
        let (ctx, sim) = sim_context();
        let token = CancellationToken::new();
        let task = tokio::spawn(DarvTask::new(ctx, request()).run(token.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
        let result = task.await.unwrap();

        assert_eq!(result.state, DarvState::Idle);
        assert_eq!(result.message, None);
        let calls = sim.calls();
        assert!(calls.contains(&SimCall::StopExposure("cam".into())));
        assert_eq!(calls.last(), Some(&SimCall::StopMotion));
        assert!(!calls.contains(&SimCall::Slew(Direction::West, true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exposure_alert_ends_drift() {
        let (ctx, sim) = sim_context();
        sim.fail_exposures(true);
        let result = DarvTask::new(ctx, request()).run(CancellationToken::new()).await;

        assert!(result.message.unwrap().contains("reported an alert on exposure"));
        assert_eq!(sim.calls().last(), Some(&SimCall::StopMotion));
    }
}
