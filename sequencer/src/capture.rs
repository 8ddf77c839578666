//! Camera capture task
//!
//! Drives one camera through a single frame, a fixed number of frames or an
//! endless loop. One [`CaptureEvent`] snapshot is kept for the whole run,
//! updated in place and republished on every change.
//!
//! ```text
//! IDLE → EXPOSURE_STARTED → EXPOSING → EXPOSURE_FINISHED ─┬→ WAITING ───┬→ EXPOSURE_STARTED …
//!                                                          └→ DITHERING ─┘
//! ```

use crate::context::TaskContext;
use crate::device::{CameraProperty, DeviceId, DeviceProperty, PropertyState};
use crate::device_ops::ExposureSettings;
use crate::error::{TaskError, TaskResult, WaitError};
use crate::event::{EventPayload, Subscription, Topic};
use crate::request::{CaptureRequest, SubFolder};
use crate::wait::{cancellable, delay, sleep, wait_for_update};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureState {
    #[default]
    Idle,
    ExposureStarted,
    Exposing,
    ExposureFinished,
    Waiting,
    Dithering,
    Settling,
}

/// Elapsed and remaining time of a frame or of the whole run
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub elapsed_us: u64,
    pub remaining_us: u64,
    pub percent: f64,
}

impl Progress {
    pub fn new(elapsed_us: u64, total_us: u64) -> Self {
        let elapsed_us = elapsed_us.min(total_us);
        let percent = if total_us == 0 {
            100.0
        } else {
            elapsed_us as f64 * 100.0 / total_us as f64
        };
        Self {
            elapsed_us,
            remaining_us: total_us - elapsed_us,
            percent,
        }
    }
}

/// Progress snapshot of a capture run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    pub camera: DeviceId,
    pub state: CaptureState,
    pub elapsed_count: u32,
    /// `None` when looping
    pub remaining_count: Option<u32>,
    pub frame: Progress,
    /// `None` when looping
    pub total: Option<Progress>,
    /// Set on the one event published right after a frame was stored
    pub saved_path: Option<String>,
    /// Failure reason on the final IDLE event
    pub message: Option<String>,
}

/// What a finished run leaves behind for a wrapping task
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaptureOutcome {
    pub saved_paths: Vec<String>,
    pub failure: Option<String>,
    pub cancelled: bool,
}

impl CaptureOutcome {
    pub fn last_frame(&self) -> Option<&str> {
        self.saved_paths.last().map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }
}

type Listener = Box<dyn FnMut(&CaptureEvent) + Send + Sync>;

pub struct CameraCaptureTask {
    ctx: TaskContext,
    request: CaptureRequest,
    exposure_us: u64,
    delay_us: u64,
    /// Frames not started yet, `None` when looping
    pending: Option<u32>,
    total_us: Option<u64>,
    /// Exposure and delay time already behind us
    done_us: u64,
    camera_name: String,
    event: CaptureEvent,
    listeners: Vec<Listener>,
    saved_paths: Vec<String>,
    /// Frame data that arrived before the exposure reported OK
    early_blob: Option<(Arc<Vec<u8>>, String)>,
}

impl CameraCaptureTask {
    pub fn new(ctx: TaskContext, request: CaptureRequest) -> Self {
        let frames = request.frame_count();
        let exposure_us = request.exposure_us();
        let delay_us = request.delay_us();
        let total_us = frames.map(|n| {
            (n as u64)
                .saturating_mul(exposure_us)
                .saturating_add((n.saturating_sub(1) as u64).saturating_mul(delay_us))
        });

        let event = CaptureEvent {
            camera: request.camera.clone(),
            state: CaptureState::Idle,
            elapsed_count: 0,
            remaining_count: frames,
            frame: Progress::default(),
            total: total_us.map(|t| Progress::new(0, t)),
            saved_path: None,
            message: None,
        };

        Self {
            camera_name: request.camera.to_string(),
            ctx,
            exposure_us,
            delay_us,
            pending: frames,
            total_us,
            done_us: 0,
            event,
            listeners: Vec::new(),
            saved_paths: Vec::new(),
            early_blob: None,
            request,
        }
    }

    /// Called with every published snapshot, before it goes on the bus
    pub fn on_event(&mut self, listener: impl FnMut(&CaptureEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn event(&self) -> &CaptureEvent {
        &self.event
    }

    /// Run until every frame is taken, a step fails or `token` is cancelled.
    /// Always ends with exactly one IDLE event.
    pub async fn run(mut self, token: CancellationToken) -> CaptureOutcome {
        let camera = self.request.camera.clone();
        // Subscribe before the first command so no update is missed
        let mut subscription = self.ctx.bus.subscribe_topic(Topic::Device);

        tracing::info!(
            "Starting capture on {}: {:?} {:?}, {} µs",
            camera,
            self.request.mode,
            self.request.frame_type,
            self.exposure_us
        );

        let result = self.drive(&mut subscription, &token).await;

        let cancelled = token.is_cancelled() || matches!(&result, Err(e) if e.is_cancelled());
        if result.is_err() {
            if let Err(e) = self.ctx.gateway.camera_stop_exposure(&camera).await {
                tracing::warn!("Failed to stop exposure on {}: {}", camera, e);
            }
        }

        let failure = match result {
            Ok(()) => None,
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(e.to_string()),
        };
        match &failure {
            Some(message) => tracing::error!("Capture on {} failed: {}", camera, message),
            None if cancelled => tracing::info!("Capture on {} stopped", camera),
            None => tracing::info!("Capture on {} finished, {} frames", camera, self.event.elapsed_count),
        }

        self.event.state = CaptureState::Idle;
        self.event.message = failure.clone();
        self.publish();

        CaptureOutcome {
            saved_paths: std::mem::take(&mut self.saved_paths),
            failure,
            cancelled,
        }
    }

    async fn drive(&mut self, subscription: &mut Subscription, token: &CancellationToken) -> TaskResult<()> {
        let camera = self.request.camera.clone();
        match self.ctx.gateway.camera_info(&camera).await {
            Ok(info) => self.camera_name = info.name,
            Err(e) => tracing::warn!("No camera info for {}: {}", camera, e),
        }
        self.ctx
            .gateway
            .camera_enable_blob(&camera, true)
            .await
            .map_err(TaskError::Device)?;

        let mut first = true;
        while self.pending != Some(0) {
            if token.is_cancelled() {
                return Err(WaitError::Cancelled.into());
            }
            if !first {
                self.dither(token).await?;
            }
            self.start_exposure(subscription).await?;
            self.expose(subscription, token).await?;
            self.finish_exposure();
            self.receive_frame(subscription, token).await?;

            if self.pending == Some(0) {
                break;
            }
            self.wait_between_frames(token).await?;
            first = false;
        }
        Ok(())
    }

    // =========================================================================
    // FRAME STEPS
    // =========================================================================

    async fn start_exposure(&mut self, subscription: &mut Subscription) -> TaskResult<()> {
        self.pending = self.pending.map(|n| n.saturating_sub(1));
        // Anything still queued belongs to an earlier exposure
        self.early_blob = None;
        let stale = std::iter::from_fn(|| subscription.try_recv()).count();
        if stale > 0 {
            tracing::debug!("{}: dropped {} stale updates", self.request.camera, stale);
        }
        self.event.frame = Progress::new(0, self.exposure_us);

        let settings = ExposureSettings {
            exposure_us: self.exposure_us,
            frame_type: self.request.frame_type,
            roi: self.request.roi,
            binning: self.request.binning.max(1),
            gain: self.request.gain,
            offset: self.request.offset,
        };
        self.ctx
            .gateway
            .camera_start_exposure(&self.request.camera, &settings)
            .await
            .map_err(TaskError::Device)?;

        self.event.state = CaptureState::ExposureStarted;
        self.publish();
        Ok(())
    }

    /// Follow the countdown until the camera reports OK
    async fn expose(&mut self, subscription: &mut Subscription, token: &CancellationToken) -> TaskResult<()> {
        let camera = self.request.camera.clone();
        let timeout = Duration::from_micros(self.exposure_us) + self.ctx.config.blob_timeout();
        let what = format!("exposure on {}", camera);

        // Frame data only counts once this exposure's countdown has begun
        let mut counting = false;
        wait_for_update(subscription, token, Some(timeout), &what, |update| {
            if update.device != camera {
                return None;
            }
            match (&update.property, update.state) {
                (DeviceProperty::Camera(CameraProperty::Blob { bytes, format }), state)
                    if state != PropertyState::Alert =>
                {
                    if counting {
                        self.early_blob = Some((bytes.clone(), format.clone()));
                    } else {
                        tracing::debug!("{}: ignoring frame data from an earlier exposure", camera);
                    }
                    None
                }
                (DeviceProperty::Camera(CameraProperty::Exposure { remaining_us }), PropertyState::Busy) => {
                    counting = true;
                    self.on_countdown(*remaining_us);
                    None
                }
                (DeviceProperty::Camera(CameraProperty::Exposure { .. }), PropertyState::Ok) => Some(Ok(())),
                (DeviceProperty::Camera(CameraProperty::Exposure { .. }), PropertyState::Alert) => {
                    Some(Err(WaitError::Alert {
                        device: camera.to_string(),
                        property: update.property_name().to_string(),
                    }))
                }
                (DeviceProperty::Camera(CameraProperty::Exposure { .. }), PropertyState::Idle) if counting => {
                    Some(Err(WaitError::Aborted {
                        device: camera.to_string(),
                        property: update.property_name().to_string(),
                    }))
                }
                _ => None,
            }
        })
        .await?;
        Ok(())
    }

    fn on_countdown(&mut self, remaining_us: u64) {
        let elapsed = self.exposure_us.saturating_sub(remaining_us);
        self.event.frame = Progress::new(elapsed, self.exposure_us);
        if let Some(total) = self.total_us {
            self.event.total = Some(Progress::new(self.done_us.saturating_add(elapsed), total));
        }
        self.event.state = CaptureState::Exposing;
        self.publish();
    }

    fn finish_exposure(&mut self) {
        self.done_us = self.done_us.saturating_add(self.exposure_us);
        self.event.frame = Progress::new(self.exposure_us, self.exposure_us);
        if let Some(total) = self.total_us {
            self.event.total = Some(Progress::new(self.done_us, total));
        }
        self.event.remaining_count = self.event.remaining_count.map(|n| n.saturating_sub(1));
        self.event.elapsed_count += 1;
        self.event.state = CaptureState::ExposureFinished;
        tracing::debug!("{}: frame {} finished", self.request.camera, self.event.elapsed_count);
        self.publish();
    }

    /// Wait for the frame data if it has not arrived yet, then store it
    async fn receive_frame(&mut self, subscription: &mut Subscription, token: &CancellationToken) -> TaskResult<()> {
        let blob = match self.early_blob.take() {
            Some(blob) => Some(blob),
            None => {
                let camera = self.request.camera.clone();
                let timeout = self.ctx.config.blob_timeout();
                let what = format!("frame data from {}", camera);
                let received = wait_for_update(subscription, token, Some(timeout), &what, |update| {
                    match &update.property {
                        DeviceProperty::Camera(CameraProperty::Blob { bytes, format }) if update.device == camera => {
                            Some(Ok((bytes.clone(), format.clone())))
                        }
                        _ => None,
                    }
                })
                .await;
                match received {
                    Ok(blob) => Some(blob),
                    Err(e @ WaitError::Timeout { .. }) => {
                        tracing::warn!("{}", e);
                        None
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if let Some((bytes, format)) = blob {
            let path = self.store_frame(bytes, &format).await?;
            tracing::debug!("{}: frame stored as {}", self.request.camera, path);
            self.saved_paths.push(path.clone());
            self.event.saved_path = Some(path);
            self.publish();
            self.event.saved_path = None;
        }
        Ok(())
    }

    async fn store_frame(&self, bytes: Arc<Vec<u8>>, format: &str) -> TaskResult<String> {
        let data = Arc::try_unwrap(bytes).unwrap_or_else(|shared| shared.as_ref().clone());
        let camera = self.request.camera.to_string();

        if !self.request.save.autosave {
            self.ctx.images.save(data, &self.camera_name, Some(camera.as_str()));
            return Ok(self.camera_name.clone());
        }

        let path = self.frame_path(Local::now(), format);
        let images = self.ctx.images.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || images.save_file(data, &target, Some(camera.as_str())))
            .await
            .map_err(|e| TaskError::Imaging(e.to_string()))??;
        Ok(path)
    }

    /// `{dir}/{sub}/{frame}_{YYYYMMDD-HHMMSS-mmm}.{ext}`
    fn frame_path(&self, now: DateTime<Local>, format: &str) -> String {
        let frame_type = self.request.frame_type.keyword();
        let mut path: PathBuf = self.request.save.directory.clone().unwrap_or_default();
        match self.request.save.sub_folder {
            SubFolder::None => {}
            SubFolder::Date => path.push(now.format("%Y-%m-%d").to_string()),
            SubFolder::FrameType => path.push(frame_type),
        }
        let extension = match format.trim_start_matches('.') {
            "" => "fits",
            ext => ext,
        };
        path.push(format!("{}_{}.{}", frame_type, now.format("%Y%m%d-%H%M%S-%3f"), extension));
        path.to_string_lossy().into_owned()
    }

    // =========================================================================
    // BETWEEN FRAMES
    // =========================================================================

    async fn wait_between_frames(&mut self, token: &CancellationToken) -> TaskResult<()> {
        let pause = Duration::from_micros(self.delay_us);
        if pause >= self.ctx.config.min_delay() {
            self.event.state = CaptureState::Waiting;
            let tick = self.ctx.config.tick();
            delay(pause, tick, token, |remaining| {
                let waited = self.delay_us.saturating_sub(remaining.as_micros() as u64);
                if let Some(total) = self.total_us {
                    self.event.total = Some(Progress::new(self.done_us.saturating_add(waited), total));
                }
                self.publish();
            })
            .await?;
        }
        // Short delays are skipped but still counted as spent
        self.done_us = self.done_us.saturating_add(self.delay_us);
        Ok(())
    }

    async fn dither(&mut self, token: &CancellationToken) -> TaskResult<()> {
        if !self.request.dither {
            return Ok(());
        }
        let Some(guider) = self.ctx.guider.clone() else {
            return Ok(());
        };
        if !guider.is_running().await {
            tracing::debug!("Guider not running, skipping dither");
            return Ok(());
        }

        self.event.state = CaptureState::Dithering;
        self.publish();

        let options = self.request.dither_options;
        let success = match cancellable(token, guider.dither(&options, token.child_token())).await? {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Dither failed on {}, continuing: {}", self.request.camera, e);
                false
            }
        };

        if success && options.settle_delay_ms > 0 {
            self.event.state = CaptureState::Settling;
            self.publish();
            sleep(Duration::from_millis(options.settle_delay_ms), token).await?;
        }
        guider.settle_done(success).await;
        Ok(())
    }

    fn publish(&mut self) {
        for listener in self.listeners.iter_mut() {
            listener(&self.event);
        }
        self.ctx.bus.publish(EventPayload::Capture(self.event.clone()));
    }
}
