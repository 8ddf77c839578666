//! Simulated devices for task tests
//!
//! [`SimGateway`] answers every verb by publishing the property updates a
//! real device would, on tokio time, so tests run under a paused clock.

use crate::config::SequencerConfig;
use crate::context::TaskContext;
use crate::device::{
    CameraInfo, CameraProperty, DeviceId, DeviceProperty, Direction, FocuserInfo, FocuserProperty, MountInfo,
    MountProperty, PropertyState, PropertyUpdate,
};
use crate::device_ops::{DeviceGateway, DeviceResult, ExposureSettings, Guider};
use crate::event::{EventBus, SharedEventBus};
use crate::request::DitherOptions;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use umbra_imaging::{fits, ImageProcessor, ImagingConfig, PixelBuffer};

const FRAME_SIZE: u32 = 8;

/// Frame level (0..1) produced for an exposure length in µs
pub(crate) type Response = Arc<dyn Fn(u64) -> f32 + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SimCall {
    StartExposure(DeviceId, u64),
    StopExposure(DeviceId),
    EnableBlob(DeviceId, bool),
    FocuserMoveTo(i32),
    FocuserMoveIn(i32),
    FocuserMoveOut(i32),
    Slew(Direction, bool),
    StopMotion,
    Tracking(bool),
}

pub(crate) struct SimGateway {
    bus: SharedEventBus,
    tick: Duration,
    response: Mutex<Response>,
    fail_exposures: AtomicBool,
    exposures: Mutex<HashMap<DeviceId, CancellationToken>>,
    focuser: Mutex<FocuserInfo>,
    mount: Mutex<MountInfo>,
    calls: Mutex<Vec<(Instant, SimCall)>>,
}

impl SimGateway {
    pub(crate) fn new(bus: SharedEventBus) -> Arc<Self> {
        let response: Response = Arc::new(|_| 0.1);
        Arc::new(Self {
            bus,
            tick: Duration::from_secs(1),
            response: Mutex::new(response),
            fail_exposures: AtomicBool::new(false),
            exposures: Mutex::new(HashMap::new()),
            focuser: Mutex::new(FocuserInfo {
                position: 5000,
                min: 0,
                max: 10000,
            }),
            mount: Mutex::new(MountInfo {
                ra_hours: 6.0,
                dec_degrees: 80.0,
                latitude: 48.0,
                longitude: 11.0,
                tracking: false,
            }),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_response(&self, response: impl Fn(u64) -> f32 + Send + Sync + 'static) {
        let response: Response = Arc::new(response);
        *self.response.lock().unwrap() = response;
    }

    pub(crate) fn fail_exposures(&self, fail: bool) {
        self.fail_exposures.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_latitude(&self, latitude: f64) {
        self.mount.lock().unwrap().latitude = latitude;
    }

    pub(crate) fn set_focuser_position(&self, position: i32) {
        self.focuser.lock().unwrap().position = position;
    }

    pub(crate) fn focuser_position(&self) -> i32 {
        self.focuser.lock().unwrap().position
    }

    /// The driver gives up on the running exposure on its own
    pub(crate) fn abort_exposure(&self, camera: &DeviceId) {
        if let Some(token) = self.exposures.lock().unwrap().remove(camera) {
            token.cancel();
        }
    }

    pub(crate) fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub(crate) fn timed_calls(&self) -> Vec<(Instant, SimCall)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: SimCall) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    fn frame(level: f32) -> Vec<u8> {
        let mut image = PixelBuffer::new(FRAME_SIZE, FRAME_SIZE, 1);
        image.map_samples(|_| level.clamp(0.0, 1.0));
        fits::encode_fits(&image).unwrap()
    }

    fn move_focuser(&self, focuser: &DeviceId, target: i32) {
        let target = {
            let mut info = self.focuser.lock().unwrap();
            info.position = info.clamp(target);
            info.position
        };
        let bus = self.bus.clone();
        let focuser = focuser.clone();
        tokio::spawn(async move {
            let position = |value, state| {
                PropertyUpdate::new(
                    focuser.clone(),
                    DeviceProperty::Focuser(FocuserProperty::Position(value)),
                    state,
                )
            };
            bus.publish_update(position(target, PropertyState::Busy));
            tokio::time::sleep(Duration::from_millis(200)).await;
            bus.publish_update(position(target, PropertyState::Ok));
        });
    }
}

#[async_trait]
impl DeviceGateway for SimGateway {
    async fn camera_start_exposure(&self, camera: &DeviceId, settings: &ExposureSettings) -> DeviceResult<()> {
        self.record(SimCall::StartExposure(camera.clone(), settings.exposure_us));

        let token = CancellationToken::new();
        if let Some(previous) = self.exposures.lock().unwrap().insert(camera.clone(), token.clone()) {
            previous.cancel();
        }

        let bus = self.bus.clone();
        let tick = self.tick;
        let total = Duration::from_micros(settings.exposure_us);
        let response = self.response.lock().unwrap().clone();
        let level = (*response)(settings.exposure_us);
        let fail = self.fail_exposures.load(Ordering::SeqCst);
        let camera = camera.clone();

        tokio::spawn(async move {
            let exposure = |remaining_us, state| {
                PropertyUpdate::new(
                    camera.clone(),
                    DeviceProperty::Camera(CameraProperty::Exposure { remaining_us }),
                    state,
                )
            };
            let start = Instant::now();
            loop {
                let elapsed = start.elapsed();
                if elapsed >= total {
                    break;
                }
                let remaining = total - elapsed;
                bus.publish_update(exposure(remaining.as_micros() as u64, PropertyState::Busy));
                tokio::select! {
                    _ = token.cancelled() => {
                        bus.publish_update(exposure(0, PropertyState::Idle));
                        return;
                    }
                    _ = tokio::time::sleep(remaining.min(tick)) => {}
                }
            }

            if fail {
                bus.publish_update(exposure(0, PropertyState::Alert));
                return;
            }
            bus.publish_update(exposure(0, PropertyState::Ok));
            bus.publish_update(PropertyUpdate::new(
                camera.clone(),
                DeviceProperty::Camera(CameraProperty::Blob {
                    bytes: Arc::new(SimGateway::frame(level)),
                    format: "fits".to_string(),
                }),
                PropertyState::Ok,
            ));
        });
        Ok(())
    }

    async fn camera_stop_exposure(&self, camera: &DeviceId) -> DeviceResult<()> {
        self.record(SimCall::StopExposure(camera.clone()));
        if let Some(token) = self.exposures.lock().unwrap().remove(camera) {
            token.cancel();
        }
        Ok(())
    }

    async fn camera_enable_blob(&self, camera: &DeviceId, enabled: bool) -> DeviceResult<()> {
        self.record(SimCall::EnableBlob(camera.clone(), enabled));
        Ok(())
    }

    async fn camera_info(&self, camera: &DeviceId) -> DeviceResult<CameraInfo> {
        Ok(CameraInfo {
            name: camera.to_string(),
            connected: true,
        })
    }

    async fn focuser_move_to(&self, focuser: &DeviceId, position: i32) -> DeviceResult<()> {
        self.record(SimCall::FocuserMoveTo(position));
        self.move_focuser(focuser, position);
        Ok(())
    }

    async fn focuser_move_in(&self, focuser: &DeviceId, steps: i32) -> DeviceResult<()> {
        self.record(SimCall::FocuserMoveIn(steps));
        let target = self.focuser_position() - steps;
        self.move_focuser(focuser, target);
        Ok(())
    }

    async fn focuser_move_out(&self, focuser: &DeviceId, steps: i32) -> DeviceResult<()> {
        self.record(SimCall::FocuserMoveOut(steps));
        let target = self.focuser_position() + steps;
        self.move_focuser(focuser, target);
        Ok(())
    }

    async fn focuser_info(&self, _: &DeviceId) -> DeviceResult<FocuserInfo> {
        Ok(*self.focuser.lock().unwrap())
    }

    async fn mount_slew(&self, mount: &DeviceId, direction: Direction, enabled: bool) -> DeviceResult<()> {
        self.record(SimCall::Slew(direction, enabled));
        self.bus.publish_update(PropertyUpdate::new(
            mount.clone(),
            DeviceProperty::Mount(MountProperty::Motion(enabled)),
            PropertyState::Ok,
        ));
        Ok(())
    }

    async fn mount_stop_motion(&self, mount: &DeviceId) -> DeviceResult<()> {
        self.record(SimCall::StopMotion);
        self.bus.publish_update(PropertyUpdate::new(
            mount.clone(),
            DeviceProperty::Mount(MountProperty::Motion(false)),
            PropertyState::Ok,
        ));
        Ok(())
    }

    async fn mount_set_tracking(&self, mount: &DeviceId, enabled: bool) -> DeviceResult<()> {
        self.record(SimCall::Tracking(enabled));
        self.mount.lock().unwrap().tracking = enabled;
        self.bus.publish_update(PropertyUpdate::new(
            mount.clone(),
            DeviceProperty::Mount(MountProperty::Tracking(enabled)),
            PropertyState::Ok,
        ));
        Ok(())
    }

    async fn mount_info(&self, _: &DeviceId) -> DeviceResult<MountInfo> {
        Ok(*self.mount.lock().unwrap())
    }
}

/// Guider that takes two seconds per dither
pub(crate) struct SimGuider {
    running: AtomicBool,
    fail: AtomicBool,
    dithers: Mutex<Vec<Instant>>,
    settled: Mutex<Vec<bool>>,
}

impl SimGuider {
    pub(crate) fn new(running: bool, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(running),
            fail: AtomicBool::new(fail),
            dithers: Mutex::new(Vec::new()),
            settled: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn dithers(&self) -> Vec<Instant> {
        self.dithers.lock().unwrap().clone()
    }

    pub(crate) fn settled(&self) -> Vec<bool> {
        self.settled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Guider for SimGuider {
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn dither(&self, _: &DitherOptions, cancel: CancellationToken) -> anyhow::Result<()> {
        self.dithers.lock().unwrap().push(Instant::now());
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("dither cancelled"),
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("guide star lost");
        }
        Ok(())
    }

    async fn settle_done(&self, success: bool) {
        self.settled.lock().unwrap().push(success);
    }
}

/// Context backed by a fresh bus, cache and [`SimGateway`]
pub(crate) fn sim_context() -> (TaskContext, Arc<SimGateway>) {
    let bus: SharedEventBus = Arc::new(EventBus::default());
    let sim = SimGateway::new(bus.clone());
    let images = Arc::new(ImageProcessor::new(ImagingConfig::default()));
    let ctx = TaskContext::new(sim.clone(), bus, images, SequencerConfig::default());
    (ctx, sim)
}
