//! Three-point polar alignment
//!
//! [`TppaTask`] captures and plate-solves a frame, slews the mount along one
//! axis, and repeats until the polar alignment solver has three points. It
//! then keeps capturing at the same position so the estimate follows the
//! user's adjustments, until it is stopped.
//!
//! [`ThreePointSolver`] is the default solver: the mechanical axis is the
//! normal of the plane through the three solved positions, taken in the
//! Earth-fixed hour angle frame so tracking between points cancels out.

use crate::capture::CameraCaptureTask;
use crate::context::TaskContext;
use crate::device::{DeviceId, Direction};
use crate::device_ops::{PlateSolution, PlateSolveRequest, PolarAlignmentSolver, PolarError, SharedPlateSolver};
use crate::error::{TaskError, TaskResult, WaitError};
use crate::event::EventPayload;
use crate::request::{CaptureRequest, FrameType, TimeValue};
use crate::wait::{cancellable, sleep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Solves needed before an estimate exists
const REQUIRED_POINTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TppaRequest {
    pub camera: DeviceId,
    pub mount: DeviceId,
    pub exposure: TimeValue,
    pub gain: Option<i32>,
    pub offset: Option<i32>,
    pub binning: u32,
    /// Manual motion used between points
    pub direction: Direction,
    pub move_duration: TimeValue,
    /// Plate solve search radius around the mount position, degrees
    pub search_radius: f64,
    /// Failed solves tolerated before giving up
    pub max_attempts: u32,
    /// Pause before each refinement capture
    pub delay_before_capture: TimeValue,
    pub refraction: bool,
    pub stop_tracking_when_done: bool,
}

impl Default for TppaRequest {
    fn default() -> Self {
        Self {
            camera: DeviceId::default(),
            mount: DeviceId::default(),
            exposure: TimeValue::seconds(5.0),
            gain: None,
            offset: None,
            binning: 1,
            direction: Direction::West,
            move_duration: TimeValue::seconds(10.0),
            search_radius: 30.0,
            max_attempts: 3,
            delay_before_capture: TimeValue::seconds(0.0),
            refraction: true,
            stop_tracking_when_done: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TppaState {
    #[default]
    Idle,
    Capturing,
    Solving,
    Aligning,
    Moving,
    Settling,
    Waiting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TppaEvent {
    pub id: Uuid,
    pub camera: DeviceId,
    pub mount: DeviceId,
    pub state: TppaState,
    /// Successful solves so far
    pub step: u32,
    pub failed_solves: u32,
    /// Last solved position, degrees
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub error: Option<PolarError>,
    pub message: Option<String>,
}

pub struct TppaTask {
    ctx: TaskContext,
    request: TppaRequest,
    event: TppaEvent,
}

impl TppaTask {
    pub fn new(ctx: TaskContext, request: TppaRequest) -> Self {
        Self::with_id(ctx, request, Uuid::new_v4())
    }

    pub fn with_id(ctx: TaskContext, request: TppaRequest, id: Uuid) -> Self {
        let event = TppaEvent {
            id,
            camera: request.camera.clone(),
            mount: request.mount.clone(),
            state: TppaState::Idle,
            step: 0,
            failed_solves: 0,
            ra: None,
            dec: None,
            error: None,
            message: None,
        };
        Self {
            ctx,
            request,
            event,
        }
    }

    pub fn id(&self) -> Uuid {
        self.event.id
    }

    /// Runs until stopped or failed. Returns the final IDLE event.
    pub async fn run(mut self, token: CancellationToken) -> TppaEvent {
        tracing::info!(
            "Starting polar alignment {} with {} on {}",
            self.event.id,
            self.request.camera,
            self.request.mount
        );

        let result = self.drive(&token).await;
        if let Err(e) = self.ctx.gateway.mount_stop_motion(&self.request.mount).await {
            tracing::warn!("Failed to stop {}: {}", self.request.mount, e);
        }

        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => tracing::info!("Polar alignment {} stopped", self.event.id),
            Err(e) => {
                tracing::error!("Polar alignment failed: {}", e);
                self.event.message = Some(e.to_string());
            }
        }

        self.event.state = TppaState::Idle;
        self.publish();

        if self.request.stop_tracking_when_done {
            if let Err(e) = self.ctx.gateway.mount_set_tracking(&self.request.mount, false).await {
                tracing::warn!("Failed to disable tracking on {}: {}", self.request.mount, e);
            }
        }
        self.event
    }

    async fn drive(&mut self, token: &CancellationToken) -> TaskResult<()> {
        let plate_solver = self
            .ctx
            .plate_solver
            .clone()
            .ok_or(TaskError::MissingCollaborator("Plate solver"))?;
        let mount = self.request.mount.clone();

        self.ctx
            .gateway
            .mount_set_tracking(&mount, true)
            .await
            .map_err(TaskError::Device)?;

        let site = self.ctx.gateway.mount_info(&mount).await.map_err(TaskError::Device)?;
        let mut solver: Box<dyn PolarAlignmentSolver> = match &self.ctx.polar_solver {
            Some(factory) => factory(site.latitude, site.longitude),
            None => Box::new(ThreePointSolver::new(site.latitude, site.longitude)),
        };

        loop {
            let frame = self.capture(token).await?;

            self.event.state = TppaState::Solving;
            self.publish();
            let info = self.ctx.gateway.mount_info(&mount).await.map_err(TaskError::Device)?;
            let request = PlateSolveRequest {
                id: Uuid::new_v4(),
                path: frame,
                ra: info.ra_hours * 15.0,
                dec: info.dec_degrees,
                radius: self.request.search_radius,
            };

            let solution = match self.solve(&plate_solver, &request, token).await? {
                Ok(solution) => solution,
                Err(e) => {
                    self.event.failed_solves += 1;
                    tracing::warn!(
                        "Plate solve failed ({}/{}): {}",
                        self.event.failed_solves,
                        self.request.max_attempts,
                        e
                    );
                    if self.event.failed_solves >= self.request.max_attempts {
                        return Err(TaskError::collaborator("Plate solver", e));
                    }
                    continue;
                }
            };

            self.event.state = TppaState::Aligning;
            self.event.step += 1;
            self.event.ra = Some(solution.ra);
            self.event.dec = Some(solution.dec);
            if let Some(error) = solver.add(solution.ra, solution.dec, Utc::now(), self.request.refraction) {
                tracing::info!(
                    "Polar error: az {:.4}°, alt {:.4}°, total {:.4}°",
                    error.azimuth,
                    error.altitude,
                    error.total
                );
                self.event.error = Some(error);
            }
            self.publish();

            if self.event.step < REQUIRED_POINTS {
                self.move_mount(token).await?;
            } else if self.event.error.is_none() {
                return Err(TaskError::Convergence(format!(
                    "No polar alignment solution after {} points",
                    self.event.step
                )));
            } else {
                let pause = Duration::from_micros(self.request.delay_before_capture.as_micros());
                if !pause.is_zero() {
                    self.event.state = TppaState::Waiting;
                    self.publish();
                    sleep(pause, token).await?;
                }
            }
        }
    }

    async fn capture(&mut self, token: &CancellationToken) -> TaskResult<String> {
        self.event.state = TppaState::Capturing;
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
        outcome
            .last_frame()
            .map(str::to_string)
            .ok_or_else(|| TaskError::Imaging("Frame data never arrived".to_string()))
    }

    /// Outer error aborts the task, inner error counts as a failed solve
    async fn solve(
        &self,
        plate_solver: &SharedPlateSolver,
        request: &PlateSolveRequest,
        token: &CancellationToken,
    ) -> TaskResult<anyhow::Result<PlateSolution>> {
        match cancellable(token, plate_solver.solve(request, token.child_token())).await {
            Ok(result) => Ok(result),
            Err(e) => {
                plate_solver.stop(request.id).await;
                Err(e.into())
            }
        }
    }

    async fn move_mount(&mut self, token: &CancellationToken) -> TaskResult<()> {
        let mount = self.request.mount.clone();
        self.event.state = TppaState::Moving;
        self.publish();

        self.ctx
            .gateway
            .mount_slew(&mount, self.request.direction, true)
            .await
            .map_err(TaskError::Device)?;
        sleep(Duration::from_micros(self.request.move_duration.as_micros()), token).await?;
        self.ctx
            .gateway
            .mount_stop_motion(&mount)
            .await
            .map_err(TaskError::Device)?;

        self.event.state = TppaState::Settling;
        self.publish();
        sleep(self.ctx.config.tppa_settle(), token).await?;
        Ok(())
    }

    fn publish(&self) {
        self.ctx.bus.publish(EventPayload::PolarAlignment(self.event.clone()));
    }
}

// =============================================================================
// THREE POINT SOLVER
// =============================================================================

type Vec3 = [f64; 3];

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn normalize(v: Vec3) -> Option<Vec3> {
    let norm = dot(v, v).sqrt();
    (norm > 1e-12).then(|| [v[0] / norm, v[1] / norm, v[2] / norm])
}

/// Rodrigues rotation of `v` around unit axis `k`
fn rotate(v: Vec3, k: Vec3, angle: f64) -> Vec3 {
    let (s, c) = angle.sin_cos();
    let kv = cross(k, v);
    let kd = dot(k, v) * (1.0 - c);
    [
        v[0] * c + kv[0] * s + k[0] * kd,
        v[1] * c + kv[1] * s + k[1] * kd,
        v[2] * c + kv[2] * s + k[2] * kd,
    ]
}

/// Unit vector for an hour angle and declination, degrees
fn unit(hour_angle: f64, dec: f64) -> Vec3 {
    let (h, d) = (hour_angle.to_radians(), dec.to_radians());
    [d.cos() * h.cos(), d.cos() * h.sin(), d.sin()]
}

/// Altitude and azimuth (from north, eastward) of an hour angle frame vector
fn horizontal(v: Vec3, latitude: f64) -> (f64, f64) {
    let h = v[1].atan2(v[0]);
    let d = v[2].clamp(-1.0, 1.0).asin();
    let lat = latitude.to_radians();
    let alt = (d.sin() * lat.sin() + d.cos() * lat.cos() * h.cos()).clamp(-1.0, 1.0).asin();
    let az = (-d.cos() * h.sin()).atan2(d.sin() * lat.cos() - d.cos() * lat.sin() * h.cos());
    (alt.to_degrees(), az.to_degrees().rem_euclid(360.0))
}

/// Hour angle and declination of a horizontal position, degrees
fn equatorial(alt: f64, az: f64, latitude: f64) -> (f64, f64) {
    let (a, z, lat) = (alt.to_radians(), az.to_radians(), latitude.to_radians());
    let dec = (a.sin() * lat.sin() + a.cos() * lat.cos() * z.cos()).clamp(-1.0, 1.0).asin();
    let h = (-z.sin() * a.cos()).atan2(a.sin() * lat.cos() - a.cos() * lat.sin() * z.cos());
    (h.to_degrees(), dec.to_degrees())
}

fn wrap_degrees(angle: f64) -> f64 {
    (angle + 180.0).rem_euclid(360.0) - 180.0
}

/// Julian day of a UTC instant
pub fn julian_day(time: &DateTime<Utc>) -> f64 {
    use chrono::{Datelike, Timelike};

    let (year, month) = match time.month() {
        m @ 1..=2 => (time.year() - 1, m + 12),
        m => (time.year(), m),
    };
    let a = year / 100;
    let b = 2 - a + a / 4;

    let day = (365.25 * (year as f64 + 4716.0)).floor()
        + (30.6001 * (month as f64 + 1.0)).floor()
        + time.day() as f64
        + b as f64
        - 1524.5;
    let seconds = time.num_seconds_from_midnight() as f64 + time.nanosecond() as f64 / 1e9;
    day + seconds / 86_400.0
}

/// Local mean sidereal time in hours
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - 2_451_545.0) / 36_525.0;
    let gmst = 280.460_618_37 + 360.985_647_366_29 * (jd - 2_451_545.0) + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    (gmst + longitude).rem_euclid(360.0) / 15.0
}

/// Bennett's refraction for a true altitude, degrees
pub fn bennett_refraction(altitude: f64) -> f64 {
    let arcmin = 1.0 / (altitude + 7.31 / (altitude + 4.4)).to_radians().tan();
    arcmin / 60.0
}

/// Polar alignment from three solved positions, refined by every later solve
pub struct ThreePointSolver {
    latitude: f64,
    longitude: f64,
    points: Vec<Vec3>,
    /// Axis fitted from the first three points and the third point itself
    fitted: Option<(Vec3, Vec3)>,
}

impl ThreePointSolver {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            points: Vec::with_capacity(3),
            fitted: None,
        }
    }

    fn hour_angle_frame(&self, ra: f64, dec: f64, time: &DateTime<Utc>) -> Vec3 {
        let lst = local_sidereal_time(julian_day(time), self.longitude) * 15.0;
        unit(lst - ra, dec)
    }

    /// Plane normal through the three points, pointing at the visible pole
    fn fit_axis(&self) -> Option<Vec3> {
        let [p1, p2, p3] = [self.points[0], self.points[1], self.points[2]];
        let normal = normalize(cross(sub(p2, p1), sub(p3, p1)))?;
        let north = self.latitude >= 0.0;
        if (normal[2] < 0.0) == north {
            Some([-normal[0], -normal[1], -normal[2]])
        } else {
            Some(normal)
        }
    }

    fn error(&self, axis: Vec3, refraction: bool) -> PolarError {
        let (alt, az) = horizontal(axis, self.latitude);
        let mut pole_alt = self.latitude.abs();
        if refraction {
            pole_alt += bennett_refraction(pole_alt);
        }
        let pole_az = if self.latitude >= 0.0 { 0.0 } else { 180.0 };
        let (h, d) = equatorial(pole_alt, pole_az, self.latitude);
        let pole = unit(h, d);

        PolarError {
            azimuth: wrap_degrees(az - pole_az),
            altitude: alt - pole_alt,
            total: dot(axis, pole).clamp(-1.0, 1.0).acos().to_degrees(),
        }
    }
}

impl PolarAlignmentSolver for ThreePointSolver {
    fn add(&mut self, ra: f64, dec: f64, time: DateTime<Utc>, refraction: bool) -> Option<PolarError> {
        let point = self.hour_angle_frame(ra, dec, &time);

        let axis = match self.fitted {
            Some((axis, reference)) => {
                // Knob adjustments move the third point and the axis together
                let c = cross(reference, point);
                let angle = dot(c, c).sqrt().atan2(dot(reference, point));
                match normalize(c) {
                    Some(k) => rotate(axis, k, angle),
                    None => axis,
                }
            }
            None => {
                self.points.push(point);
                if self.points.len() < 3 {
                    return None;
                }
                let Some(axis) = self.fit_axis() else {
                    tracing::warn!("Solved positions are collinear, dropping the last one");
                    self.points.pop();
                    return None;
                };
                self.fitted = Some((axis, point));
                axis
            }
        };

        Some(self.error(axis, refraction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_ops::PlateSolver;
    use crate::event::Topic;
    use crate::testing::{sim_context, SimCall};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const LAT: f64 = 48.0;
    const LON: f64 = 11.0;

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap()
    }

    /// Three solves 30° apart around an axis at the given alt/az, as RA/Dec
    fn points_around(alt: f64, az: f64) -> (Vec<(f64, f64)>, Vec3) {
        let (h, d) = equatorial(alt, az, LAT);
        let axis = unit(h, d);
        let perpendicular = normalize(cross(axis, [1.0, 0.0, 0.0])).unwrap();
        let start = rotate(axis, perpendicular, 10f64.to_radians());
        let points = [0.0, 30.0, 60.0]
            .iter()
            .map(|a| to_radec(rotate(start, axis, f64::to_radians(*a))))
            .collect();
        (points, rotate(start, axis, 60f64.to_radians()))
    }

    fn feed(solver: &mut ThreePointSolver, points: &[(f64, f64)]) -> Option<PolarError> {
        points
            .iter()
            .map(|(ra, dec)| solver.add(*ra, *dec, time(), false))
            .last()
            .flatten()
    }

    fn to_radec(p: Vec3) -> (f64, f64) {
        let lst = local_sidereal_time(julian_day(&time()), LON) * 15.0;
        let ha = p[1].atan2(p[0]).to_degrees();
        ((lst - ha).rem_euclid(360.0), p[2].asin().to_degrees())
    }

    #[test]
    fn test_julian_day_and_sidereal_time() {
        let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        let jd = julian_day(&j2000);
        assert!((jd - 2_451_545.0).abs() < 1e-9);
        assert!((local_sidereal_time(jd, 0.0) - 18.697_374_558).abs() < 1e-6);
        assert!((local_sidereal_time(jd, 15.0) - 19.697_374_558).abs() < 1e-6);
    }

    #[test]
    fn test_bennett_refraction() {
        assert!((bennett_refraction(48.0) - 0.014_933).abs() < 1e-5);
        assert!(bennett_refraction(10.0) > bennett_refraction(48.0));
    }

    #[test]
    fn test_needs_three_points() {
        let (points, _) = points_around(LAT, 0.0);
        let mut solver = ThreePointSolver::new(LAT, LON);
        assert_eq!(solver.add(points[0].0, points[0].1, time(), false), None);
        assert_eq!(solver.add(points[1].0, points[1].1, time(), false), None);
        assert!(solver.add(points[2].0, points[2].1, time(), false).is_some());
    }

    #[test]
    fn test_aligned_axis_has_no_error() {
        let (points, _) = points_around(LAT, 0.0);
        let error = feed(&mut ThreePointSolver::new(LAT, LON), &points).unwrap();
        assert!(error.total < 1e-4, "{:?}", error);
    }

    #[test]
    fn test_altitude_and_azimuth_error() {
        let (points, _) = points_around(LAT + 0.5, 0.0);
        let error = feed(&mut ThreePointSolver::new(LAT, LON), &points).unwrap();
        assert!((error.altitude - 0.5).abs() < 1e-6);
        assert!(error.azimuth.abs() < 1e-6);
        assert!((error.total - 0.5).abs() < 1e-6);

        let (points, _) = points_around(LAT - 0.5, 359.6);
        let error = feed(&mut ThreePointSolver::new(LAT, LON), &points).unwrap();
        assert!((error.altitude + 0.5).abs() < 1e-6);
        assert!((error.azimuth + 0.4).abs() < 1e-6);
        assert!((error.total - 0.5677).abs() < 1e-3);
    }

    #[test]
    fn test_refraction_raises_target() {
        let (points, _) = points_around(LAT, 0.0);
        let mut solver = ThreePointSolver::new(LAT, LON);
        feed(&mut solver, &points[..2]);
        let error = solver.add(points[2].0, points[2].1, time(), true).unwrap();
        assert!((error.altitude + bennett_refraction(LAT)).abs() < 1e-6);
    }

    #[test]
    fn test_refines_after_adjustment() {
        let (points, third) = points_around(LAT + 0.5, 0.0);
        let mut solver = ThreePointSolver::new(LAT, LON);
        feed(&mut solver, &points).unwrap();

        // Altitude knob lowers the mount by 0.5° around the east-west axis
        let (h, d) = equatorial(0.0, 90.0, LAT);
        let adjusted = rotate(third, unit(h, d), 0.5f64.to_radians());
        let (ra, dec) = to_radec(adjusted);
        let error = solver.add(ra, dec, time(), false).unwrap();
        assert!(error.total < 0.05, "{:?}", error);
    }

    // =========================================================================
    // TASK
    // =========================================================================

    struct StubSolver {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl PlateSolver for StubSolver {
        async fn solve(&self, _: &PlateSolveRequest, _: CancellationToken) -> anyhow::Result<PlateSolution> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("no match");
            }
            Ok(PlateSolution {
                ra: 30.0 * n as f64,
                dec: 80.0,
                pixel_scale: 1.5,
                rotation: 0.0,
            })
        }

        async fn stop(&self, _: Uuid) {}
    }

    /// Reports a fixed error from the third point on, or never
    struct FixedPolar {
        points: u32,
        solves: bool,
    }

    impl PolarAlignmentSolver for FixedPolar {
        fn add(&mut self, _: f64, _: f64, _: DateTime<Utc>, _: bool) -> Option<PolarError> {
            self.points += 1;
            (self.solves && self.points >= 3).then_some(PolarError {
                azimuth: 0.1,
                altitude: 0.2,
                total: 0.22,
            })
        }
    }

    fn setup(fail: bool, solves: bool) -> (TaskContext, Arc<crate::testing::SimGateway>, Arc<StubSolver>) {
        let (ctx, sim) = sim_context();
        let plate = Arc::new(StubSolver {
            calls: AtomicU32::new(0),
            fail,
        });
        let ctx = ctx
            .with_plate_solver(plate.clone())
            .with_polar_solver(Arc::new(move |_: f64, _: f64| {
                Box::new(FixedPolar { points: 0, solves }) as Box<dyn PolarAlignmentSolver>
            }));
        (ctx, sim, plate)
    }

    fn request() -> TppaRequest {
        TppaRequest {
            camera: "cam".into(),
            mount: "mount".into(),
            exposure: TimeValue::seconds(1.0),
            move_duration: TimeValue::seconds(2.0),
            stop_tracking_when_done: true,
            ..TppaRequest::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_points_then_refine() {
        let (ctx, sim, plate) = setup(false, true);
        let mut events = ctx.bus.subscribe_topic(Topic::PolarAlignment);
        let token = CancellationToken::new();
        let task = tokio::spawn(TppaTask::new(ctx, request()).run(token.clone()));

        let mut states = Vec::new();
        while let Some(event) = events.recv().await {
            let EventPayload::PolarAlignment(e) = event.payload else { continue };
            states.push(e.state);
            if e.step == 4 {
                token.cancel();
                break;
            }
        }
        let result = task.await.unwrap();

        assert_eq!(result.state, TppaState::Idle);
        assert_eq!(result.message, None);
        assert_eq!(result.error.unwrap().total, 0.22);
        assert_eq!(plate.calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            &states[..6],
            &[
                TppaState::Capturing,
                TppaState::Solving,
                TppaState::Aligning,
                TppaState::Moving,
                TppaState::Settling,
                TppaState::Capturing
            ]
        );

        let calls = sim.calls();
        let slews = calls
            .iter()
            .filter(|c| matches!(c, SimCall::Slew(Direction::West, true)))
            .count();
        assert_eq!(slews, 2);
        // One after each move, one on the way out
        assert_eq!(calls.iter().filter(|c| **c == SimCall::StopMotion).count(), 3);
        assert_eq!(calls.first(), Some(&SimCall::Tracking(true)));
        assert_eq!(calls.last(), Some(&SimCall::Tracking(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_solve_failures_abort() {
        let (ctx, sim, plate) = setup(true, true);
        let result = TppaTask::new(ctx, request()).run(CancellationToken::new()).await;

        assert_eq!(result.failed_solves, 3);
        assert_eq!(result.message.as_deref(), Some("Plate solver failed: no match"));
        assert_eq!(plate.calls.load(Ordering::SeqCst), 3);
        let calls = sim.calls();
        assert!(!calls.iter().any(|c| matches!(c, SimCall::Slew(..))));
        assert_eq!(calls.last(), Some(&SimCall::Tracking(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_solution_after_three_points() {
        let (ctx, sim, _plate) = setup(false, false);
        let result = TppaTask::new(ctx, request()).run(CancellationToken::new()).await;

        assert_eq!(result.step, 3);
        assert_eq!(
            result.message.as_deref(),
            Some("No polar alignment solution after 3 points")
        );
        let slews = sim.calls().iter().filter(|c| matches!(c, SimCall::Slew(..))).count();
        assert_eq!(slews, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_capturing_stops_mount() {
        let (ctx, sim, plate) = setup(false, true);
        let token = CancellationToken::new();
        let task = tokio::spawn(TppaTask::new(ctx, request()).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        token.cancel();
        let result = task.await.unwrap();

        assert_eq!(result.state, TppaState::Idle);
        assert_eq!(result.step, 0);
        assert_eq!(plate.calls.load(Ordering::SeqCst), 0);
        let calls = sim.calls();
        assert!(!calls.iter().any(|c| matches!(c, SimCall::Slew(..))));
        assert!(calls.contains(&SimCall::StopExposure("cam".into())));
        assert!(calls.contains(&SimCall::StopMotion));
        assert_eq!(calls.last(), Some(&SimCall::Tracking(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_moving_stops_mount() {
        let (ctx, sim, _plate) = setup(false, true);
        let mut events = ctx.bus.subscribe_topic(Topic::PolarAlignment);
        let token = CancellationToken::new();
        let task = tokio::spawn(TppaTask::new(ctx, request()).run(token.clone()));

        while let Some(event) = events.recv().await {
            if let EventPayload::PolarAlignment(e) = event.payload {
                if e.state == TppaState::Moving {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
        let result = task.await.unwrap();

        assert_eq!(result.message, None);
        let calls = sim.calls();
        let slew = calls.iter().position(|c| matches!(c, SimCall::Slew(_, true))).unwrap();
        assert!(calls[slew..].contains(&SimCall::StopMotion));
    }
}
