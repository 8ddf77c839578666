//! Task registries
//!
//! A [`TaskHandler`] holds at most one running task per [`TaskKey`]. Starting
//! a task for a key that is already busy cancels the old one and waits for it
//! to publish its final IDLE event before the new one is spawned.
//! [`TaskHandlers`] bundles one handler per task family.

use crate::autofocus::{AutoFocusTask, AutofocusRequest};
use crate::capture::CameraCaptureTask;
use crate::context::TaskContext;
use crate::darv::{DarvRequest, DarvTask};
use crate::device::DeviceId;
use crate::flat_wizard::{FlatWizardRequest, FlatWizardTask};
use crate::polar_align::{TppaRequest, TppaTask};
use crate::request::CaptureRequest;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity of a running task within its family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Camera(DeviceId),
    CameraFocuser(DeviceId, DeviceId),
    Request(Uuid),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Camera(camera) => write!(f, "{}", camera),
            TaskKey::CameraFocuser(camera, focuser) => write!(f, "{}+{}", camera, focuser),
            TaskKey::Request(id) => write!(f, "{}", id),
        }
    }
}

struct TaskHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!("Task ended abnormally: {}", e);
        }
    }
}

pub struct TaskHandler {
    name: &'static str,
    tasks: Mutex<HashMap<TaskKey, TaskHandle>>,
}

impl TaskHandler {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace whatever runs under `key` with the future built by `make`
    pub async fn start<F, Fut>(&self, key: TaskKey, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(previous) = tasks.remove(&key) {
            tracing::info!("Replacing {} task for {}", self.name, key);
            previous.shutdown().await;
        }

        let token = CancellationToken::new();
        let join = tokio::spawn(make(token.clone()));
        tracing::debug!("Started {} task for {}", self.name, key);
        tasks.insert(key, TaskHandle { token, join });
    }

    /// Stop the task under `key`. Returns false when nothing was registered.
    pub async fn stop(&self, key: &TaskKey) -> bool {
        let handle = self.tasks.lock().await.remove(key);
        match handle {
            Some(handle) => {
                handle.shutdown().await;
                tracing::info!("Stopped {} task for {}", self.name, key);
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, key: &TaskKey) -> bool {
        self.tasks
            .lock()
            .await
            .get(key)
            .is_some_and(|handle| !handle.join.is_finished())
    }

    /// Forget finished tasks, returning how many were dropped
    pub async fn gc(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, handle| !handle.join.is_finished());
        before - tasks.len()
    }

    pub async fn stop_all(&self) {
        let handles: Vec<TaskHandle> = self.tasks.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.shutdown().await;
        }
    }

    pub async fn count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

/// One handler per task family, sharing a context
pub struct TaskHandlers {
    ctx: TaskContext,
    capture: TaskHandler,
    autofocus: TaskHandler,
    flat_wizard: TaskHandler,
    tppa: TaskHandler,
    darv: TaskHandler,
}

impl TaskHandlers {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx,
            capture: TaskHandler::new("capture"),
            autofocus: TaskHandler::new("autofocus"),
            flat_wizard: TaskHandler::new("flat wizard"),
            tppa: TaskHandler::new("polar alignment"),
            darv: TaskHandler::new("DARV"),
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    // =========================================================================
    // CAPTURE
    // =========================================================================

    pub async fn start_capture(&self, request: CaptureRequest) {
        let key = TaskKey::Camera(request.camera.clone());
        let task = CameraCaptureTask::new(self.ctx.clone(), request);
        self.capture
            .start(key, |token| async move {
                task.run(token).await;
            })
            .await;
    }

    pub async fn stop_capture(&self, camera: &DeviceId) -> bool {
        self.capture.stop(&TaskKey::Camera(camera.clone())).await
    }

    // =========================================================================
    // AUTOFOCUS
    // =========================================================================

    pub async fn start_autofocus(&self, request: AutofocusRequest) {
        let key = TaskKey::CameraFocuser(request.camera.clone(), request.focuser.clone());
        let task = AutoFocusTask::new(self.ctx.clone(), request);
        self.autofocus
            .start(key, |token| async move {
                task.run(token).await;
            })
            .await;
    }

    pub async fn stop_autofocus(&self, camera: &DeviceId, focuser: &DeviceId) -> bool {
        self.autofocus
            .stop(&TaskKey::CameraFocuser(camera.clone(), focuser.clone()))
            .await
    }

    // =========================================================================
    // FLAT WIZARD
    // =========================================================================

    pub async fn start_flat_wizard(&self, request: FlatWizardRequest) {
        let key = TaskKey::Camera(request.camera.clone());
        let task = FlatWizardTask::new(self.ctx.clone(), request);
        self.flat_wizard
            .start(key, |token| async move {
                task.run(token).await;
            })
            .await;
    }

    pub async fn stop_flat_wizard(&self, camera: &DeviceId) -> bool {
        self.flat_wizard.stop(&TaskKey::Camera(camera.clone())).await
    }

    // =========================================================================
    // POLAR ALIGNMENT
    // =========================================================================

    /// Returns the id to stop the run with
    pub async fn start_tppa(&self, request: TppaRequest) -> Uuid {
        let task = TppaTask::new(self.ctx.clone(), request);
        let id = task.id();
        self.tppa
            .start(TaskKey::Request(id), |token| async move {
                task.run(token).await;
            })
            .await;
        id
    }

    pub async fn stop_tppa(&self, id: Uuid) -> bool {
        self.tppa.stop(&TaskKey::Request(id)).await
    }

    // =========================================================================
    // DARV
    // =========================================================================

    pub async fn start_darv(&self, request: DarvRequest) -> Uuid {
        let task = DarvTask::new(self.ctx.clone(), request);
        let id = task.id();
        self.darv
            .start(TaskKey::Request(id), |token| async move {
                task.run(token).await;
            })
            .await;
        id
    }

    pub async fn stop_darv(&self, id: Uuid) -> bool {
        self.darv.stop(&TaskKey::Request(id)).await
    }

    // =========================================================================
    // HOUSEKEEPING
    // =========================================================================

    pub async fn gc(&self) -> usize {
        self.capture.gc().await
            + self.autofocus.gc().await
            + self.flat_wizard.gc().await
            + self.tppa.gc().await
            + self.darv.gc().await
    }

    pub async fn stop_all(&self) {
        self.capture.stop_all().await;
        self.autofocus.stop_all().await;
        self.flat_wizard.stop_all().await;
        self.tppa.stop_all().await;
        self.darv.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureState;
    use crate::event::{EventPayload, Topic};
    use crate::request::{ExposureMode, FrameType};
    use crate::testing::{sim_context, SimCall};
    use std::time::Duration;

    fn looping(camera: &str) -> CaptureRequest {
        CaptureRequest {
            mode: ExposureMode::Loop,
            ..CaptureRequest::single(camera, 3_000_000, FrameType::Light)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_replaces_first() {
        let (ctx, sim) = sim_context();
        let mut events = ctx.bus.subscribe_topic(Topic::Capture);
        let handlers = TaskHandlers::new(ctx);

        handlers.start_capture(looping("cam")).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let second = CaptureRequest::single("cam", 1_000_000, FrameType::Dark);
        handlers.start_capture(second).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        // The first task's IDLE comes before anything about the dark frame
        let mut sequence = Vec::new();
        while let Some(event) = events.try_recv() {
            if let EventPayload::Capture(e) = event.payload {
                sequence.push(e.state);
            }
        }
        let first_idle = sequence.iter().position(|s| *s == CaptureState::Idle).unwrap();
        let second_start = sequence
            .iter()
            .rposition(|s| *s == CaptureState::ExposureStarted)
            .unwrap();
        assert!(first_idle < second_start);
        assert_eq!(sequence.iter().filter(|s| **s == CaptureState::Idle).count(), 2);

        let calls = sim.calls();
        let stop = calls
            .iter()
            .position(|c| *c == SimCall::StopExposure("cam".into()))
            .unwrap();
        let dark = calls
            .iter()
            .position(|c| *c == SimCall::StartExposure("cam".into(), 1_000_000))
            .unwrap();
        assert!(stop < dark);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let (ctx, _sim) = sim_context();
        let handlers = TaskHandlers::new(ctx);

        handlers.start_capture(looping("cam1")).await;
        handlers.start_capture(looping("cam2")).await;
        assert_eq!(handlers.capture.count().await, 2);
        assert!(handlers.capture.is_running(&TaskKey::Camera("cam1".into())).await);

        assert!(handlers.stop_capture(&"cam1".into()).await);
        assert!(!handlers.stop_capture(&"cam1".into()).await);
        assert!(handlers.capture.is_running(&TaskKey::Camera("cam2".into())).await);
        handlers.stop_all().await;
        assert_eq!(handlers.capture.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_drops_finished_tasks() {
        let (ctx, _sim) = sim_context();
        let handlers = TaskHandlers::new(ctx);

        handlers
            .start_capture(CaptureRequest::single("cam", 1_000_000, FrameType::Bias))
            .await;
        assert_eq!(handlers.gc().await, 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handlers.gc().await, 1);
        assert!(!handlers.stop_capture(&"cam".into()).await);
    }
}
