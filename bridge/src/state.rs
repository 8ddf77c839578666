//! Application state
//!
//! Owns the event bus, the image cache and the task registries, and runs the
//! background housekeeping: a periodic cache sweep with task GC, and a device
//! watcher that tracks connected devices and stops the camera tasks of a
//! camera that disappears.

use crate::settings::AppSettings;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use umbra_imaging::{ImageProcessor, SharedImageProcessor};
use umbra_sequencer::{
    AutofocusRequest, CaptureRequest, DarvRequest, DeviceEvent, DeviceId, DeviceKind, EventBus, EventPayload,
    FlatWizardRequest, SharedDeviceGateway, SharedEventBus, Subscription, TaskContext, TaskHandlers, Topic,
    TppaRequest,
};
use uuid::Uuid;

pub struct AppState {
    settings: AppSettings,
    bus: SharedEventBus,
    images: SharedImageProcessor,
    handlers: Arc<TaskHandlers>,
    devices: Arc<RwLock<HashMap<DeviceId, DeviceKind>>>,
    background: CancellationToken,
}

impl AppState {
    pub fn new(settings: AppSettings, gateway: SharedDeviceGateway) -> Arc<Self> {
        Self::with_collaborators(settings, gateway, |ctx| ctx)
    }

    /// Build the state, letting `configure` attach guider, star detector,
    /// plate solver or custom fitters to the task context
    pub fn with_collaborators(
        settings: AppSettings,
        gateway: SharedDeviceGateway,
        configure: impl FnOnce(TaskContext) -> TaskContext,
    ) -> Arc<Self> {
        let bus: SharedEventBus = Arc::new(EventBus::new(settings.sequencer.event_buffer_size));
        let images: SharedImageProcessor = Arc::new(ImageProcessor::new(settings.imaging.clone()));
        let ctx = configure(TaskContext::new(
            gateway,
            bus.clone(),
            images.clone(),
            settings.sequencer.clone(),
        ));

        Arc::new(Self {
            settings,
            bus,
            images,
            handlers: Arc::new(TaskHandlers::new(ctx)),
            devices: Arc::new(RwLock::new(HashMap::new())),
            background: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn images(&self) -> &SharedImageProcessor {
        &self.images
    }

    pub fn handlers(&self) -> &TaskHandlers {
        &self.handlers
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.bus.subscribe_topic(topic)
    }

    /// Devices announced on the bus and not removed since
    pub async fn devices(&self, kind: DeviceKind) -> Vec<DeviceId> {
        let devices = self.devices.read().await;
        let mut ids: Vec<DeviceId> = devices
            .iter()
            .filter(|(_, k)| **k == kind)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids
    }

    // =========================================================================
    // TASKS
    // =========================================================================

    pub async fn start_capture(&self, mut request: CaptureRequest) {
        if request.save.directory.is_none() {
            request.save.directory = self.settings.save_directory.clone();
        }
        self.handlers.start_capture(request).await;
    }

    pub async fn stop_capture(&self, camera: &DeviceId) -> bool {
        self.handlers.stop_capture(camera).await
    }

    pub async fn start_autofocus(&self, request: AutofocusRequest) {
        self.handlers.start_autofocus(request).await;
    }

    pub async fn stop_autofocus(&self, camera: &DeviceId, focuser: &DeviceId) -> bool {
        self.handlers.stop_autofocus(camera, focuser).await
    }

    pub async fn start_flat_wizard(&self, mut request: FlatWizardRequest) {
        if request.directory.is_none() {
            request.directory = self.settings.save_directory.clone();
        }
        self.handlers.start_flat_wizard(request).await;
    }

    pub async fn stop_flat_wizard(&self, camera: &DeviceId) -> bool {
        self.handlers.stop_flat_wizard(camera).await
    }

    pub async fn start_tppa(&self, request: TppaRequest) -> Uuid {
        self.handlers.start_tppa(request).await
    }

    pub async fn stop_tppa(&self, id: Uuid) -> bool {
        self.handlers.stop_tppa(id).await
    }

    pub async fn start_darv(&self, mut request: DarvRequest) -> Uuid {
        if request.save.directory.is_none() {
            request.save.directory = self.settings.save_directory.clone();
        }
        self.handlers.start_darv(request).await
    }

    pub async fn stop_darv(&self, id: Uuid) -> bool {
        self.handlers.stop_darv(id).await
    }

    // =========================================================================
    // BACKGROUND
    // =========================================================================

    /// Start the cache sweep and the device watcher
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![self.spawn_sweeper(), self.spawn_device_watcher()]
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        let token = self.background.child_token();
        let period = self.settings.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let images = state.images.clone();
                let evicted = match tokio::task::spawn_blocking(move || images.clear()).await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::warn!("Cache sweep failed: {}", e);
                        continue;
                    }
                };
                let collected = state.handlers.gc().await;
                tracing::debug!(
                    "Sweep evicted {} buffered, {} transformed, {} exported; dropped {} finished tasks",
                    evicted.buffered,
                    evicted.transformed,
                    evicted.exported,
                    collected
                );
            }
        })
    }

    fn spawn_device_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        let token = self.background.child_token();
        let mut events = self.bus.subscribe_topic(Topic::Device);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                match event.payload {
                    EventPayload::Device(DeviceEvent::Added { device, kind }) => {
                        tracing::info!("{:?} {} added", kind, device);
                        state.devices.write().await.insert(device, kind);
                    }
                    EventPayload::Device(DeviceEvent::Removed { device, kind }) => {
                        tracing::info!("{:?} {} removed", kind, device);
                        state.devices.write().await.remove(&device);
                        if kind == DeviceKind::Camera {
                            state.handlers.stop_capture(&device).await;
                            state.handlers.stop_flat_wizard(&device).await;
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    /// Stop background work and every running task
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.handlers.stop_all().await;
        tracing::info!("Application state shut down");
    }
}
