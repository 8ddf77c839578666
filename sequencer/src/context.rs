//! Shared dependencies handed to every task

use crate::config::SequencerConfig;
use crate::device_ops::{
    FocusFitterFactory, PolarSolverFactory, SharedDeviceGateway, SharedGuider, SharedPlateSolver,
    SharedStarDetector,
};
use crate::event::SharedEventBus;
use std::sync::Arc;
use umbra_imaging::SharedImageProcessor;

/// Everything a task needs besides its request. Cheap to clone.
#[derive(Clone)]
pub struct TaskContext {
    pub gateway: SharedDeviceGateway,
    pub bus: SharedEventBus,
    pub images: SharedImageProcessor,
    pub config: Arc<SequencerConfig>,
    pub guider: Option<SharedGuider>,
    pub star_detector: Option<SharedStarDetector>,
    pub plate_solver: Option<SharedPlateSolver>,
    /// Defaults to [`crate::focus_curve::CurveFitter`]
    pub focus_fitter: Option<FocusFitterFactory>,
    /// Defaults to [`crate::polar_align::ThreePointSolver`]
    pub polar_solver: Option<PolarSolverFactory>,
}

impl TaskContext {
    pub fn new(
        gateway: SharedDeviceGateway,
        bus: SharedEventBus,
        images: SharedImageProcessor,
        config: SequencerConfig,
    ) -> Self {
        Self {
            gateway,
            bus,
            images,
            config: Arc::new(config),
            guider: None,
            star_detector: None,
            plate_solver: None,
            focus_fitter: None,
            polar_solver: None,
        }
    }

    pub fn with_guider(mut self, guider: SharedGuider) -> Self {
        self.guider = Some(guider);
        self
    }

    pub fn with_star_detector(mut self, detector: SharedStarDetector) -> Self {
        self.star_detector = Some(detector);
        self
    }

    pub fn with_plate_solver(mut self, solver: SharedPlateSolver) -> Self {
        self.plate_solver = Some(solver);
        self
    }

    pub fn with_focus_fitter(mut self, factory: FocusFitterFactory) -> Self {
        self.focus_fitter = Some(factory);
        self
    }

    pub fn with_polar_solver(mut self, factory: PolarSolverFactory) -> Self {
        self.polar_solver = Some(factory);
        self
    }
}
