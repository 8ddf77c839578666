//! Umbra sequencer
//!
//! Long-running acquisition tasks (capture, autofocus, flat wizard, polar
//! alignment, drift alignment) driven entirely by device property updates on
//! the [`EventBus`]. Devices are commanded through [`DeviceGateway`] and the
//! heavy lifting that happens elsewhere (star detection, plate solving,
//! guiding) is reached through the collaborator traits in [`device_ops`].
//!
//! Every task exposes `run(token)` returning its final IDLE event. The
//! [`TaskHandlers`] registry keeps at most one task per device key.

pub mod autofocus;
pub mod capture;
pub mod config;
pub mod context;
pub mod darv;
pub mod device;
pub mod device_ops;
pub mod error;
pub mod event;
pub mod flat_wizard;
pub mod focus_curve;
pub mod handler;
pub mod polar_align;
pub mod request;
pub mod wait;

#[cfg(test)]
mod testing;

pub use autofocus::{AutoFocusTask, AutofocusEvent, AutofocusRequest, AutofocusState};
pub use capture::{CameraCaptureTask, CaptureEvent, CaptureOutcome, CaptureState, Progress};
pub use config::SequencerConfig;
pub use context::TaskContext;
pub use darv::{DarvEvent, DarvRequest, DarvState, DarvTask};
pub use device::{DeviceEvent, DeviceId, DeviceKind, DeviceProperty, Direction, PropertyState, PropertyUpdate};
pub use device_ops::{
    DeviceGateway, DeviceResult, ExposureSettings, NullDeviceGateway, PlateSolver, SharedDeviceGateway, StarDetector,
};
pub use error::{TaskError, TaskResult, WaitError};
pub use event::{BusEvent, EventBus, EventPayload, SharedEventBus, Subscription, Topic};
pub use flat_wizard::{FlatWizardEvent, FlatWizardRequest, FlatWizardState, FlatWizardTask};
pub use focus_curve::{CurveFitter, CurveModel, FocusChart, FocusFitSettings};
pub use handler::{TaskHandler, TaskHandlers, TaskKey};
pub use polar_align::{ThreePointSolver, TppaEvent, TppaRequest, TppaState, TppaTask};
pub use request::{CaptureRequest, ExposureMode, FrameType, SavePolicy, TimeUnit, TimeValue};
