//! Error types for acquisition tasks
//!
//! Errors never escape a task: every variant ends up as the failure message
//! of the task's final IDLE event. They exist so the steps inside a task can
//! use `?` and so timeouts stay distinguishable from other failures.

use std::time::Duration;
use thiserror::Error;

/// Outcome of waiting for a device or a timer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WaitError {
    #[error("Timed out after {}s waiting for {what}", .after.as_secs_f64())]
    Timeout { what: String, after: Duration },

    #[error("Cancelled")]
    Cancelled,

    #[error("{device} reported an alert on {property}")]
    Alert { device: String, property: String },

    #[error("{device} aborted the {property}")]
    Aborted { device: String, property: String },

    #[error("Event bus closed")]
    Closed,
}

/// Failure of a task step
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Device command failed: {0}")]
    Device(String),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("{service} failed: {message}")]
    Collaborator { service: &'static str, message: String },

    #[error("{0}")]
    Convergence(String),

    #[error("Image processing failed: {0}")]
    Imaging(String),

    #[error("{0} is not configured")]
    MissingCollaborator(&'static str),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Wait(WaitError::Cancelled))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Wait(WaitError::Timeout { .. }))
    }

    pub(crate) fn collaborator(service: &'static str, err: impl std::fmt::Display) -> Self {
        TaskError::Collaborator {
            service,
            message: err.to_string(),
        }
    }
}

impl From<umbra_imaging::ImagingError> for TaskError {
    fn from(e: umbra_imaging::ImagingError) -> Self {
        TaskError::Imaging(e.to_string())
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
