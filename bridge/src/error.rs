//! Error types for the bridge layer
//!
//! Task failures never reach this layer; they are reported through the final
//! IDLE event of each task. What remains is start-up: settings files and
//! logging.

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    // =========================================================================
    // Settings
    // =========================================================================

    #[error("Failed to read settings {path}: {reason}")]
    SettingsRead { path: String, reason: String },

    #[error("Invalid settings in {path}: {reason}")]
    SettingsParse { path: String, reason: String },

    #[error("Failed to write settings {path}: {reason}")]
    SettingsWrite { path: String, reason: String },

    // =========================================================================
    // Initialisation
    // =========================================================================

    #[error("Logging initialisation failed: {0}")]
    Logging(String),

    #[error("Already initialised: {0}")]
    AlreadyInitialized(&'static str),
}

impl BridgeError {
    pub(crate) fn read(path: &Path, err: impl std::fmt::Display) -> Self {
        BridgeError::SettingsRead {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn parse(path: &Path, err: impl std::fmt::Display) -> Self {
        BridgeError::SettingsParse {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn write(path: &Path, err: impl std::fmt::Display) -> Self {
        BridgeError::SettingsWrite {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
