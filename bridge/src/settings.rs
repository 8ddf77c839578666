//! Application settings stored as JSON

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use umbra_imaging::ImagingConfig;
use umbra_sequencer::SequencerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub sequencer: SequencerConfig,
    pub imaging: ImagingConfig,
    /// Default directory for saved frames when a request names none
    pub save_directory: Option<PathBuf>,
    pub log_directory: Option<PathBuf>,
    /// How often the image cache is swept and finished tasks dropped
    pub sweep_interval_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            sequencer: SequencerConfig::default(),
            imaging: ImagingConfig::default(),
            save_directory: None,
            log_directory: None,
            sweep_interval_ms: 10_000,
        }
    }
}

impl AppSettings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(BridgeError::read(path, e)),
        };
        serde_json::from_str(&contents).map_err(|e| BridgeError::parse(path, e))
    }

    /// Write settings as pretty JSON, creating the parent directory
    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BridgeError::write(path, e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| BridgeError::write(path, e))?;
        std::fs::write(path, json).map_err(|e| BridgeError::write(path, e))?;
        tracing::debug!("Settings saved to {}", path.display());
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = AppSettings::default();
        settings.save_directory = Some(PathBuf::from("/data/frames"));
        settings.sequencer.focuser_timeout_ms = 45_000;
        settings.save(&path).unwrap();

        assert_eq!(AppSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"imaging": {"cacheTtlMs": 5000}, "sweepIntervalMs": 2000}"#).unwrap();

        let settings = AppSettings::load(&path).unwrap();
        assert_eq!(settings.imaging.cache_ttl_ms, 5000);
        assert_eq!(settings.imaging.jpeg_quality, 85);
        assert_eq!(settings.sweep_interval(), Duration::from_secs(2));
        assert_eq!(settings.sequencer, SequencerConfig::default());
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = AppSettings::load(&path).unwrap_err();
        assert!(matches!(err, BridgeError::SettingsParse { .. }));
    }
}
