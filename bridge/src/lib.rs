// Umbra Bridge
//
// Application wiring around the sequencer: logging, settings, and the
// shared state that owns the event bus, image cache and task registries.

mod error;
mod settings;
mod state;

pub use error::*;
pub use settings::*;
pub use state::*;

pub use umbra_imaging as imaging;
pub use umbra_sequencer as sequencer;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Log file prefix inside the log directory
const LOG_FILE_NAME: &str = "umbra.log";

/// Directory given to [`init_logging`], if any
static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Keeps the non-blocking file writer flushing for the life of the process
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Install the global subscriber.
///
/// Console output always; with `log_dir`, also a daily rolling file. The
/// level comes from `RUST_LOG` and defaults to `info`. A directory that
/// cannot be created falls back to console only.
pub fn init_logging(log_dir: Option<&Path>) -> Result<(), BridgeError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    let log_path = log_dir.and_then(|dir| match std::fs::create_dir_all(dir) {
        Ok(()) => Some(dir.to_path_buf()),
        Err(e) => {
            eprintln!("Failed to create log directory {}: {}", dir.display(), e);
            None
        }
    });

    match log_path {
        Some(path) => {
            if LOG_DIR.set(path.clone()).is_err() {
                return Err(BridgeError::AlreadyInitialized("logging"));
            }
            let file_appender = tracing_appender::rolling::daily(&path, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            let file_layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .map_err(|e| BridgeError::Logging(e.to_string()))?;

            tracing::info!("Logging to {}", path.display());
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
                .map_err(|e| BridgeError::Logging(e.to_string()))?;

            tracing::info!("Logging to console only");
        }
    }
    Ok(())
}

pub fn log_directory() -> Option<&'static Path> {
    LOG_DIR.get().map(PathBuf::as_path)
}

/// Today's log file, when file logging is active
pub fn current_log_file() -> Option<PathBuf> {
    LOG_DIR.get().map(|dir| {
        let today = chrono::Local::now().format("%Y-%m-%d");
        dir.join(format!("{}.{}", LOG_FILE_NAME, today))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_initialises_once() {
        let dir = tempfile::tempdir().unwrap();
        init_logging(Some(dir.path())).unwrap();

        assert_eq!(log_directory(), Some(dir.path()));
        let file = current_log_file().unwrap();
        assert!(file.file_name().unwrap().to_string_lossy().starts_with("umbra.log."));

        assert!(init_logging(None).is_err());
    }
}
