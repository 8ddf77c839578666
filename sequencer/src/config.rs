//! Sequencer timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts and pacing shared by all acquisition tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SequencerConfig {
    /// How long to wait for the focuser to report it reached a position
    pub focuser_timeout_ms: u64,
    /// How long to wait for frame data after an exposure completes
    pub blob_timeout_ms: u64,
    /// Interval at which countdowns republish progress and check cancellation
    pub tick_ms: u64,
    /// Inter-frame delays shorter than this skip the WAITING state
    pub min_delay_ms: u64,
    /// Mount settle time between polar alignment points
    pub tppa_settle_ms: u64,
    /// Flat wizard gives up when its exposure interval is narrower than this
    pub flat_min_interval_us: u64,
    /// Broadcast buffer of the event bus
    pub event_buffer_size: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            focuser_timeout_ms: 30_000,
            blob_timeout_ms: 60_000,
            tick_ms: 1_000,
            min_delay_ms: 1_000,
            tppa_settle_ms: 2_500,
            flat_min_interval_us: 1_000,
            event_buffer_size: crate::event::DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl SequencerConfig {
    pub fn focuser_timeout(&self) -> Duration {
        Duration::from_millis(self.focuser_timeout_ms)
    }

    pub fn blob_timeout(&self) -> Duration {
        Duration::from_millis(self.blob_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn tppa_settle(&self) -> Duration {
        Duration::from_millis(self.tppa_settle_ms)
    }
}
