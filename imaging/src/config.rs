use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default idle time before a cache entry is evicted
pub const DEFAULT_CACHE_TTL_MS: u64 = 60_000;

/// Imaging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImagingConfig {
    /// Entries untouched for longer than this are evicted by `clear`
    pub cache_ttl_ms: u64,
    /// Quality used for JPEG exports (1-100)
    pub jpeg_quality: u8,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            jpeg_quality: 85,
        }
    }
}

impl ImagingConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}
