/// Platform limits that a launch is validated against.
/// Loaded from JSON or taken from a preset; every field has a default so a
/// partial file only overrides what it names.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub name: String,
    /// Distinct named barriers a group may use
    pub max_named_barriers: usize,
    /// Work items per group, also the bound for named-barrier lane tracking
    pub max_group_size: u32,
    /// Shared local memory capacity per group in bytes
    pub slm_max_bytes: usize,
    /// Bytes reserved per lane in the cross-lane broadcast buffer
    pub broadcast_stride: usize,
    /// No-progress window after which a launch is aborted
    pub parallel_timeout_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            name: "gen12".to_string(),
            max_named_barriers: 32,
            max_group_size: 1024,
            slm_max_bytes: 64 * 1024,
            broadcast_stride: 64,
            parallel_timeout_ms: 30_000,
        }
    }
}

impl PlatformConfig {
    /// Data-center variant with the larger shared local memory.
    pub fn xe_hpc() -> Self {
        PlatformConfig {
            name: "xe_hpc".to_string(),
            slm_max_bytes: 128 * 1024,
            ..PlatformConfig::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("loading platform config from {}", path.display());
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn parallel_timeout(&self) -> Duration {
        Duration::from_millis(self.parallel_timeout_ms)
    }
}
