/// Top-level grid simulator.
/// Models a device as a platform description plus a pool of worker threads
/// that outlives individual launches, so back-to-back launches reuse the
/// suspended workers instead of spawning new ones.
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::kernel::{Kernel, LaunchConfig};
use crate::platform::PlatformConfig;
use crate::scheduler::{KernelScheduler, LaunchHandle, LaunchMode, LaunchStats};
use crate::work_item::{LaneState, WorkerPool};

pub struct Device {
    /// Platform limits every launch is checked against
    pub platform: PlatformConfig,
    pool: WorkerPool,
    /// Where launches publish live snapshots for the viz, if anywhere
    metrics_path: Option<PathBuf>,
}

impl Default for Device {
    fn default() -> Self {
        Self::new(PlatformConfig::default())
    }
}

impl Device {
    pub fn new(platform: PlatformConfig) -> Self {
        log::info!(
            "initialized device '{}': {} named barriers, {} KiB SLM, max group {}",
            platform.name,
            platform.max_named_barriers,
            platform.slm_max_bytes / 1024,
            platform.max_group_size,
        );
        Device {
            platform,
            pool: WorkerPool::new(),
            metrics_path: None,
        }
    }

    /// Create a device with Xe-HPC-like limits.
    pub fn xe_hpc() -> Self {
        Self::new(PlatformConfig::xe_hpc())
    }

    pub fn with_metrics(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_path = Some(path.into());
        self
    }

    pub fn metrics_path(&self) -> Option<&Path> {
        self.metrics_path.as_deref()
    }

    fn scheduler(&self) -> KernelScheduler<'_> {
        KernelScheduler::new(&self.pool, &self.platform, self.metrics_path.as_deref())
    }

    /// Start a pipelined launch and return without waiting for it.
    pub fn launch(&self, kernel: &Kernel, config: &LaunchConfig, args: &[u8]) -> Result<LaunchHandle> {
        self.scheduler().launch(kernel, config, args, LaunchMode::Pipelined)
    }

    /// Start a serialized launch: one group at a time, in index order.
    pub fn launch_debug(&self, kernel: &Kernel, config: &LaunchConfig, args: &[u8]) -> Result<LaunchHandle> {
        self.scheduler().launch(kernel, config, args, LaunchMode::Debug)
    }

    /// Launch and wait.
    pub fn run(&self, kernel: &Kernel, config: &LaunchConfig, args: &[u8]) -> Result<LaunchStats> {
        self.launch(kernel, config, args)?.wait()
    }

    pub fn run_debug(&self, kernel: &Kernel, config: &LaunchConfig, args: &[u8]) -> Result<LaunchStats> {
        self.launch_debug(kernel, config, args)?.wait()
    }

    /// Workers currently owned by the pool.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn worker_states(&self) -> Vec<LaneState> {
        self.pool.states()
    }
}
