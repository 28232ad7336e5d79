/// Kernel definitions and launch configuration.
/// A kernel is a function that every work item executes, identified by its
/// local/group coordinates, mirroring the OpenCL/CM NDRange execution model.
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ItemCtx;
use crate::error::{Result, SimError};

/// One axis of a 3D index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

/// 3D dimension struct used for grid and group sizes (mirrors CUDA's dim3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D configs
    pub fn x(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    /// Total number of items spanned by these dimensions, or `None` when the
    /// product does not fit in a `u32`.
    pub fn checked_size(&self) -> Option<u32> {
        self.x.checked_mul(self.y)?.checked_mul(self.z)
    }

    /// Like [`Dim3::checked_size`] but saturating at `u32::MAX`.
    /// `LaunchConfig::validate` rejects grids that would saturate.
    pub fn size(&self) -> u32 {
        self.checked_size().unwrap_or(u32::MAX)
    }

    pub fn get(&self, axis: Axis) -> u32 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn has_zero(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }

    /// Row-major linearization of `coord` within `self` (x fastest).
    pub fn linearize(&self, coord: Dim3) -> u32 {
        (coord.z * self.y + coord.y) * self.x + coord.x
    }

    /// Inverse of [`Dim3::linearize`].
    pub fn delinearize(&self, flat: u32) -> Dim3 {
        let x = flat % self.x;
        let y = (flat / self.x) % self.y;
        let z = flat / (self.x * self.y);
        Dim3::new(x, y, z)
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Configuration for launching a kernel: how many groups (grid), how many
/// work items per group, and how much of the grid may be in flight at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub grid_dim: Dim3,
    pub group_dim: Dim3,
    /// Upper bound on groups resident at the same time
    pub resident_group_limit: u32,
    /// Hard bound on OS threads backing the launch
    pub parallel_thread_limit: u32,
    /// Overrides the platform's no-progress timeout
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl LaunchConfig {
    /// Defaults to a single resident group with exactly enough threads for it.
    pub fn new(grid_dim: Dim3, group_dim: Dim3) -> Self {
        LaunchConfig {
            grid_dim,
            group_dim,
            resident_group_limit: 1,
            parallel_thread_limit: group_dim.size(),
            timeout: None,
        }
    }

    pub fn with_limits(mut self, resident_group_limit: u32, parallel_thread_limit: u32) -> Self {
        self.resident_group_limit = resident_group_limit;
        self.parallel_thread_limit = parallel_thread_limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Total number of groups in the grid
    pub fn num_groups(&self) -> u32 {
        self.grid_dim.size()
    }

    /// Total number of work items per group
    pub fn group_size(&self) -> u32 {
        self.group_dim.size()
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid_dim.has_zero() {
            return Err(SimError::InvalidDimensions {
                what: "grid",
                x: self.grid_dim.x,
                y: self.grid_dim.y,
                z: self.grid_dim.z,
            });
        }
        if self.group_dim.has_zero() {
            return Err(SimError::InvalidDimensions {
                what: "group",
                x: self.group_dim.x,
                y: self.group_dim.y,
                z: self.group_dim.z,
            });
        }
        if self.grid_dim.checked_size().is_none() {
            return Err(SimError::InvalidDimensions {
                what: "grid",
                x: self.grid_dim.x,
                y: self.grid_dim.y,
                z: self.grid_dim.z,
            });
        }
        if self.resident_group_limit == 0 || self.parallel_thread_limit == 0 {
            return Err(SimError::InvalidLimits {
                resident_group_limit: self.resident_group_limit,
                parallel_thread_limit: self.parallel_thread_limit,
            });
        }
        Ok(())
    }
}

pub type KernelFn = dyn Fn(&ItemCtx<'_>, &[u8]) -> Result<()> + Send + Sync;

/// A kernel: a named function executed by every work item in the launch grid.
/// Cloning is cheap, the body is shared.
#[derive(Clone)]
pub struct Kernel {
    pub name: Arc<str>,
    pub func: Arc<KernelFn>,
}

impl Kernel {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&ItemCtx<'_>, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        Kernel {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}
