/// Pool planning: decides how many groups can be resident at once and how
/// many OS threads back them, then stripes the grid over the resident slots.
///
/// The resident slot count is the minimum of three independent bounds:
///   1. the launch's resident-group limit
///   2. how many whole groups fit in the parallel-thread limit
///   3. the number of groups in the grid
/// The thread limit is hard: if not even one group fits, the launch is
/// rejected, since every lane of a group must be live for its barriers.
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::kernel::LaunchConfig;
use crate::platform::PlatformConfig;

/// Which bound limited the resident slot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyLimiter {
    ResidentGroupLimit,
    ThreadLimit,
    GridSize,
}

impl std::fmt::Display for OccupancyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OccupancyLimiter::ResidentGroupLimit => write!(f, "resident group limit"),
            OccupancyLimiter::ThreadLimit        => write!(f, "parallel thread limit"),
            OccupancyLimiter::GridSize           => write!(f, "grid size"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPlan {
    pub group_size: u32,
    pub total_groups: u32,
    /// Groups in flight at once (R)
    pub resident_slots: u32,
    /// OS threads backing the launch (P = R * group_size)
    pub pool_threads: u32,
    pub limiter: OccupancyLimiter,
}

impl PoolPlan {
    pub fn compute(config: &LaunchConfig, platform: &PlatformConfig) -> Result<Self> {
        config.validate()?;

        let group_size = config.group_dim.checked_size().unwrap_or(u32::MAX);
        if group_size > platform.max_group_size {
            return Err(SimError::GroupTooLarge {
                group_size,
                max: platform.max_group_size,
            });
        }

        let total_groups = config.num_groups();
        let by_resident = config.resident_group_limit;
        let by_threads = config.parallel_thread_limit / group_size;
        if by_threads == 0 {
            return Err(SimError::ThreadLimitBelowGroupSize {
                thread_limit: config.parallel_thread_limit,
                group_size,
            });
        }
        let by_grid = total_groups;

        let resident_slots = by_resident.min(by_threads).min(by_grid);

        let limiter = if resident_slots == by_grid && by_grid < by_resident.min(by_threads) {
            OccupancyLimiter::GridSize
        } else if resident_slots == by_threads && by_threads < by_resident {
            OccupancyLimiter::ThreadLimit
        } else {
            OccupancyLimiter::ResidentGroupLimit
        };

        Ok(PoolPlan {
            group_size,
            total_groups,
            resident_slots,
            pool_threads: resident_slots * group_size,
            limiter,
        })
    }

    /// Plan used by debug launches: one resident group, so groups run in
    /// index order.
    pub fn serialized(mut self) -> Self {
        if self.resident_slots > 1 {
            self.resident_slots = 1;
            self.pool_threads = self.group_size;
        }
        self
    }

    /// Round-robin stripe of group indices visited by `slot`.
    pub fn groups_for_slot(&self, slot: u32) -> impl Iterator<Item = u32> + use<> {
        let total = self.total_groups;
        (slot..total).step_by(self.resident_slots.max(1) as usize)
    }

    /// Fraction of the thread limit actually used.
    pub fn thread_utilization(&self, config: &LaunchConfig) -> f32 {
        self.pool_threads as f32 / config.parallel_thread_limit as f32
    }
}
