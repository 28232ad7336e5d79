/// Per-group synchronization and memory context, and the double-buffered
/// pair of them that each resident slot cycles through.
///
/// A slot's k-th group runs on buffer `k % 2`. The first lane to reach a free
/// buffer prepares it for the new group; the last lane to retire from a group
/// hands the buffer back. Lanes that race ahead to group k+2 park until the
/// stragglers of group k have retired, so the two buffers overlap by at most
/// one group's tail.
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::barrier::GroupBarrier;
use crate::control::{ABORT_POLL, LaunchControl};
use crate::error::{Result, SimError};
use crate::named_barrier::NamedBarrier;
use crate::platform::PlatformConfig;
use crate::slm::{BroadcastBuffer, SharedScratchpad};

/// Everything the lanes of one group share.
#[derive(Debug)]
pub struct GroupState {
    group_index: AtomicUsize,
    lanes: usize,
    pub slm: SharedScratchpad,
    pub broadcast: BroadcastBuffer,
    pub barrier: GroupBarrier,
    pub aux_barrier: GroupBarrier,
    named: Vec<NamedBarrier>,
    /// Named barriers declared by `nbarrier_init`; 0 means undeclared
    named_in_use: AtomicUsize,
}

impl GroupState {
    pub fn new(lanes: usize, platform: &PlatformConfig) -> Self {
        GroupState {
            group_index: AtomicUsize::new(usize::MAX),
            lanes,
            slm: SharedScratchpad::new(platform.slm_max_bytes),
            broadcast: BroadcastBuffer::new(lanes, platform.broadcast_stride),
            barrier: GroupBarrier::new(lanes),
            aux_barrier: GroupBarrier::new(lanes),
            named: (0..platform.max_named_barriers)
                .map(|id| NamedBarrier::new(id, lanes))
                .collect(),
            named_in_use: AtomicUsize::new(0),
        }
    }

    /// Reset every resource for `group_index`.
    pub fn prepare(&self, group_index: usize) {
        self.slm.reset();
        self.broadcast.reset(self.lanes);
        self.barrier.reset(self.lanes);
        self.aux_barrier.reset(self.lanes);
        for nb in &self.named {
            nb.reset(self.lanes);
        }
        self.named_in_use.store(0, Ordering::Release);
        self.group_index.store(group_index, Ordering::Release);
    }

    pub fn group_index(&self) -> usize {
        self.group_index.load(Ordering::Acquire)
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Declare how many named barriers the kernel uses.
    pub fn init_named(&self, count: usize) -> Result<()> {
        if count > self.named.len() {
            return Err(SimError::BarrierIdOutOfRange {
                id: count,
                limit: self.named.len(),
            });
        }
        self.named_in_use.fetch_max(count, Ordering::AcqRel);
        Ok(())
    }

    /// Named barrier `id`. Ids are checked against the declared count, or
    /// against the platform maximum when the kernel never declared one.
    pub fn named(&self, id: usize) -> Result<&NamedBarrier> {
        let declared = self.named_in_use.load(Ordering::Acquire);
        let limit = if declared == 0 { self.named.len() } else { declared };
        if id >= limit {
            return Err(SimError::BarrierIdOutOfRange { id, limit });
        }
        Ok(&self.named[id])
    }

    pub fn named_barriers(&self) -> &[NamedBarrier] {
        &self.named
    }

    pub fn named_generations(&self) -> u64 {
        self.named.iter().map(|nb| nb.generations()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferPhase {
    Free,
    Active { iteration: usize, group: usize },
    /// Some lanes retired, `remaining` still inside the kernel
    Draining { iteration: usize, group: usize, remaining: usize },
}

#[derive(Debug)]
struct GroupBuffer {
    state: GroupState,
    phase: Mutex<BufferPhase>,
    cvar: Condvar,
}

/// Result of a lane retiring from a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    /// This lane was the last one out; the group is complete
    pub last: bool,
    /// Barrier releases and named-barrier generations the group saw
    pub barrier_releases: u64,
    pub named_generations: u64,
}

/// The Group State buffers owned by one resident slot.
#[derive(Debug)]
pub struct SlotResources {
    slot: usize,
    lanes: usize,
    buffers: Vec<GroupBuffer>,
}

impl SlotResources {
    /// `depth` is 2 for pipelined hand-off, 1 to serialize groups fully.
    pub fn new(slot: usize, lanes: usize, depth: usize, platform: &PlatformConfig) -> Self {
        SlotResources {
            slot,
            lanes,
            buffers: (0..depth.max(1))
                .map(|_| GroupBuffer {
                    state: GroupState::new(lanes, platform),
                    phase: Mutex::new(BufferPhase::Free),
                    cvar: Condvar::new(),
                })
                .collect(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn depth(&self) -> usize {
        self.buffers.len()
    }

    /// Enter the slot's `iteration`-th group, `group`. Blocks while the
    /// buffer still belongs to an older group.
    pub fn acquire(
        &self,
        iteration: usize,
        group: usize,
        control: &LaunchControl,
    ) -> Result<&GroupState> {
        let buf = &self.buffers[iteration % self.buffers.len()];
        let mut phase = buf.phase.lock();
        loop {
            match *phase {
                BufferPhase::Free => {
                    buf.state.prepare(group);
                    *phase = BufferPhase::Active { iteration, group };
                    log::debug!(
                        "slot {} buffer {} -> group {}",
                        self.slot,
                        iteration % self.buffers.len(),
                        group
                    );
                    return Ok(&buf.state);
                }
                BufferPhase::Active { iteration: it, .. }
                | BufferPhase::Draining { iteration: it, .. }
                    if it == iteration =>
                {
                    return Ok(&buf.state);
                }
                _ => {
                    control.check()?;
                    buf.cvar.wait_for(&mut phase, ABORT_POLL);
                }
            }
        }
    }

    /// Leave the `iteration`-th group. The last lane out frees the buffer.
    pub fn retire(&self, iteration: usize) -> Retired {
        let buf = &self.buffers[iteration % self.buffers.len()];
        let mut phase = buf.phase.lock();
        let remaining = match *phase {
            BufferPhase::Active { iteration: it, group } => {
                debug_assert_eq!(it, iteration);
                let remaining = self.lanes - 1;
                *phase = BufferPhase::Draining { iteration, group, remaining };
                remaining
            }
            BufferPhase::Draining { iteration: it, group, remaining } => {
                debug_assert_eq!(it, iteration);
                let remaining = remaining - 1;
                *phase = BufferPhase::Draining { iteration, group, remaining };
                remaining
            }
            BufferPhase::Free => 0,
        };

        if remaining == 0 {
            *phase = BufferPhase::Free;
            buf.cvar.notify_all();
            Retired {
                last: true,
                barrier_releases: buf.state.barrier.releases() + buf.state.aux_barrier.releases(),
                named_generations: buf.state.named_generations(),
            }
        } else {
            Retired {
                last: false,
                barrier_releases: 0,
                named_generations: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn named_ids_follow_declaration() {
        let g = GroupState::new(4, &PlatformConfig::default());
        assert!(g.named(31).is_ok());
        assert!(matches!(
            g.named(32),
            Err(SimError::BarrierIdOutOfRange { id: 32, limit: 32 })
        ));
        g.init_named(2).unwrap();
        assert!(g.named(1).is_ok());
        assert!(matches!(
            g.named(2),
            Err(SimError::BarrierIdOutOfRange { id: 2, limit: 2 })
        ));
        assert!(g.init_named(33).is_err());
    }

    #[test]
    fn prepare_resets_resources() {
        let g = GroupState::new(2, &PlatformConfig::default());
        g.prepare(0);
        g.slm.set_size(256).unwrap();
        g.slm.alloc(256).unwrap();
        g.init_named(4).unwrap();
        g.prepare(2);
        assert_eq!(g.group_index(), 2);
        assert_eq!(g.slm.capacity(), 0);
        assert!(g.named(20).is_ok());
    }

    #[test]
    fn last_lane_out_frees_buffer() {
        let slot = SlotResources::new(0, 2, 2, &PlatformConfig::default());
        let ctl = LaunchControl::new();
        assert_eq!(slot.acquire(0, 0, &ctl).unwrap().group_index(), 0);
        assert_eq!(slot.acquire(0, 0, &ctl).unwrap().group_index(), 0);
        assert!(!slot.retire(0).last);
        assert!(slot.retire(0).last);
        assert_eq!(slot.acquire(2, 4, &ctl).unwrap().group_index(), 4);
    }

    #[test]
    fn fast_lane_waits_for_stragglers_two_groups_back() {
        let slot = Arc::new(SlotResources::new(0, 2, 2, &PlatformConfig::default()));
        let ctl = Arc::new(LaunchControl::new());

        // lane 0 finishes groups 0 and 1 while lane 1 is still in group 0
        slot.acquire(0, 0, &ctl).unwrap();
        slot.acquire(0, 0, &ctl).unwrap();
        slot.retire(0);
        slot.acquire(1, 3, &ctl).unwrap();
        slot.retire(1);

        let fast = {
            let (slot, ctl) = (Arc::clone(&slot), Arc::clone(&ctl));
            thread::spawn(move || slot.acquire(2, 6, &ctl).map(|g| g.group_index()))
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!fast.is_finished());

        assert!(slot.retire(0).last);
        assert_eq!(fast.join().unwrap().unwrap(), 6);
    }

    #[test]
    fn single_buffer_serializes_groups() {
        let slot = SlotResources::new(0, 1, 1, &PlatformConfig::default());
        let ctl = LaunchControl::new();
        slot.acquire(0, 0, &ctl).unwrap();
        assert!(slot.retire(0).last);
        slot.acquire(1, 1, &ctl).unwrap();
        assert!(slot.retire(1).last);
        assert_eq!(slot.depth(), 1);
    }
}
