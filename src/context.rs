/// Per-invocation context handed to the kernel body.
/// Carries the work item's coordinates and the group's shared resources:
/// the full barrier (simple and split-phase), the auxiliary barrier, named
/// barriers, shared local memory and the cross-lane broadcast buffer.
use std::cell::Cell;

use crate::barrier::GroupBarrier;
use crate::control::LaunchControl;
use crate::current::Identity;
use crate::error::{Result, SimError};
use crate::group::GroupState;
use crate::kernel::{Axis, Dim3};
use crate::named_barrier::{NamedBarrier, NamedBarrierRole};
use crate::slm::{BroadcastBuffer, SharedScratchpad};

pub struct ItemCtx<'a> {
    identity: Identity,
    group: &'a GroupState,
    control: &'a LaunchControl,
    barrier_sense: Cell<bool>,
    aux_sense: Cell<bool>,
}

impl<'a> ItemCtx<'a> {
    pub fn new(identity: Identity, group: &'a GroupState, control: &'a LaunchControl) -> Self {
        ItemCtx {
            identity,
            group,
            control,
            barrier_sense: Cell::new(false),
            aux_sense: Cell::new(false),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    // ---------------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------------

    pub fn thread_index(&self, axis: Axis) -> u32 {
        self.identity.local_id.get(axis)
    }

    pub fn group_size(&self, axis: Axis) -> u32 {
        self.identity.group_dim.get(axis)
    }

    pub fn group_index(&self, axis: Axis) -> u32 {
        self.identity.group_id.get(axis)
    }

    pub fn group_count(&self, axis: Axis) -> u32 {
        self.identity.grid_dim.get(axis)
    }

    pub fn thread_id(&self) -> Dim3 {
        self.identity.local_id
    }

    pub fn group_id(&self) -> Dim3 {
        self.identity.group_id
    }

    pub fn linear_thread_index(&self) -> u32 {
        self.identity.local_index()
    }

    pub fn linear_group_size(&self) -> u32 {
        self.identity.group_dim.size()
    }

    pub fn linear_group_index(&self) -> u32 {
        self.identity.group_index()
    }

    pub fn linear_group_count(&self) -> u32 {
        self.identity.grid_dim.size()
    }

    /// Flat index across the whole grid: group * group_size + local
    pub fn global_id(&self) -> u64 {
        self.identity.global_index()
    }

    fn lane(&self) -> usize {
        self.identity.local_index() as usize
    }

    // ---------------------------------------------------------------------
    // Group barrier
    // ---------------------------------------------------------------------

    /// Full-group barrier: signal then wait.
    pub fn barrier(&self) -> Result<()> {
        self.barrier_signal();
        self.barrier_wait()
    }

    pub fn barrier_signal(&self) {
        self.group.barrier.signal(self.control);
    }

    pub fn barrier_wait(&self) -> Result<()> {
        let mut sense = self.barrier_sense.get();
        let r = self.group.barrier.wait(&mut sense, self.control);
        self.barrier_sense.set(sense);
        r
    }

    pub fn group_barrier(&self) -> &GroupBarrier {
        &self.group.barrier
    }

    // ---------------------------------------------------------------------
    // Auxiliary barrier
    // ---------------------------------------------------------------------

    pub fn aux_barrier(&self) -> Result<()> {
        self.aux_barrier_signal();
        self.aux_barrier_wait()
    }

    pub fn aux_barrier_signal(&self) {
        self.group.aux_barrier.signal(self.control);
    }

    pub fn aux_barrier_wait(&self) -> Result<()> {
        let mut sense = self.aux_sense.get();
        let r = self.group.aux_barrier.wait(&mut sense, self.control);
        self.aux_sense.set(sense);
        r
    }

    pub fn aux_group_barrier(&self) -> &GroupBarrier {
        &self.group.aux_barrier
    }

    // ---------------------------------------------------------------------
    // Named barriers
    // ---------------------------------------------------------------------

    /// Declare how many named barriers this kernel uses.
    pub fn nbarrier_init(&self, count: usize) -> Result<()> {
        self.group.init_named(count)
    }

    pub fn nbarrier_signal(
        &self,
        id: usize,
        role: NamedBarrierRole,
        producers: u32,
        consumers: u32,
    ) -> Result<()> {
        self.group
            .named(id)?
            .signal(self.lane(), role, producers, consumers, self.control)
    }

    pub fn nbarrier_wait(&self, id: usize) -> Result<()> {
        self.group.named(id)?.wait(self.lane(), self.control)
    }

    /// Signal and wait in one step.
    pub fn nbarrier(
        &self,
        id: usize,
        role: NamedBarrierRole,
        producers: u32,
        consumers: u32,
    ) -> Result<()> {
        self.nbarrier_signal(id, role, producers, consumers)?;
        self.nbarrier_wait(id)
    }

    pub fn named_barrier(&self, id: usize) -> Result<&NamedBarrier> {
        self.group.named(id)
    }

    /// The whole array, declared or not.
    pub fn named_barriers(&self) -> &[NamedBarrier] {
        self.group.named_barriers()
    }

    // ---------------------------------------------------------------------
    // Shared local memory
    // ---------------------------------------------------------------------

    pub fn slm_init(&self, size: usize) -> Result<()> {
        self.group.slm.set_size(size)
    }

    pub fn slm_alloc(&self, size: usize) -> Result<usize> {
        self.group.slm.alloc(size)
    }

    pub fn slm_free(&self, offset: usize) {
        self.group.slm.free(offset)
    }

    pub fn slm_size(&self) -> usize {
        self.group.slm.capacity()
    }

    pub fn slm(&self) -> &SharedScratchpad {
        &self.group.slm
    }

    pub fn slm_read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.group.slm.read(offset, len)
    }

    pub fn slm_write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.group.slm.write(offset, bytes)
    }

    pub fn slm_read_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.group.slm.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn slm_write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.group.slm.write(offset, &value.to_le_bytes())
    }

    pub fn slm_read_u64(&self, offset: usize) -> Result<u64> {
        let bytes = self.group.slm.read(offset, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    pub fn slm_write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.group.slm.write(offset, &value.to_le_bytes())
    }

    pub fn slm_read_f32(&self, offset: usize) -> Result<f32> {
        self.slm_read_u32(offset).map(f32::from_bits)
    }

    pub fn slm_write_f32(&self, offset: usize, value: f32) -> Result<()> {
        self.slm_write_u32(offset, value.to_bits())
    }

    // ---------------------------------------------------------------------
    // Cross-lane broadcast
    // ---------------------------------------------------------------------

    pub fn broadcast_buffer(&self) -> &BroadcastBuffer {
        &self.group.broadcast
    }

    /// Swap `data` with the adjacent lane (`lane ^ 1`).
    ///
    /// Every lane of the group must call this the same number of times. The
    /// entry round keeps a lane from overwriting its slot while the peer may
    /// still be reading the previous exchange; the second round publishes both
    /// halves before anyone reads. A trailing lane without a peer gets its own
    /// data back.
    pub fn exchange_with_neighbor(&self, data: &[u8]) -> Result<Vec<u8>> {
        let buf = &self.group.broadcast;
        if data.len() > buf.stride() {
            return Err(SimError::BroadcastTooLarge {
                len: data.len(),
                stride: buf.stride(),
            });
        }
        let lane = self.lane();
        let peer = lane ^ 1;
        let peer = if peer < self.linear_group_size() as usize { peer } else { lane };

        self.aux_barrier()?;
        buf.write(lane, data)?;
        self.aux_barrier()?;
        buf.read(peer, data.len())
    }
}
