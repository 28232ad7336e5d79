/// "Who am I" lookups for code that runs inside a kernel body but was not
/// handed the `ItemCtx`, such as per-lane intrinsic helpers.
///
/// The binding is set for exactly one kernel invocation by [`bind`] and
/// cleared when the returned guard drops. Outside a kernel body every query
/// returns `None`.
use std::cell::Cell;
use std::marker::PhantomData;

use crate::kernel::{Axis, Dim3};

/// Coordinates of one work item within one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub local_id: Dim3,
    pub group_id: Dim3,
    pub group_dim: Dim3,
    pub grid_dim: Dim3,
}

impl Identity {
    pub fn new(local_index: u32, group_index: u32, group_dim: Dim3, grid_dim: Dim3) -> Self {
        Identity {
            local_id: group_dim.delinearize(local_index),
            group_id: grid_dim.delinearize(group_index),
            group_dim,
            grid_dim,
        }
    }

    pub fn local_index(&self) -> u32 {
        self.group_dim.linearize(self.local_id)
    }

    pub fn group_index(&self) -> u32 {
        self.grid_dim.linearize(self.group_id)
    }

    /// Flat index across the whole grid.
    pub fn global_index(&self) -> u64 {
        self.group_index() as u64 * self.group_dim.size() as u64 + self.local_index() as u64
    }
}

thread_local! {
    static CURRENT: Cell<Option<Identity>> = const { Cell::new(None) };
}

/// Restores the previous binding on drop. Not `Send`: it must drop on the
/// thread that created it.
#[must_use]
pub struct IdentityGuard {
    previous: Option<Identity>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

pub fn bind(identity: Identity) -> IdentityGuard {
    let previous = CURRENT.with(|c| c.replace(Some(identity)));
    IdentityGuard {
        previous,
        _not_send: PhantomData,
    }
}

pub fn identity() -> Option<Identity> {
    CURRENT.with(|c| c.get())
}

pub fn thread_index(axis: Axis) -> Option<u32> {
    identity().map(|id| id.local_id.get(axis))
}

pub fn group_size(axis: Axis) -> Option<u32> {
    identity().map(|id| id.group_dim.get(axis))
}

pub fn group_index(axis: Axis) -> Option<u32> {
    identity().map(|id| id.group_id.get(axis))
}

pub fn group_count(axis: Axis) -> Option<u32> {
    identity().map(|id| id.grid_dim.get(axis))
}

pub fn linear_thread_index() -> Option<u32> {
    identity().map(|id| id.local_index())
}

pub fn linear_group_size() -> Option<u32> {
    identity().map(|id| id.group_dim.size())
}

pub fn linear_group_index() -> Option<u32> {
    identity().map(|id| id.group_index())
}

pub fn linear_group_count() -> Option<u32> {
    identity().map(|id| id.grid_dim.size())
}
