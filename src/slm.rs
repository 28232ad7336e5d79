/// Group-scoped memory.
///
///   - SharedScratchpad: shared local memory (SLM), one byte buffer per group
///     with a single live allocation per group generation
///   - BroadcastBuffer: a small per-lane slot array used for adjacent-lane
///     exchanges under the auxiliary barrier
///
/// Both follow the read/write-by-address model of plain device memory; the
/// buffers sit behind locks so any lane of the group can touch them.
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SimError};

/// Allocation state of a scratchpad generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlmAllocation {
    Unset,
    Allocated { offset: usize, size: usize },
}

#[derive(Debug)]
struct SlmMeta {
    /// Usable bytes for this generation; 0 until `set_size`
    capacity: usize,
    allocation: SlmAllocation,
}

#[derive(Debug)]
pub struct SharedScratchpad {
    max_bytes: usize,
    meta: Mutex<SlmMeta>,
    data: RwLock<Vec<u8>>,
}

impl SharedScratchpad {
    pub fn new(max_bytes: usize) -> Self {
        SharedScratchpad {
            max_bytes,
            meta: Mutex::new(SlmMeta {
                capacity: 0,
                allocation: SlmAllocation::Unset,
            }),
            data: RwLock::new(Vec::new()),
        }
    }

    /// Start a new generation. The backing buffer is kept and zeroed.
    pub fn reset(&self) {
        let mut meta = self.meta.lock();
        meta.capacity = 0;
        meta.allocation = SlmAllocation::Unset;
        self.data.write().iter_mut().for_each(|b| *b = 0);
    }

    /// Establish the usable capacity. Every lane of a group may call this with
    /// the same size; a different size after an allocation is a conflict.
    pub fn set_size(&self, size: usize) -> Result<()> {
        if size > self.max_bytes {
            return Err(SimError::SlmCapacityExceeded {
                requested: size,
                capacity: self.max_bytes,
            });
        }
        let mut meta = self.meta.lock();
        if matches!(meta.allocation, SlmAllocation::Allocated { .. }) {
            if size != meta.capacity {
                return Err(SimError::SlmCapacityConflict {
                    capacity: meta.capacity,
                    requested: size,
                });
            }
            return Ok(());
        }
        meta.capacity = size;
        let mut data = self.data.write();
        if data.len() < size {
            data.resize(size, 0);
        }
        Ok(())
    }

    /// Record the generation's single allocation and return its offset.
    /// Repeating the same size returns the same offset.
    pub fn alloc(&self, size: usize) -> Result<usize> {
        let mut meta = self.meta.lock();
        if meta.capacity == 0 {
            return Err(SimError::SlmNotInitialized);
        }
        match meta.allocation {
            SlmAllocation::Unset => {
                if size > meta.capacity {
                    return Err(SimError::SlmCapacityExceeded {
                        requested: size,
                        capacity: meta.capacity,
                    });
                }
                meta.allocation = SlmAllocation::Allocated { offset: 0, size };
                Ok(0)
            }
            SlmAllocation::Allocated { offset, size: existing } if existing == size => Ok(offset),
            SlmAllocation::Allocated { size: existing, .. } => Err(SimError::SlmSizeConflict {
                existing,
                requested: size,
            }),
        }
    }

    /// Allocations live for the whole group; freeing is a no-op.
    pub fn free(&self, _offset: usize) {}

    pub fn capacity(&self) -> usize {
        self.meta.lock().capacity
    }

    pub fn allocation(&self) -> SlmAllocation {
        self.meta.lock().allocation
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let meta = self.meta.lock();
        let size = match meta.allocation {
            SlmAllocation::Allocated { offset: base, size } => base + size,
            SlmAllocation::Unset if meta.capacity == 0 => return Err(SimError::SlmNotInitialized),
            SlmAllocation::Unset => meta.capacity,
        };
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(SimError::SlmOutOfBounds { offset, len, size });
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        Ok(self.data.read()[offset..offset + len].to_vec())
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        self.data.write()[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Run `f` over the whole usable region.
    ///
    /// The backing lock is held while `f` runs, so `f` must not call back into
    /// this scratchpad (`read`, `write`, `with_bytes_mut`). It would deadlock.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let capacity = self.capacity();
        let data = self.data.read();
        f(&data[..capacity.min(data.len())])
    }

    /// Mutable variant of [`SharedScratchpad::with_bytes`], with the same
    /// no-reentry rule: `f` runs under the write lock.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let capacity = self.capacity();
        let mut data = self.data.write();
        let end = capacity.min(data.len());
        f(&mut data[..end])
    }
}

/// Per-lane exchange slots, `stride` bytes each.
#[derive(Debug)]
pub struct BroadcastBuffer {
    stride: usize,
    data: RwLock<Vec<u8>>,
}

impl BroadcastBuffer {
    pub fn new(lanes: usize, stride: usize) -> Self {
        BroadcastBuffer {
            stride,
            data: RwLock::new(vec![0; lanes * stride]),
        }
    }

    pub fn reset(&self, lanes: usize) {
        let mut data = self.data.write();
        data.clear();
        data.resize(lanes * self.stride, 0);
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn lanes(&self) -> usize {
        self.data.read().len() / self.stride.max(1)
    }

    fn slot(&self, lane: usize, len: usize) -> Result<usize> {
        if len > self.stride {
            return Err(SimError::BroadcastTooLarge {
                len,
                stride: self.stride,
            });
        }
        if lane >= self.lanes() {
            return Err(SimError::SlmOutOfBounds {
                offset: lane * self.stride,
                len,
                size: self.lanes() * self.stride,
            });
        }
        Ok(lane * self.stride)
    }

    pub fn write(&self, lane: usize, bytes: &[u8]) -> Result<()> {
        let at = self.slot(lane, bytes.len())?;
        self.data.write()[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, lane: usize, len: usize) -> Result<Vec<u8>> {
        let at = self.slot(lane, len)?;
        Ok(self.data.read()[at..at + len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_size_alloc_returns_same_offset() {
        let slm = SharedScratchpad::new(1024);
        slm.set_size(256).unwrap();
        assert_eq!(slm.alloc(256).unwrap(), 0);
        assert_eq!(slm.alloc(256).unwrap(), 0);
        assert_eq!(
            slm.allocation(),
            SlmAllocation::Allocated { offset: 0, size: 256 }
        );
    }

    #[test]
    fn different_size_alloc_conflicts() {
        let slm = SharedScratchpad::new(1024);
        slm.set_size(256).unwrap();
        slm.alloc(128).unwrap();
        assert!(matches!(
            slm.alloc(64),
            Err(SimError::SlmSizeConflict { existing: 128, requested: 64 })
        ));
    }

    #[test]
    fn capacity_is_bounded() {
        let slm = SharedScratchpad::new(1024);
        assert!(matches!(
            slm.set_size(2048),
            Err(SimError::SlmCapacityExceeded { .. })
        ));
        slm.set_size(512).unwrap();
        assert!(matches!(
            slm.alloc(513),
            Err(SimError::SlmCapacityExceeded { requested: 513, capacity: 512 })
        ));
    }

    #[test]
    fn alloc_requires_init() {
        let slm = SharedScratchpad::new(1024);
        assert!(matches!(slm.alloc(16), Err(SimError::SlmNotInitialized)));
    }

    #[test]
    fn resize_after_alloc_conflicts() {
        let slm = SharedScratchpad::new(1024);
        slm.set_size(256).unwrap();
        slm.alloc(256).unwrap();
        slm.set_size(256).unwrap();
        assert!(matches!(
            slm.set_size(512),
            Err(SimError::SlmCapacityConflict { capacity: 256, requested: 512 })
        ));
    }

    #[test]
    fn resize_conflict_names_capacity_not_allocation() {
        let slm = SharedScratchpad::new(1024);
        slm.set_size(256).unwrap();
        slm.alloc(64).unwrap();
        let err = slm.set_size(512).unwrap_err();
        assert!(matches!(err, SimError::SlmCapacityConflict { capacity: 256, requested: 512 }));
        assert!(err.to_string().contains("256 bytes"));
    }

    #[test]
    fn reset_starts_fresh_generation() {
        let slm = SharedScratchpad::new(1024);
        slm.set_size(256).unwrap();
        slm.alloc(256).unwrap();
        slm.write(0, &[7; 8]).unwrap();
        slm.reset();
        assert_eq!(slm.allocation(), SlmAllocation::Unset);
        slm.set_size(128).unwrap();
        assert_eq!(slm.alloc(64).unwrap(), 0);
        assert_eq!(slm.read(0, 8).unwrap(), vec![0; 8]);
    }

    #[test]
    fn accesses_stay_inside_allocation() {
        let slm = SharedScratchpad::new(1024);
        slm.set_size(256).unwrap();
        slm.alloc(16).unwrap();
        slm.write(12, &[1, 2, 3, 4]).unwrap();
        assert_eq!(slm.read(12, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(
            slm.write(14, &[0; 4]),
            Err(SimError::SlmOutOfBounds { size: 16, .. })
        ));
    }

    #[test]
    fn bulk_access_covers_usable_region() {
        let slm = SharedScratchpad::new(1024);
        slm.set_size(16).unwrap();
        let len = slm.with_bytes_mut(|bytes| {
            bytes.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
            bytes.len()
        });
        assert_eq!(len, 16);
        // guard released: plain accessors work again
        assert_eq!(slm.read(12, 4).unwrap(), vec![12, 13, 14, 15]);
        assert_eq!(slm.with_bytes(|bytes| bytes.iter().map(|&b| b as u32).sum::<u32>()), 120);
    }

    #[test]
    fn broadcast_slots_are_strided() {
        let buf = BroadcastBuffer::new(4, 8);
        buf.write(1, &[1; 8]).unwrap();
        buf.write(2, &[2; 4]).unwrap();
        assert_eq!(buf.read(1, 8).unwrap(), vec![1; 8]);
        assert_eq!(buf.read(2, 4).unwrap(), vec![2; 4]);
        assert_eq!(buf.read(0, 8).unwrap(), vec![0; 8]);
        assert!(matches!(
            buf.write(0, &[0; 9]),
            Err(SimError::BroadcastTooLarge { len: 9, stride: 8 })
        ));
        assert!(buf.read(4, 1).is_err());
    }
}
