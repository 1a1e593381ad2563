use super::DeviceError;
use super::memory::{DeviceAllocation, DeviceMemoryPool};
use crate::buffer::layout::{HASH_SLOT_BYTES, row_unit_bytes};

/// Private device buffers of a single task.
///
/// Holds the projected rows of the task's chunk and the hash table used by
/// global reduction.
#[derive(Debug)]
pub struct WorkingBuffers {
    /// Row slots available for projected rows.
    nitems: usize,
    /// Slots in the private hash table.
    hash_size: usize,
    allocation: DeviceAllocation,
}

impl WorkingBuffers {
    pub fn byte_len(ncols: usize, nitems: usize, hash_size: usize) -> usize {
        nitems
            .saturating_mul(row_unit_bytes(ncols))
            .saturating_add(hash_size.saturating_mul(HASH_SLOT_BYTES))
    }

    pub fn allocate(
        pool: &DeviceMemoryPool,
        ncols: usize,
        nitems: usize,
        hash_size: usize,
    ) -> Result<Self, DeviceError> {
        let allocation = pool.allocate(Self::byte_len(ncols, nitems, hash_size))?;
        Ok(WorkingBuffers {
            nitems,
            hash_size,
            allocation,
        })
    }

    pub fn nitems(&self) -> usize {
        self.nitems
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub fn byte_len_allocated(&self) -> usize {
        self.allocation.len()
    }
}
