use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::DeviceError;

/// Bounded pool of device memory.
///
/// Cloning produces another handle to the same pool.
#[derive(Debug, Clone)]
pub struct DeviceMemoryPool {
    state: Arc<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    capacity: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
    /// Number of upcoming allocations that should fail regardless of the
    /// available capacity.
    injected_failures: AtomicUsize,
}

impl DeviceMemoryPool {
    pub fn new(capacity: usize) -> Self {
        DeviceMemoryPool {
            state: Arc::new(PoolState {
                capacity,
                used: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                injected_failures: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    pub fn used(&self) -> usize {
        self.state.used.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::Acquire)
    }

    /// Make the next `count` allocations report out of memory.
    pub fn inject_failures(&self, count: usize) {
        self.state.injected_failures.store(count, Ordering::Release);
    }

    pub fn allocate(&self, bytes: usize) -> Result<DeviceAllocation, DeviceError> {
        let injected = self
            .state
            .injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available: self.state.capacity.saturating_sub(self.used()),
            });
        }

        let mut used = self.state.used.load(Ordering::Acquire);
        loop {
            let new_used = match used.checked_add(bytes) {
                Some(new_used) if new_used <= self.state.capacity => new_used,
                _ => {
                    return Err(DeviceError::OutOfMemory {
                        requested: bytes,
                        available: self.state.capacity - used,
                    });
                }
            };

            match self.state.used.compare_exchange_weak(
                used,
                new_used,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.state.peak.fetch_max(new_used, Ordering::AcqRel);
                    return Ok(DeviceAllocation {
                        bytes,
                        state: self.state.clone(),
                    });
                }
                Err(actual) => used = actual,
            }
        }
    }
}

/// A reservation of device memory, returned to the pool on drop.
pub struct DeviceAllocation {
    bytes: usize,
    state: Arc<PoolState>,
}

impl DeviceAllocation {
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.state.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
