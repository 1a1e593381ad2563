//! Device collaborator interfaces and the runtime kernels that the scheduler
//! launches on them.

pub mod event;
pub mod final_table;
pub mod memory;
pub mod reduce;
pub mod working;

use std::error::Error;
use std::fmt::{self, Debug};

use preagg_error::DbError;

use self::memory::DeviceMemoryPool;

/// Work submitted to a device stream.
pub type StreamWork = Box<dyn FnOnce() + Send + 'static>;

/// A device capable of running reduction kernels.
pub trait Device: Debug + Sync + Send {
    /// Number of threads cooperating in one block. Drives the block-local
    /// reduction and the distribution salt.
    fn parallelism_width(&self) -> usize;

    fn memory(&self) -> &DeviceMemoryPool;

    /// Launch work on one of the device's streams.
    ///
    /// Implementations may run the work before returning, but must never wait
    /// on other launched work.
    fn launch(&self, work: StreamWork);
}

/// Device that runs all work on the calling thread.
///
/// Launch order is completion order which makes scheduling deterministic.
#[derive(Debug)]
pub struct InlineDevice {
    width: usize,
    memory: DeviceMemoryPool,
}

impl InlineDevice {
    pub fn new(width: usize, memory_capacity: usize) -> Self {
        InlineDevice {
            width: width.max(1),
            memory: DeviceMemoryPool::new(memory_capacity),
        }
    }
}

impl Device for InlineDevice {
    fn parallelism_width(&self) -> usize {
        self.width
    }

    fn memory(&self) -> &DeviceMemoryPool {
        &self.memory
    }

    fn launch(&self, work: StreamWork) {
        work()
    }
}

#[derive(Debug)]
pub enum DeviceError {
    /// Not enough device memory for the request. Always recoverable.
    OutOfMemory { requested: usize, available: usize },
    Fatal(DbError),
}

impl DeviceError {
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, DeviceError::OutOfMemory { .. })
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "Out of device memory (requested: {requested}, available: {available})"
            ),
            Self::Fatal(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DeviceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Fatal(err) => Some(err),
            Self::OutOfMemory { .. } => None,
        }
    }
}

impl From<DeviceError> for DbError {
    fn from(value: DeviceError) -> Self {
        match value {
            DeviceError::Fatal(err) => err,
            DeviceError::OutOfMemory {
                requested,
                available,
            } => DbError::new("Out of device memory")
                .with_field("requested", requested)
                .with_field("available", available),
        }
    }
}
