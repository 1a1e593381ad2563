use std::fmt;
use std::sync::Arc;

use preagg_core::device::memory::DeviceMemoryPool;
use preagg_core::device::{Device, StreamWork};
use preagg_error::{Result, ResultExt};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

pub const DEFAULT_PARALLELISM_WIDTH: usize = 32;
pub const DEFAULT_MEMORY_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Number of streams, each backed by a thread.
    pub num_streams: usize,
    /// Threads cooperating in one block.
    pub parallelism_width: usize,
    pub memory_bytes: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            num_streams: num_cpus::get(),
            parallelism_width: DEFAULT_PARALLELISM_WIDTH,
            memory_bytes: DEFAULT_MEMORY_BYTES,
        }
    }
}

/// Device running launched work on a thread pool.
///
/// Work launched on the device completes in any order.
pub struct ThreadedDevice {
    pool: Arc<ThreadPool>,
    width: usize,
    memory: DeviceMemoryPool,
}

impl fmt::Debug for ThreadedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedDevice")
            .field("num_streams", &self.pool.current_num_threads())
            .field("width", &self.width)
            .field("memory", &self.memory)
            .finish()
    }
}

impl ThreadedDevice {
    pub fn try_new(options: DeviceOptions) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .thread_name(|idx| format!("preagg_device_{idx}"))
            .num_threads(options.num_streams.max(1))
            .build()
            .context("Failed to build device thread pool")?;

        debug!(?options, "created threaded device");

        Ok(ThreadedDevice {
            pool: Arc::new(pool),
            width: options.parallelism_width.max(1),
            memory: DeviceMemoryPool::new(options.memory_bytes),
        })
    }

    pub fn num_streams(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Device for ThreadedDevice {
    fn parallelism_width(&self) -> usize {
        self.width
    }

    fn memory(&self) -> &DeviceMemoryPool {
        &self.memory
    }

    fn launch(&self, work: StreamWork) {
        self.pool.spawn(work);
    }
}
