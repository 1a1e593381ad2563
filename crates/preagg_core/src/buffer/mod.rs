//! The shared final buffer and its sizing.

pub mod layout;
pub mod sizing;

use std::sync::Arc;

use parking_lot::Mutex;

use self::layout::FinalBufferLayout;
use crate::device::event::DeviceEvent;
use crate::device::final_table::FinalStorage;

/// Device handles of a final buffer, copied into every task attached to it.
#[derive(Debug, Clone)]
pub struct DeviceHandles {
    pub storage: Arc<FinalStorage>,
    /// Recorded once the hash table initializer has run.
    pub init_event: Arc<DeviceEvent>,
}

/// A device resident hash table and row slot area shared by all tasks of an
/// execution.
///
/// Every buffer instance is drained (or freed) exactly once. The running
/// task counter and detachment state live in the shared aggregation state
/// and are only modified under its lock.
#[derive(Debug)]
pub struct FinalBuffer {
    generation: u64,
    layout: FinalBufferLayout,
    /// None once the buffer's device memory has been released.
    handles: Mutex<Option<DeviceHandles>>,
}

impl FinalBuffer {
    pub(crate) fn new(generation: u64, handles: DeviceHandles) -> Self {
        FinalBuffer {
            generation,
            layout: handles.storage.layout().clone(),
            handles: Mutex::new(Some(handles)),
        }
    }

    /// Sequence number of this buffer within an execution, starting at 0.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn layout(&self) -> &FinalBufferLayout {
        &self.layout
    }

    pub fn is_released(&self) -> bool {
        self.handles.lock().is_none()
    }

    /// Clone the device handles for a task attaching to this buffer.
    pub(crate) fn clone_handles(&self) -> Option<DeviceHandles> {
        self.handles.lock().clone()
    }

    /// Take the device handles. Only the terminator does this.
    pub(crate) fn take_handles(&self) -> Option<DeviceHandles> {
        self.handles.lock().take()
    }
}

/// A task's reference to a final buffer.
#[derive(Debug)]
pub struct FinalBufferRef {
    pub(crate) buffer: Arc<FinalBuffer>,
    pub(crate) handles: DeviceHandles,
}

impl FinalBufferRef {
    pub fn generation(&self) -> u64 {
        self.buffer.generation
    }

    pub fn storage(&self) -> &FinalStorage {
        &self.handles.storage
    }

    pub fn init_event(&self) -> &DeviceEvent {
        &self.handles.init_event
    }

    /// Drop the device handles, keeping only the buffer identity.
    pub(crate) fn into_buffer(self) -> Arc<FinalBuffer> {
        self.buffer
    }
}
