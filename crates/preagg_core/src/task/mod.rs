//! Reduction tasks and their completion state machine.

mod complete;
mod execute;
mod terminate;

use std::fmt;
use std::sync::Arc;

pub(crate) use self::execute::process_task;
use crate::buffer::{FinalBuffer, FinalBufferRef};
use crate::chunk::RowChunk;
use crate::datum::PartialRow;
use crate::device::Device;
use crate::device::working::WorkingBuffers;
use crate::dispatch::completion::CompletionQueue;
use crate::kernels::ReductionKernels;
use crate::mode::ReductionMode;
use crate::shared_state::SharedAggregationState;

/// Bytes of task metadata sent to, and read back from, the device.
pub const TASK_HEADER_BYTES: usize = 64;

/// How a task resumes after a recoverable failure.
#[derive(Debug, Default)]
pub enum RetryState {
    #[default]
    Fresh,
    /// The final buffer overflowed mid combine. The task's working buffers
    /// are kept and only the rows left over need combining into a new final
    /// buffer.
    RetryWithExistingBuffers { remaining: Vec<PartialRow> },
    /// The working buffers were too small for the chunk. They've been freed
    /// and will be reallocated at the new size.
    RetryWithRegrownBuffers,
}

impl RetryState {
    pub const fn is_fresh(&self) -> bool {
        matches!(self, RetryState::Fresh)
    }

    /// If the input chunk needs to be sent to the device again.
    pub const fn needs_input_transfer(&self) -> bool {
        !matches!(self, RetryState::RetryWithExistingBuffers { .. })
    }
}

/// One unit of work carrying a chunk through the device.
#[derive(Debug)]
pub struct ReductionTask {
    id: usize,
    mode: ReductionMode,
    retry: RetryState,
    /// None for termination tasks.
    input: Option<RowChunk>,
    /// Buffer a termination task drains.
    terminate: Option<Arc<FinalBuffer>>,
    working: Option<WorkingBuffers>,
    final_ref: Option<FinalBufferRef>,
    /// Row slots in the working buffers.
    nitems_real: usize,
    /// Slots in the private hash table.
    hash_size: usize,
    /// If the task has been counted towards its mode's statistics.
    mode_counted: bool,
}

impl ReductionTask {
    pub fn new(id: usize, chunk: RowChunk, has_group_keys: bool) -> Self {
        let nitems = chunk.estimated_rows();
        ReductionTask {
            id,
            mode: if has_group_keys {
                ReductionMode::Undecided
            } else {
                ReductionMode::NoGroup
            },
            retry: RetryState::Fresh,
            input: Some(chunk),
            terminate: None,
            working: None,
            final_ref: None,
            nitems_real: nitems,
            hash_size: nitems,
            mode_counted: false,
        }
    }

    pub fn new_termination(id: usize, buffer: Arc<FinalBuffer>) -> Self {
        ReductionTask {
            id,
            mode: ReductionMode::TerminationOnly,
            retry: RetryState::Fresh,
            input: None,
            terminate: Some(buffer),
            working: None,
            final_ref: None,
            nitems_real: 0,
            hash_size: 0,
            mode_counted: true,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn mode(&self) -> ReductionMode {
        self.mode
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    pub fn nitems_real(&self) -> usize {
        self.nitems_real
    }
}

impl fmt::Display for ReductionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} ({})", self.id, self.mode.as_str())
    }
}

/// Everything a task needs while running.
#[derive(Debug)]
pub struct TaskContext {
    pub shared: SharedAggregationState,
    pub device: Arc<dyn Device>,
    pub kernels: Arc<dyn ReductionKernels>,
    pub completions: CompletionQueue,
}
