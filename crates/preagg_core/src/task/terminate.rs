use std::sync::Arc;

use preagg_error::{DbError, Result};
use tracing::debug;

use super::{ReductionTask, TaskContext};
use crate::buffer::FinalBuffer;
use crate::dispatch::completion::Completion;
use crate::output::{DrainedBatch, PreAggOutput};
use crate::statistics::DeviceCounters;

/// Drain a final buffer to the host and release its device memory.
///
/// The caller must have been elected as the buffer's terminator. Returns
/// None if the execution was cancelled or aborted, in which case the buffer
/// is freed without being read.
pub(crate) fn terminate_buffer(
    buffer: &FinalBuffer,
    ctx: &TaskContext,
) -> Result<Option<DrainedBatch>> {
    let generation = buffer.generation();
    let handles = buffer.take_handles().ok_or_else(|| {
        DbError::new("Final buffer terminated more than once").with_field("generation", generation)
    })?;
    let counters = ctx.shared.counters();

    if ctx.shared.should_discard() {
        debug!(generation, "freeing final buffer without draining");
        drop(handles);
        DeviceCounters::inc(&counters.buffers_discarded, 1);
        return Ok(None);
    }

    // Can't read anything before the initializer ran.
    handles.init_event.wait();

    if ctx.kernels.has_notbyval() {
        handles.storage.fixup_varlena()?;
        DeviceCounters::inc(&counters.fixup_kernel_launches, 1);
    }

    let rows = handles.storage.copy_to_host()?;
    counters.record_recv(handles.storage.layout().total_bytes());

    debug_assert_eq!(
        1,
        Arc::strong_count(&handles.storage),
        "terminator should hold the last reference to the final buffer storage"
    );
    drop(handles);
    DeviceCounters::inc(&counters.buffers_drained, 1);

    debug!(generation, rows = rows.len(), "drained final buffer");

    Ok(Some(DrainedBatch {
        generation,
        num_rows: rows.len(),
        rows,
    }))
}

/// Run a task created only to terminate a buffer.
pub(crate) fn run_termination_task(task: ReductionTask, ctx: &TaskContext) -> Completion {
    let Some(buffer) = task.terminate else {
        ctx.shared.abort();
        return Completion::failed(
            DbError::new("Termination task without a buffer").with_field("task", task.id),
        );
    };

    match terminate_buffer(&buffer, ctx) {
        Ok(batch) => Completion::done(batch.map(PreAggOutput::Groups).into_iter().collect()),
        Err(err) => {
            ctx.shared.abort();
            Completion::failed(err)
        }
    }
}
