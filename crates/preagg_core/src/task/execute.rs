use std::sync::Arc;

use preagg_error::DbError;
use tracing::{trace, warn};

use super::complete::{complete_task, fail_task, finish_skipped};
use super::terminate::run_termination_task;
use super::{RetryState, ReductionTask, TASK_HEADER_BYTES, TaskContext};
use crate::device::reduce::{KernelStatus, ReduceContext, ReduceInput, ReduceOutcome, run_main_kernel};
use crate::device::working::WorkingBuffers;
use crate::dispatch::completion::Completion;
use crate::mode::ReductionMode;
use crate::shared_state::AttachOutcome;
use crate::statistics::DeviceCounters;

/// Process a task submitted by the dispatcher.
///
/// Sets up device resources for the task and launches its kernels. The
/// task's completion is always pushed to the context's completion queue,
/// either directly if the task couldn't be launched, or from the device once
/// it finishes.
pub(crate) fn process_task(mut task: ReductionTask, ctx: &Arc<TaskContext>) {
    if task.mode == ReductionMode::TerminationOnly {
        let task_ctx = ctx.clone();
        ctx.device.launch(Box::new(move || {
            let completion = run_termination_task(task, &task_ctx);
            task_ctx.completions.push(completion);
        }));
        return;
    }

    if ctx.shared.should_discard() {
        ctx.completions.push(finish_skipped(task, ctx));
        return;
    }

    if task.mode == ReductionMode::Undecided {
        task.mode = ctx
            .shared
            .config()
            .force_reduction_mode
            .unwrap_or_else(|| ctx.shared.choose_mode(task.nitems_real));
    }

    if task.working.is_none() {
        let working = WorkingBuffers::allocate(
            ctx.device.memory(),
            ctx.kernels.num_columns(),
            task.nitems_real,
            task.hash_size,
        );
        match working {
            Ok(working) => task.working = Some(working),
            Err(err) if err.is_out_of_memory() => {
                warn!(%err, task = task.id, "no device memory for working buffers");
                ctx.completions.push(Completion::retry_later(task));
                return;
            }
            Err(err) => {
                ctx.completions.push(fail_task(task, err.into(), ctx));
                return;
            }
        }
    }

    if task.final_ref.is_none() {
        match ctx.shared.attach_final_buffer(ctx.device.as_ref()) {
            Ok(AttachOutcome::Attached(fref)) => task.final_ref = Some(fref),
            Ok(AttachOutcome::RetryLater) => {
                // Give memory back so other tasks can make progress. Tasks
                // mid retry keep theirs, they've already done work with it.
                if task.retry.is_fresh() {
                    task.working = None;
                }
                ctx.completions.push(Completion::retry_later(task));
                return;
            }
            Err(err) => {
                ctx.completions.push(fail_task(task, err, ctx));
                return;
            }
        }
    }

    if !task.mode_counted {
        ctx.shared.count_mode(task.mode);
        task.mode_counted = true;
    }

    let mut send_bytes = TASK_HEADER_BYTES;
    if task.retry.needs_input_transfer() {
        send_bytes += task.input.as_ref().map_or(0, |chunk| chunk.byte_len());
    }
    ctx.shared.counters().record_send(send_bytes);

    trace!(task = task.id, mode = task.mode.as_str(), send_bytes, "launching main kernel");

    let task_ctx = ctx.clone();
    ctx.device.launch(Box::new(move || {
        let outcome = run_main(&mut task, &task_ctx);
        let completion = complete_task(task, outcome, &task_ctx);
        task_ctx.completions.push(completion);
    }));
}

fn run_main(task: &mut ReductionTask, ctx: &TaskContext) -> ReduceOutcome {
    let counters = ctx.shared.counters();
    DeviceCounters::inc(&counters.main_kernel_launches, 1);

    let input = match &mut task.retry {
        RetryState::RetryWithExistingBuffers { remaining } => {
            ReduceInput::Remaining(std::mem::take(remaining))
        }
        RetryState::Fresh | RetryState::RetryWithRegrownBuffers => match &task.input {
            Some(chunk) => ReduceInput::Chunk(chunk),
            None => return missing_resource("input chunk"),
        },
    };

    let Some(working) = &task.working else {
        return missing_resource("working buffers");
    };
    let Some(fref) = &task.final_ref else {
        return missing_resource("final buffer");
    };

    let reduce_ctx = ReduceContext {
        kernels: ctx.kernels.as_ref(),
        mode: task.mode,
        block_width: ctx.device.parallelism_width(),
        working,
        storage: fref.storage(),
        init_event: fref.init_event(),
        salt_offset: task.id,
    };

    run_main_kernel(&reduce_ctx, input)
}

fn missing_resource(what: &str) -> ReduceOutcome {
    ReduceOutcome {
        status: KernelStatus::Fatal(
            DbError::new("Main kernel launched without a required resource")
                .with_field("resource", what),
        ),
        remaining: Vec::new(),
        rows_in: 0,
        combine: Default::default(),
    }
}
