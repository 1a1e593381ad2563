use preagg_error::DbError;
use tracing::{debug, error};

use super::terminate::terminate_buffer;
use super::{RetryState, ReductionTask, TASK_HEADER_BYTES, TaskContext};
use crate::device::reduce::{KernelStatus, ReduceOutcome};
use crate::dispatch::completion::{Completion, NextStep};
use crate::mode::ReductionMode;
use crate::output::PreAggOutput;
use crate::shared_state::{ReleaseReason, TaskProgress};
use crate::statistics::DeviceCounters;

/// Drive a task to its next state based on the main kernel's status.
///
/// Runs on the device after the main kernel. Every path releases the task's
/// final buffer reference exactly once.
pub(crate) fn complete_task(
    mut task: ReductionTask,
    outcome: ReduceOutcome,
    ctx: &TaskContext,
) -> Completion {
    let counters = ctx.shared.counters();
    counters.record_recv(TASK_HEADER_BYTES);

    let progress = TaskProgress {
        rows_in: 0,
        groups_added: outcome.combine.new_groups,
        extra_added: outcome.combine.extra_used,
        succeeded: false,
    };

    match outcome.status {
        KernelStatus::Success => {
            task.working = None;
            let progress = TaskProgress {
                rows_in: task.input.as_ref().map_or(0, |chunk| chunk.num_rows()),
                succeeded: true,
                ..progress
            };
            let elected = ctx.shared.release_final_buffer(
                task.final_ref.take(),
                ReleaseReason::Completed,
                progress,
            );

            // The task turns into a termination task for the first elected
            // buffer. Any others get their own.
            let mut elected = elected.into_iter();
            let Some(buffer) = elected.next() else {
                return Completion::done(Vec::new());
            };
            task.mode = ReductionMode::TerminationOnly;
            task.input = None;

            let mut completion = match terminate_buffer(&buffer, ctx) {
                Ok(batch) => Completion::done(batch.map(PreAggOutput::Groups).into_iter().collect()),
                Err(err) => {
                    ctx.shared.abort();
                    Completion::failed(err)
                }
            };
            completion.terminate.extend(elected);
            completion
        }
        KernelStatus::CpuReCheck => {
            task.working = None;
            let elected = ctx.shared.release_final_buffer(
                task.final_ref.take(),
                ReleaseReason::Completed,
                progress,
            );

            let outputs = match task.input.take() {
                Some(chunk) => {
                    DeviceCounters::inc(&counters.fallback_rows, chunk.num_rows());
                    debug!(task = task.id, rows = chunk.num_rows(), "chunk needs cpu recheck");
                    vec![PreAggOutput::Fallback(chunk)]
                }
                None => Vec::new(),
            };

            Completion {
                outputs,
                terminate: elected,
                next: NextStep::Done,
            }
        }
        KernelStatus::NoSpace {
            final_in_progress: true,
        } => {
            DeviceCounters::inc(&counters.overflow_retries, 1);
            let remaining = outcome.remaining;
            let remaining_extra = remaining
                .iter()
                .flatten()
                .map(|datum| datum.out_of_line_len())
                .sum();
            let elected = ctx.shared.release_final_buffer(
                task.final_ref.take(),
                ReleaseReason::Overflow {
                    remaining: remaining.len(),
                    remaining_extra,
                },
                progress,
            );
            debug!(task = task.id, remaining = remaining.len(), "final buffer overflow, retrying with existing buffers");
            task.retry = RetryState::RetryWithExistingBuffers { remaining };

            Completion {
                outputs: Vec::new(),
                terminate: elected,
                next: NextStep::Resubmit(task),
            }
        }
        KernelStatus::NoSpace {
            final_in_progress: false,
        } => {
            DeviceCounters::inc(&counters.regrow_retries, 1);
            task.working = None;
            let elected = ctx.shared.release_final_buffer(
                task.final_ref.take(),
                ReleaseReason::Retry,
                progress,
            );

            let prev_nitems = task.nitems_real;
            task.nitems_real = task.nitems_real.max(outcome.rows_in);
            task.hash_size = if task.nitems_real > prev_nitems {
                task.nitems_real
            } else {
                // Rows fit, the private hash table didn't.
                (task.hash_size * 2).max(1)
            };
            if task.mode != ReductionMode::NoGroup {
                task.mode = ReductionMode::Undecided;
            }
            task.retry = RetryState::RetryWithRegrownBuffers;
            debug!(
                task = task.id,
                nitems = task.nitems_real,
                hash_size = task.hash_size,
                "working buffers too small, retrying with regrown buffers"
            );

            Completion {
                outputs: Vec::new(),
                terminate: elected,
                next: NextStep::Resubmit(task),
            }
        }
        KernelStatus::Fatal(err) => fail_task(task, err, ctx),
    }
}

/// Fail the execution from a task.
///
/// Aborts the shared state so remaining tasks skip their work, then releases
/// the task's resources. Buffers elected here are freed without draining.
pub(crate) fn fail_task(mut task: ReductionTask, err: DbError, ctx: &TaskContext) -> Completion {
    error!(%err, task = task.id, "reduction task failed");
    ctx.shared.abort();

    task.working = None;
    let elected = ctx.shared.release_final_buffer(
        task.final_ref.take(),
        ReleaseReason::Completed,
        TaskProgress::default(),
    );
    for buffer in elected {
        if let Err(err) = terminate_buffer(&buffer, ctx) {
            error!(%err, generation = buffer.generation(), "failed to free final buffer");
        }
    }

    Completion::failed(err)
}

/// Complete a task that was submitted after the execution was cancelled or
/// aborted, without launching anything.
pub(crate) fn finish_skipped(mut task: ReductionTask, ctx: &TaskContext) -> Completion {
    task.working = None;
    let elected = ctx.shared.release_final_buffer(
        task.final_ref.take(),
        ReleaseReason::Completed,
        TaskProgress::default(),
    );
    for buffer in elected {
        if let Err(err) = terminate_buffer(&buffer, ctx) {
            error!(%err, generation = buffer.generation(), "failed to free final buffer");
        }
    }

    Completion::done(Vec::new())
}
