//! Submitting tasks to the device and collecting their results.

pub mod completion;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use preagg_error::{DbError, Result};
use tracing::{debug, info, warn};

use self::completion::{Completion, CompletionQueue, NextStep};
use crate::buffer::FinalBuffer;
use crate::chunk::{RowChunk, RowSource};
use crate::config::PreAggConfig;
use crate::device::Device;
use crate::explain::{ExplainConfig, ExplainEntry, Explainable};
use crate::kernels::ReductionKernels;
use crate::mode::ReductionMode;
use crate::output::PreAggOutput;
use crate::plan::PlanEstimates;
use crate::shared_state::SharedAggregationState;
use crate::statistics::{DeviceCounters, PreAggStatistics};
use crate::task::{ReductionTask, TaskContext, process_task};

/// Executes pre-aggregations on a device.
#[derive(Debug, Clone)]
pub struct PreAggExecutor {
    device: Arc<dyn Device>,
    config: PreAggConfig,
}

impl PreAggExecutor {
    pub fn new(device: Arc<dyn Device>, config: PreAggConfig) -> Self {
        PreAggExecutor { device, config }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn config(&self) -> &PreAggConfig {
        &self.config
    }

    /// Start a pre-aggregation over the rows produced by `source`.
    ///
    /// Nothing is submitted until the returned stream is polled.
    pub fn execute(
        &self,
        kernels: Arc<dyn ReductionKernels>,
        plan: PlanEstimates,
        source: Box<dyn RowSource>,
    ) -> Result<PreAggStream> {
        let has_keys = kernels.num_group_keys() > 0;
        match self.config.force_reduction_mode {
            Some(ReductionMode::NoGroup) if has_keys => {
                return Err(DbError::new("Cannot force nogroup reduction with group keys")
                    .with_field("group_keys", kernels.num_group_keys()));
            }
            Some(mode) if mode.is_grouped() && !has_keys => {
                return Err(DbError::new("Cannot force grouped reduction without group keys")
                    .with_field("mode", mode.as_str()));
            }
            _ => (),
        }

        let shared = SharedAggregationState::new(
            self.config.clone(),
            plan,
            kernels.as_ref(),
            self.device.parallelism_width(),
        );

        info!(
            predicted = shared.predicted_mode().as_str(),
            plan_rows = plan.rows,
            plan_groups = plan.groups,
            width = self.device.parallelism_width(),
            "starting pre-aggregation"
        );

        Ok(PreAggStream {
            ctx: Arc::new(TaskContext {
                shared,
                device: self.device.clone(),
                kernels,
                completions: CompletionQueue::new(),
            }),
            source,
            has_keys,
            lookahead: None,
            primed: false,
            source_done: false,
            next_task_id: 0,
            running: 0,
            ready: VecDeque::new(),
            deferred: VecDeque::new(),
            outputs: VecDeque::new(),
            oom_streak: 0,
            error: None,
            finished: false,
        })
    }
}

/// Handle for cancelling an execution from another thread.
#[derive(Debug, Clone)]
pub struct PreAggHandle {
    shared: SharedAggregationState,
    completions: CompletionQueue,
}

impl PreAggHandle {
    /// Cancel the execution.
    ///
    /// Tasks already on the device run to completion, and buffers are freed
    /// without being drained. The stream errors once everything has settled.
    pub fn cancel(&self) {
        self.shared.cancel();
        self.completions.wake();
    }

    pub fn statistics(&self) -> PreAggStatistics {
        self.shared.statistics()
    }
}

/// A running pre-aggregation.
///
/// Pulls chunks from the source, keeping up to `max_inflight_tasks` tasks on
/// the device, and yields drained groups and fallback chunks as they become
/// available.
pub struct PreAggStream {
    ctx: Arc<TaskContext>,
    source: Box<dyn RowSource>,
    has_keys: bool,
    /// Next chunk from the source. Lets us know which task is the last.
    lookahead: Option<RowChunk>,
    /// Whether the first chunk has been pulled.
    primed: bool,
    source_done: bool,
    next_task_id: usize,
    /// Submitted tasks that haven't completed yet, termination tasks
    /// included.
    running: usize,
    ready: VecDeque<ReductionTask>,
    /// Tasks waiting for device memory to be freed.
    deferred: VecDeque<ReductionTask>,
    outputs: VecDeque<PreAggOutput>,
    /// Deferred tasks resubmitted with nothing else running since the last
    /// completion that made progress.
    oom_streak: usize,
    error: Option<DbError>,
    finished: bool,
}

impl fmt::Debug for PreAggStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreAggStream")
            .field("running", &self.running)
            .field("ready", &self.ready.len())
            .field("deferred", &self.deferred.len())
            .field("source_done", &self.source_done)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl PreAggStream {
    pub fn handle(&self) -> PreAggHandle {
        PreAggHandle {
            shared: self.ctx.shared.acquire(),
            completions: self.ctx.completions.clone(),
        }
    }

    pub fn statistics(&self) -> PreAggStatistics {
        self.ctx.shared.statistics()
    }

    pub fn explain_entry(&self, conf: ExplainConfig) -> ExplainEntry {
        self.ctx.shared.explain_entry(conf)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Get the next output.
    ///
    /// Returns None once every chunk has been processed and every final
    /// buffer drained. If the execution fails or is cancelled, the error is
    /// returned once all in-flight tasks have completed and their device
    /// memory has been released.
    pub fn next_output(&mut self) -> Result<Option<PreAggOutput>> {
        loop {
            if self.error.is_none() {
                if let Some(output) = self.outputs.pop_front() {
                    return Ok(Some(output));
                }
            }

            if self.finished {
                return match self.error.take() {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
            }

            if self.error.is_none() && self.ctx.shared.is_cancelled() {
                self.fail(DbError::new("Query canceled"));
            }

            if self.error.is_none() {
                if let Err(err) = self.fill() {
                    self.fail(err);
                }
            }

            if self.running > 0 {
                if let Some(completion) = self.ctx.completions.pop_wait() {
                    self.handle_completion(completion);
                }
                continue;
            }

            // Nothing on the device. Push along whatever is left.
            if let Some(task) = self.ready.pop_front() {
                self.submit(task);
                continue;
            }

            if let Some(task) = self.deferred.pop_front() {
                if self.error.is_none() {
                    self.oom_streak += 1;
                    DeviceCounters::inc(&self.ctx.shared.counters().oom_retries, 1);
                    if self.oom_streak > self.ctx.shared.config().max_oom_retries {
                        self.fail(
                            DbError::new("Not enough device memory to make progress")
                                .with_field("task", task.id())
                                .with_field("retries", self.oom_streak - 1),
                        );
                    }
                }
                // Submitted even after a failure so the task releases what
                // it holds.
                self.submit(task);
                continue;
            }

            if self.source_done {
                match self.ctx.shared.mark_scan_done() {
                    Some(buffer) => self.submit_termination(buffer),
                    None => {
                        debug!(live_buffers = self.ctx.shared.live_buffers(), "pre-aggregation finished");
                        self.finished = true;
                    }
                }
                continue;
            }

            // Fill couldn't submit anything and nothing is running.
            self.fail(DbError::new("Pre-aggregation stalled with no tasks to run"));
        }
    }

    /// Consume the stream, returning the row source so it can be rescanned.
    ///
    /// The stream is cancelled if it hasn't finished.
    pub fn into_source(mut self) -> Result<Box<dyn RowSource>> {
        self.cancel_and_settle();
        let mut source = std::mem::replace(&mut self.source, Box::new(EmptySource));
        source.rescan()?;
        Ok(source)
    }

    /// Submit new tasks until the in-flight limit is reached.
    fn fill(&mut self) -> Result<()> {
        let max_inflight = self.ctx.shared.config().max_inflight_tasks.max(1);

        while self.running < max_inflight {
            if let Some(task) = self.ready.pop_front() {
                self.submit(task);
                continue;
            }

            // Don't take new work while something is waiting on memory.
            if !self.deferred.is_empty() || self.source_done {
                break;
            }

            let Some((chunk, is_last)) = self.next_chunk()? else {
                self.source_done = true;
                break;
            };

            if !self.ctx.shared.register_task(is_last) {
                self.source_done = true;
                break;
            }
            if is_last {
                self.source_done = true;
            }

            let task = ReductionTask::new(self.next_task_id, chunk, self.has_keys);
            self.next_task_id += 1;
            self.submit(task);
        }

        Ok(())
    }

    fn next_chunk(&mut self) -> Result<Option<(RowChunk, bool)>> {
        let current = match self.lookahead.take() {
            Some(chunk) => Some(chunk),
            None if !self.primed => self.source.next_chunk()?,
            None => None,
        };
        self.primed = true;

        let Some(current) = current else {
            return Ok(None);
        };
        self.lookahead = self.source.next_chunk()?;
        let is_last = self.lookahead.is_none();

        Ok(Some((current, is_last)))
    }

    fn submit(&mut self, task: ReductionTask) {
        self.running += 1;
        process_task(task, &self.ctx);
    }

    fn submit_termination(&mut self, buffer: Arc<FinalBuffer>) {
        let task = ReductionTask::new_termination(self.next_task_id, buffer);
        self.next_task_id += 1;
        self.submit(task);
    }

    fn handle_completion(&mut self, completion: Completion) {
        self.running -= 1;

        if self.error.is_none() {
            self.outputs.extend(completion.outputs);
        }
        for buffer in completion.terminate {
            self.submit_termination(buffer);
        }

        match completion.next {
            NextStep::Done => (),
            NextStep::Resubmit(task) => self.ready.push_back(task),
            NextStep::RetryLater(task) => {
                self.deferred.push_back(task);
                return;
            }
            NextStep::Failed(err) => self.fail(err),
        }

        // Something completed, so memory may have been freed.
        self.oom_streak = 0;
        self.ready.extend(self.deferred.drain(..));
    }

    fn fail(&mut self, err: DbError) {
        if self.error.is_none() {
            warn!(%err, "pre-aggregation failed");
            self.error = Some(err);
        }
        self.ctx.shared.abort();
        self.source_done = true;
        self.outputs.clear();
    }

    fn cancel_and_settle(&mut self) {
        if self.finished {
            return;
        }
        self.ctx.shared.cancel();
        while let Ok(Some(_)) = self.next_output() {}
    }
}

impl Iterator for PreAggStream {
    type Item = Result<PreAggOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_output().transpose()
    }
}

impl Drop for PreAggStream {
    fn drop(&mut self) {
        self.cancel_and_settle();
    }
}

/// Placeholder left behind when the source is taken out of a stream.
#[derive(Debug)]
struct EmptySource;

impl RowSource for EmptySource {
    fn next_chunk(&mut self) -> Result<Option<RowChunk>> {
        Ok(None)
    }

    fn rescan(&mut self) -> Result<()> {
        Ok(())
    }
}
