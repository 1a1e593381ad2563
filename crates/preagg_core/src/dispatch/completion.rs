use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use preagg_error::DbError;

use crate::buffer::FinalBuffer;
use crate::output::PreAggOutput;
use crate::task::ReductionTask;

/// What the dispatcher should do with a task after it reported back.
#[derive(Debug)]
pub enum NextStep {
    Done,
    /// Submit the task again as soon as possible.
    Resubmit(ReductionTask),
    /// Not enough device memory. Submit again once some has been freed.
    RetryLater(ReductionTask),
    Failed(DbError),
}

/// Report from a task back to the dispatcher.
#[derive(Debug)]
pub struct Completion {
    pub outputs: Vec<PreAggOutput>,
    /// Buffers the task was elected to terminate but didn't. The dispatcher
    /// submits a termination task for each.
    pub terminate: Vec<Arc<FinalBuffer>>,
    pub next: NextStep,
}

impl Completion {
    pub fn done(outputs: Vec<PreAggOutput>) -> Self {
        Completion {
            outputs,
            terminate: Vec::new(),
            next: NextStep::Done,
        }
    }

    pub fn retry_later(task: ReductionTask) -> Self {
        Completion {
            outputs: Vec::new(),
            terminate: Vec::new(),
            next: NextStep::RetryLater(task),
        }
    }

    pub fn failed(err: DbError) -> Self {
        Completion {
            outputs: Vec::new(),
            terminate: Vec::new(),
            next: NextStep::Failed(err),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    completions: VecDeque<Completion>,
    /// Set by `wake` to interrupt a waiting dispatcher.
    woken: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// Queue of task completions, pushed from device streams and popped by the
/// dispatcher.
#[derive(Debug, Clone, Default)]
pub struct CompletionQueue {
    inner: Arc<QueueInner>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, completion: Completion) {
        let mut state = self.inner.state.lock();
        state.completions.push_back(completion);
        self.inner.available.notify_one();
    }

    /// Wake up a waiting dispatcher without a completion.
    pub fn wake(&self) {
        let mut state = self.inner.state.lock();
        state.woken = true;
        self.inner.available.notify_one();
    }

    /// Wait for the next completion.
    ///
    /// Returns None if woken up before a completion arrived.
    pub fn pop_wait(&self) -> Option<Completion> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(completion) = state.completions.pop_front() {
                return Some(completion);
            }
            if state.woken {
                state.woken = false;
                return None;
            }
            self.inner.available.wait(&mut state);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
