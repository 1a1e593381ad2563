use std::fmt;

use parking_lot::{Condvar, Mutex};

use super::StreamWork;

/// Synchronization handle for device work that later work depends on.
///
/// The event is created holding its work. Whoever gets to it first, either
/// the stream the work was launched on or a waiter, runs it. This means
/// waiting from inside launched work can't deadlock a pool of streams that
/// are all waiting on work queued behind them.
pub struct DeviceEvent {
    state: Mutex<EventState>,
    recorded: Condvar,
}

enum EventState {
    Pending(StreamWork),
    Running,
    Recorded,
}

impl DeviceEvent {
    pub fn new(work: StreamWork) -> Self {
        DeviceEvent {
            state: Mutex::new(EventState::Pending(work)),
            recorded: Condvar::new(),
        }
    }

    /// Create an event that's already been recorded.
    pub fn recorded() -> Self {
        DeviceEvent {
            state: Mutex::new(EventState::Recorded),
            recorded: Condvar::new(),
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(*self.state.lock(), EventState::Recorded)
    }

    /// Run the work if nobody has started it yet.
    pub fn run_pending(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, EventState::Pending(_)) {
            return;
        }
        self.run_locked(&mut state);
    }

    /// Block until the event has been recorded, running the pending work on
    /// this thread if needed.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        loop {
            match *state {
                EventState::Recorded => return,
                EventState::Pending(_) => self.run_locked(&mut state),
                EventState::Running => self.recorded.wait(&mut state),
            }
        }
    }

    fn run_locked(&self, state: &mut parking_lot::MutexGuard<'_, EventState>) {
        let work = match std::mem::replace(&mut **state, EventState::Running) {
            EventState::Pending(work) => work,
            other => {
                **state = other;
                return;
            }
        };

        parking_lot::MutexGuard::unlocked(state, work);

        **state = EventState::Recorded;
        self.recorded.notify_all();
    }
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.lock() {
            EventState::Pending(_) => "pending",
            EventState::Running => "running",
            EventState::Recorded => "recorded",
        };
        f.debug_struct("DeviceEvent").field("state", &state).finish()
    }
}
