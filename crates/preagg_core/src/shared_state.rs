use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use preagg_error::{DbError, Result};
use tracing::{debug, error, warn};

use crate::buffer::layout::FinalBufferLayout;
use crate::buffer::sizing::{OverflowDemand, SizingInputs, adjust_final_buffer_size};
use crate::buffer::{DeviceHandles, FinalBuffer, FinalBufferRef};
use crate::config::PreAggConfig;
use crate::device::Device;
use crate::device::event::DeviceEvent;
use crate::device::final_table::FinalStorage;
use crate::kernels::ReductionKernels;
use crate::mode::{ModeInputs, ReductionMode, choose_grouped_mode};
use crate::plan::PlanEstimates;
use crate::statistics::{DeviceCounters, ModeCounts, PreAggStatistics};

/// Why a task is releasing its final buffer reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The task is done, successfully or not.
    Completed,
    /// The task will be resubmitted and stays in progress.
    Retry,
    /// The final buffer ran out of space while the task was combining into
    /// it. The buffer is detached and the task will be resubmitted with
    /// `remaining` reduced rows holding `remaining_extra` out of line bytes.
    Overflow {
        remaining: usize,
        remaining_extra: usize,
    },
}

/// What a task contributed before releasing its reference.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    /// Input rows fully processed by the task. Only set on success.
    pub rows_in: usize,
    /// Groups newly inserted into the final buffer.
    pub groups_added: usize,
    /// Extra bytes consumed in the final buffer.
    pub extra_added: usize,
    /// Set if the task finished successfully on the device.
    pub succeeded: bool,
}

#[derive(Debug)]
pub enum AttachOutcome {
    Attached(FinalBufferRef),
    /// Not enough device memory to create a buffer right now. Nothing was
    /// changed.
    RetryLater,
}

/// Per buffer control data. Lives until the buffer's terminator is elected.
#[derive(Debug, Clone, Copy)]
struct BufferControl {
    /// Tasks currently holding a reference.
    running: usize,
    /// If this is the buffer new tasks attach to.
    attached: bool,
    groups: usize,
    extra_used: usize,
}

#[derive(Debug, Default)]
struct AggregationState {
    scan_done: bool,
    tasks_in_progress: usize,
    final_buffer: Option<Arc<FinalBuffer>>,
    buffers: HashMap<u64, BufferControl>,
    next_generation: u64,
    /// Row capacity of the most recently created buffer.
    last_nrooms: Option<usize>,
    /// Extra area capacity of the most recently created buffer.
    last_extra_bytes: usize,
    /// Row capacity of each buffer, indexed by generation.
    buffer_nrooms: Vec<usize>,
    /// Space needed by the task that overflowed the last buffer.
    overflow_demand: Option<OverflowDemand>,
    observed_rows: usize,
    /// Largest number of groups seen in a single buffer.
    observed_groups: usize,
    /// Largest number of extra bytes used by a single buffer.
    observed_extra: usize,
    completed_tasks: usize,
    mode_counts: ModeCounts,
    cancelled: bool,
    aborted: bool,
}

#[derive(Debug)]
struct SharedInner {
    config: PreAggConfig,
    plan: PlanEstimates,
    ncols: usize,
    num_group_keys: usize,
    block_width: usize,
    counters: Arc<DeviceCounters>,
    state: Mutex<AggregationState>,
}

/// Control block shared by every task of one execution.
///
/// Cloning (or `acquire`) hands out another reference. The lock guarding the
/// state is only held for counter and pointer updates, never across device
/// allocation, kernel launches, or copies.
#[derive(Debug, Clone)]
pub struct SharedAggregationState {
    inner: Arc<SharedInner>,
}

impl SharedAggregationState {
    pub fn new(
        config: PreAggConfig,
        plan: PlanEstimates,
        kernels: &dyn ReductionKernels,
        block_width: usize,
    ) -> Self {
        SharedAggregationState {
            inner: Arc::new(SharedInner {
                config,
                plan: plan.sanitized(),
                ncols: kernels.num_columns(),
                num_group_keys: kernels.num_group_keys(),
                block_width: block_width.max(1),
                counters: Arc::new(DeviceCounters::default()),
                state: Mutex::new(AggregationState::default()),
            }),
        }
    }

    pub fn acquire(&self) -> Self {
        self.clone()
    }

    pub fn release(self) {
        drop(self)
    }

    pub fn config(&self) -> &PreAggConfig {
        &self.inner.config
    }

    pub fn plan(&self) -> &PlanEstimates {
        &self.inner.plan
    }

    pub fn counters(&self) -> &DeviceCounters {
        &self.inner.counters
    }

    pub fn scan_done(&self) -> bool {
        self.inner.state.lock().scan_done
    }

    pub fn tasks_in_progress(&self) -> usize {
        self.inner.state.lock().tasks_in_progress
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    /// If buffers should be freed instead of drained.
    pub fn should_discard(&self) -> bool {
        let state = self.inner.state.lock();
        state.cancelled || state.aborted
    }

    /// Register a task about to be submitted.
    ///
    /// `is_last` marks the task carrying the last input chunk. Returns false
    /// if no more tasks may be submitted.
    pub fn register_task(&self, is_last: bool) -> bool {
        let mut state = self.inner.state.lock();
        if state.scan_done {
            return false;
        }
        state.tasks_in_progress += 1;
        if is_last {
            state.scan_done = true;
        }
        true
    }

    /// Mark that no more tasks will be submitted.
    ///
    /// Returns the attached buffer if nothing is in progress, the caller is
    /// then responsible for terminating it.
    pub fn mark_scan_done(&self) -> Option<Arc<FinalBuffer>> {
        let mut state = self.inner.state.lock();
        state.scan_done = true;
        if state.tasks_in_progress == 0 {
            Self::detach_for_termination(&mut state)
        } else {
            None
        }
    }

    /// Stop accepting tasks. In-flight tasks release as normal, and their
    /// buffers are freed without being drained.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.cancelled = true;
        state.scan_done = true;
    }

    /// Like cancel, but for a fatal error.
    pub fn abort(&self) {
        let mut state = self.inner.state.lock();
        state.aborted = true;
        state.scan_done = true;
    }

    /// Pick the reduction mode for a task with `task_rows` input rows.
    pub fn choose_mode(&self, task_rows: usize) -> ReductionMode {
        if self.inner.num_group_keys == 0 {
            return ReductionMode::NoGroup;
        }

        let state = self.inner.state.lock();
        choose_grouped_mode(&ModeInputs {
            plan_groups: self.inner.plan.groups,
            observed_groups: state.observed_groups as f64,
            completed_tasks: state.completed_tasks,
            trust_tasks: self.inner.config.stats_trust_tasks,
            block_width: self.inner.block_width,
            task_rows,
        })
    }

    /// The mode planning estimates alone would pick.
    pub fn predicted_mode(&self) -> ReductionMode {
        if self.inner.num_group_keys == 0 {
            return ReductionMode::NoGroup;
        }
        choose_grouped_mode(&ModeInputs {
            plan_groups: self.inner.plan.groups,
            observed_groups: 0.0,
            completed_tasks: 0,
            trust_tasks: self.inner.config.stats_trust_tasks,
            block_width: self.inner.block_width,
            task_rows: self.inner.plan.rows_per_chunk() as usize,
        })
    }

    pub fn count_mode(&self, mode: ReductionMode) {
        self.inner.state.lock().mode_counts.inc(mode);
    }

    /// Attach to the current final buffer, creating one if needed.
    pub fn attach_final_buffer(&self, device: &dyn Device) -> Result<AttachOutcome> {
        let layout = {
            let mut state = self.inner.state.lock();
            if let Some(fref) = Self::attach_existing(&mut state)? {
                return Ok(AttachOutcome::Attached(fref));
            }
            self.next_layout(&state)
        };

        let allocation = match device.memory().allocate(layout.total_bytes()) {
            Ok(allocation) => allocation,
            Err(err) if err.is_out_of_memory() => {
                warn!(%err, nrooms = layout.nrooms, "no device memory for final buffer, retrying later");
                return Ok(AttachOutcome::RetryLater);
            }
            Err(err) => return Err(err.into()),
        };

        let storage = Arc::new(FinalStorage::new(layout, allocation));
        let init_storage = storage.clone();
        let counters = self.inner.counters.clone();
        let init_event = Arc::new(DeviceEvent::new(Box::new(move || {
            init_storage.init_hash();
            DeviceCounters::inc(&counters.init_kernel_launches, 1);
        })));
        let handles = DeviceHandles {
            storage,
            init_event,
        };

        let mut state = self.inner.state.lock();
        if let Some(fref) = Self::attach_existing(&mut state)? {
            // Lost a race. Our buffer gets freed once we're out of the lock.
            drop(state);
            drop(handles);
            return Ok(AttachOutcome::Attached(fref));
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let nrooms = handles.storage.layout().nrooms;
        state.last_nrooms = Some(nrooms);
        state.last_extra_bytes = handles.storage.layout().extra_bytes;
        state.buffer_nrooms.push(nrooms);
        state.overflow_demand = None;
        state.buffers.insert(
            generation,
            BufferControl {
                running: 1,
                attached: true,
                groups: 0,
                extra_used: 0,
            },
        );

        let buffer = Arc::new(FinalBuffer::new(generation, handles.clone()));
        state.final_buffer = Some(buffer.clone());
        drop(state);

        debug!(
            generation,
            nrooms,
            salt = handles.storage.layout().key_dist_salt,
            bytes = handles.storage.layout().total_bytes(),
            "created final buffer"
        );

        let event = handles.init_event.clone();
        device.launch(Box::new(move || event.run_pending()));

        Ok(AttachOutcome::Attached(FinalBufferRef { buffer, handles }))
    }

    fn attach_existing(state: &mut AggregationState) -> Result<Option<FinalBufferRef>> {
        let Some(buffer) = state.final_buffer.clone() else {
            return Ok(None);
        };

        let handles = buffer.clone_handles().ok_or_else(|| {
            DbError::new("Attached final buffer has already been released")
                .with_field("generation", buffer.generation())
        })?;
        let ctl = state.buffers.get_mut(&buffer.generation()).ok_or_else(|| {
            DbError::new("Missing control data for attached final buffer")
                .with_field("generation", buffer.generation())
        })?;
        ctl.running += 1;

        Ok(Some(FinalBufferRef { buffer, handles }))
    }

    fn next_layout(&self, state: &AggregationState) -> FinalBufferLayout {
        let inputs = SizingInputs {
            observed_rows: state.observed_rows,
            observed_groups: state.observed_groups,
            observed_extra: state.observed_extra,
            previous_nrooms: state.last_nrooms,
            previous_extra_bytes: state.last_extra_bytes,
            overflow_demand: state.overflow_demand,
        };
        adjust_final_buffer_size(
            self.inner.ncols,
            self.inner.block_width,
            &self.inner.plan,
            &inputs,
            &self.inner.config,
        )
    }

    /// Release a task's final buffer reference and record what it did.
    ///
    /// Returns the buffers the caller has been elected to terminate. A buffer
    /// is returned to exactly one caller, when either:
    ///
    /// - the last task in progress completes after the scan is done, or
    /// - the last task holding a detached buffer releases it.
    pub fn release_final_buffer(
        &self,
        fref: Option<FinalBufferRef>,
        reason: ReleaseReason,
        progress: TaskProgress,
    ) -> Vec<Arc<FinalBuffer>> {
        // Device handles are dropped before the counters are decremented so
        // the terminator holds the last reference to the device memory.
        let buffer = fref.map(FinalBufferRef::into_buffer);

        let mut state = self.inner.state.lock();
        let mut elected = Vec::new();

        state.observed_rows += progress.rows_in;
        if progress.succeeded {
            state.completed_tasks += 1;
        }

        if let Some(buffer) = buffer {
            let generation = buffer.generation();
            let is_current = state
                .final_buffer
                .as_ref()
                .is_some_and(|b| Arc::ptr_eq(b, &buffer));

            match state.buffers.get(&generation).copied() {
                Some(mut ctl) => {
                    ctl.groups += progress.groups_added;
                    ctl.extra_used += progress.extra_added;
                    ctl.running = ctl.running.saturating_sub(1);

                    if let ReleaseReason::Overflow {
                        remaining,
                        remaining_extra,
                    } = reason
                    {
                        if is_current {
                            debug!(generation, groups = ctl.groups, remaining, "detaching exhausted final buffer");
                            state.final_buffer = None;
                            ctl.attached = false;
                        }
                        let demand = OverflowDemand {
                            rooms: ctl.groups + remaining,
                            extra_bytes: ctl.extra_used + remaining_extra,
                        };
                        state.overflow_demand =
                            Some(state.overflow_demand.map_or(demand, |d| d.max(demand)));
                    }

                    state.observed_groups = state.observed_groups.max(ctl.groups);
                    state.observed_extra = state.observed_extra.max(ctl.extra_used);

                    if ctl.running == 0 && !ctl.attached {
                        state.buffers.remove(&generation);
                        elected.push(buffer);
                    } else {
                        state.buffers.insert(generation, ctl);
                    }
                }
                None => {
                    error!(generation, "released a final buffer with no control data");
                }
            }
        }

        if reason == ReleaseReason::Completed {
            match state.tasks_in_progress.checked_sub(1) {
                Some(n) => state.tasks_in_progress = n,
                None => error!("task completed with no tasks in progress"),
            }

            if state.tasks_in_progress == 0 && state.scan_done {
                if let Some(buffer) = Self::detach_for_termination(&mut state) {
                    elected.push(buffer);
                }
            }
        }

        elected
    }

    /// Detach the current buffer and elect the caller as its terminator if
    /// no task holds it.
    fn detach_for_termination(state: &mut AggregationState) -> Option<Arc<FinalBuffer>> {
        let buffer = state.final_buffer.take()?;
        let generation = buffer.generation();

        let ctl = state.buffers.get_mut(&generation)?;
        ctl.attached = false;
        if ctl.running == 0 {
            state.buffers.remove(&generation);
            Some(buffer)
        } else {
            None
        }
    }

    /// Number of buffers created but not yet handed to a terminator.
    pub fn live_buffers(&self) -> usize {
        self.inner.state.lock().buffers.len()
    }

    pub fn statistics(&self) -> PreAggStatistics {
        let mut stats = {
            let state = self.inner.state.lock();
            PreAggStatistics {
                tasks: state.mode_counts,
                buffers_created: state.next_generation,
                max_buffer_nrooms: state.buffer_nrooms.iter().copied().max().unwrap_or(0),
                buffer_nrooms: state.buffer_nrooms.clone(),
                observed_rows: state.observed_rows,
                observed_groups: state.observed_groups,
                observed_extra_bytes: state.observed_extra,
                plan_rows: self.inner.plan.rows,
                plan_groups: self.inner.plan.groups,
                ..Default::default()
            }
        };
        stats.fill_counters(&self.inner.counters);
        stats
    }
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let leaked = state.final_buffer.is_some() && !state.aborted && !state.cancelled;
        if leaked {
            error!("shared aggregation state dropped with a final buffer still attached");
        }
        if !std::thread::panicking() {
            debug_assert!(!leaked, "final buffer still attached on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::seq::SliceRandom;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::device::InlineDevice;
    use crate::kernels::aggregate::{AggregateKind, GroupKey, GroupedAggregateKernels};

    fn kernels() -> GroupedAggregateKernels {
        GroupedAggregateKernels::new([GroupKey::int(0)], [AggregateKind::Count(None)])
    }

    fn shared(config: PreAggConfig) -> SharedAggregationState {
        SharedAggregationState::new(config, PlanEstimates::default(), &kernels(), 32)
    }

    fn attach(shared: &SharedAggregationState, device: &InlineDevice) -> FinalBufferRef {
        match shared.attach_final_buffer(device).unwrap() {
            AttachOutcome::Attached(fref) => fref,
            AttachOutcome::RetryLater => panic!("unexpected retry"),
        }
    }

    fn completed() -> TaskProgress {
        TaskProgress {
            succeeded: true,
            ..Default::default()
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "final buffer still attached on drop")]
    fn drop_with_attached_buffer() {
        let device = InlineDevice::new(32, 1 << 30);
        let shared = shared(PreAggConfig::default());
        assert!(shared.register_task(true));
        drop(attach(&shared, &device));
        drop(shared);
    }

    #[test]
    fn drop_attached_after_abort() {
        let device = InlineDevice::new(32, 1 << 30);
        let shared = shared(PreAggConfig::default());
        assert!(shared.register_task(true));
        drop(attach(&shared, &device));
        shared.abort();
        drop(shared);
    }

    #[test]
    fn last_task_terminates() {
        let device = InlineDevice::new(32, 1 << 30);
        let shared = shared(PreAggConfig::default());

        assert!(shared.register_task(true));
        let fref = attach(&shared, &device);
        assert!(fref.init_event().is_recorded());
        assert_eq!(1, shared.tasks_in_progress());

        let elected = shared.release_final_buffer(Some(fref), ReleaseReason::Completed, completed());
        assert_eq!(1, elected.len());
        assert_eq!(0, shared.tasks_in_progress());
        assert_eq!(0, shared.live_buffers());
        assert!(!shared.register_task(false));
    }

    #[test]
    fn not_last_does_not_terminate() {
        let device = InlineDevice::new(32, 1 << 30);
        let shared = shared(PreAggConfig::default());

        assert!(shared.register_task(false));
        let fref = attach(&shared, &device);
        let elected = shared.release_final_buffer(Some(fref), ReleaseReason::Completed, completed());
        assert!(elected.is_empty());

        let elected = shared.mark_scan_done();
        assert!(elected.is_some());
    }

    #[test]
    fn tasks_share_one_buffer() {
        let device = InlineDevice::new(32, 1 << 30);
        let shared = shared(PreAggConfig::default());

        assert!(shared.register_task(false));
        assert!(shared.register_task(true));
        let a = attach(&shared, &device);
        let b = attach(&shared, &device);
        assert_eq!(a.generation(), b.generation());
        assert_eq!(1, shared.statistics().buffers_created);

        assert!(
            shared
                .release_final_buffer(Some(a), ReleaseReason::Completed, completed())
                .is_empty()
        );
        let elected = shared.release_final_buffer(Some(b), ReleaseReason::Completed, completed());
        assert_eq!(1, elected.len());
    }

    #[test]
    fn overflow_detaches_and_last_holder_terminates() {
        let device = InlineDevice::new(32, 1 << 30);
        let shared = shared(PreAggConfig::default());

        for _ in 0..3 {
            assert!(shared.register_task(false));
        }
        let a = attach(&shared, &device);
        let b = attach(&shared, &device);
        let c = attach(&shared, &device);
        let old_gen = a.generation();
        let old_nrooms = a.storage().layout().nrooms;

        // Overflow detaches but b and c still hold the old buffer.
        let progress = TaskProgress {
            groups_added: old_nrooms,
            ..Default::default()
        };
        let elected =
            shared.release_final_buffer(Some(a), ReleaseReason::Overflow {
                remaining: 10,
                remaining_extra: 0,
            }, progress);
        assert!(elected.is_empty());

        // Retry attaches to a new, bigger buffer.
        let a = attach(&shared, &device);
        assert_ne!(old_gen, a.generation());
        assert!(a.storage().layout().nrooms >= 2 * old_nrooms);

        assert!(
            shared
                .release_final_buffer(Some(b), ReleaseReason::Completed, completed())
                .is_empty()
        );
        let elected = shared.release_final_buffer(Some(c), ReleaseReason::Completed, completed());
        assert_eq!(1, elected.len());
        assert_eq!(old_gen, elected[0].generation());

        // The retried task is still in progress.
        assert_eq!(1, shared.tasks_in_progress());
        assert!(shared.mark_scan_done().is_none());
        let elected = shared.release_final_buffer(Some(a), ReleaseReason::Completed, completed());
        assert_eq!(1, elected.len());
        assert_ne!(old_gen, elected[0].generation());
    }

    #[test]
    fn oom_on_create_changes_nothing() {
        let device = InlineDevice::new(32, 16);
        let shared = shared(PreAggConfig::default());
        assert!(shared.register_task(true));

        let outcome = shared.attach_final_buffer(&device).unwrap();
        assert!(matches!(outcome, AttachOutcome::RetryLater));
        assert_eq!(0, shared.live_buffers());
        assert_eq!(0, shared.statistics().buffers_created);
        assert_eq!(0, device.memory().used());

        let elected = shared.release_final_buffer(None, ReleaseReason::Completed, TaskProgress::default());
        assert!(elected.is_empty());
    }

    #[test]
    fn single_remaining_task_terminates_once() {
        let device = InlineDevice::new(32, 1 << 30);
        let shared = shared(PreAggConfig::default());

        assert!(shared.register_task(false));
        let fref = attach(&shared, &device);
        assert!(shared.mark_scan_done().is_none());

        let elected = shared.release_final_buffer(Some(fref), ReleaseReason::Completed, completed());
        assert_eq!(1, elected.len());
        assert!(shared.mark_scan_done().is_none());
    }

    #[test]
    fn random_release_order_elects_exactly_once() {
        let device = InlineDevice::new(32, 1 << 30);

        for seed in 0..50 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let shared = shared(PreAggConfig::default());

            let num_tasks = 12;
            let mut refs = Vec::new();
            let mut elected: Vec<u64> = Vec::new();
            for idx in 0..num_tasks {
                assert!(shared.register_task(idx == num_tasks - 1));
                refs.push(attach(&shared, &device));
                // Occasionally overflow mid way, replacing the buffer.
                if idx % 5 == 4 {
                    let fref = refs.pop().unwrap();
                    elected.extend(
                        shared
                            .release_final_buffer(
                                Some(fref),
                                ReleaseReason::Overflow {
                                    remaining: 1,
                                    remaining_extra: 0,
                                },
                                TaskProgress::default(),
                            )
                            .iter()
                            .map(|b| b.generation()),
                    );
                    refs.push(attach(&shared, &device));
                }
            }

            refs.shuffle(&mut rng);
            for fref in refs {
                elected.extend(
                    shared
                        .release_final_buffer(Some(fref), ReleaseReason::Completed, completed())
                        .iter()
                        .map(|b| b.generation()),
                );
            }

            elected.sort_unstable();
            let stats = shared.statistics();
            let created = stats.buffers_created;
            assert_eq!((0..created).collect::<Vec<_>>(), elected, "seed: {seed}");
            assert_eq!(created as usize, stats.buffer_nrooms.len());
            assert!(stats.buffer_nrooms.windows(2).all(|w| w[0] <= w[1]), "seed: {seed}");
            assert_eq!(0, shared.tasks_in_progress());
            assert_eq!(0, shared.live_buffers());
        }
    }

    #[test]
    fn choose_mode_nogroup_without_keys() {
        let k = GroupedAggregateKernels::new([], [AggregateKind::Count(None)]);
        let shared = SharedAggregationState::new(
            PreAggConfig::default(),
            PlanEstimates::default(),
            &k,
            32,
        );
        assert_eq!(ReductionMode::NoGroup, shared.choose_mode(1000));
        assert_eq!(ReductionMode::NoGroup, shared.predicted_mode());
    }
}
