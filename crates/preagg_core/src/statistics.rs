use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::mode::ReductionMode;

/// Counters updated by tasks as they run on the device.
///
/// Kept outside the shared state's lock since they're only ever
/// incremented.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    pub dma_send_count: AtomicU64,
    pub dma_send_bytes: AtomicU64,
    pub dma_recv_count: AtomicU64,
    pub dma_recv_bytes: AtomicU64,
    pub main_kernel_launches: AtomicU64,
    pub init_kernel_launches: AtomicU64,
    pub fixup_kernel_launches: AtomicU64,
    pub fallback_rows: AtomicU64,
    pub buffers_drained: AtomicU64,
    pub buffers_discarded: AtomicU64,
    pub overflow_retries: AtomicU64,
    pub regrow_retries: AtomicU64,
    pub oom_retries: AtomicU64,
}

impl DeviceCounters {
    pub fn inc(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_send(&self, bytes: usize) {
        Self::inc(&self.dma_send_count, 1);
        Self::inc(&self.dma_send_bytes, bytes);
    }

    pub fn record_recv(&self, bytes: usize) {
        Self::inc(&self.dma_recv_count, 1);
        Self::inc(&self.dma_recv_bytes, bytes);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Number of tasks that ran per reduction mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeCounts {
    pub nogroup: u64,
    pub local: u64,
    pub global: u64,
    #[serde(rename = "final")]
    pub final_: u64,
}

impl ModeCounts {
    pub fn inc(&mut self, mode: ReductionMode) {
        match mode {
            ReductionMode::NoGroup => self.nogroup += 1,
            ReductionMode::Local => self.local += 1,
            ReductionMode::Global => self.global += 1,
            ReductionMode::Final => self.final_ += 1,
            ReductionMode::TerminationOnly | ReductionMode::Undecided => (),
        }
    }

    pub fn total(&self) -> u64 {
        self.nogroup + self.local + self.global + self.final_
    }

    fn entries(&self) -> [(ReductionMode, u64); 4] {
        [
            (ReductionMode::NoGroup, self.nogroup),
            (ReductionMode::Local, self.local),
            (ReductionMode::Global, self.global),
            (ReductionMode::Final, self.final_),
        ]
    }

    /// Describe the reduction policy actually used.
    ///
    /// Returns `predicted` if no task ran yet, a single mode name if only one
    /// mode was used, otherwise every used mode with its share of tasks.
    pub fn policy(&self, predicted: ReductionMode) -> String {
        let total = self.total();
        if total == 0 {
            return predicted.as_str().to_string();
        }

        let used: Vec<_> = self.entries().into_iter().filter(|(_, n)| *n > 0).collect();
        if used.len() == 1 {
            return used[0].0.as_str().to_string();
        }

        used.iter()
            .map(|(mode, n)| format!("{}: {}%", mode.as_str(), n * 100 / total))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Point-in-time statistics for an execution.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PreAggStatistics {
    pub tasks: ModeCounts,
    pub dma_send_count: u64,
    pub dma_send_bytes: u64,
    pub dma_recv_count: u64,
    pub dma_recv_bytes: u64,
    pub main_kernel_launches: u64,
    pub init_kernel_launches: u64,
    pub fixup_kernel_launches: u64,
    pub fallback_rows: u64,
    pub buffers_created: u64,
    pub buffers_drained: u64,
    pub buffers_discarded: u64,
    pub overflow_retries: u64,
    pub regrow_retries: u64,
    pub oom_retries: u64,
    /// Largest row capacity of any final buffer.
    pub max_buffer_nrooms: usize,
    /// Row capacity of each final buffer in creation order.
    pub buffer_nrooms: Vec<usize>,
    pub observed_rows: usize,
    pub observed_groups: usize,
    pub observed_extra_bytes: usize,
    pub plan_rows: f64,
    pub plan_groups: f64,
}

impl PreAggStatistics {
    pub(crate) fn fill_counters(&mut self, counters: &DeviceCounters) {
        self.dma_send_count = DeviceCounters::get(&counters.dma_send_count);
        self.dma_send_bytes = DeviceCounters::get(&counters.dma_send_bytes);
        self.dma_recv_count = DeviceCounters::get(&counters.dma_recv_count);
        self.dma_recv_bytes = DeviceCounters::get(&counters.dma_recv_bytes);
        self.main_kernel_launches = DeviceCounters::get(&counters.main_kernel_launches);
        self.init_kernel_launches = DeviceCounters::get(&counters.init_kernel_launches);
        self.fixup_kernel_launches = DeviceCounters::get(&counters.fixup_kernel_launches);
        self.fallback_rows = DeviceCounters::get(&counters.fallback_rows);
        self.buffers_drained = DeviceCounters::get(&counters.buffers_drained);
        self.buffers_discarded = DeviceCounters::get(&counters.buffers_discarded);
        self.overflow_retries = DeviceCounters::get(&counters.overflow_retries);
        self.regrow_retries = DeviceCounters::get(&counters.regrow_retries);
        self.oom_retries = DeviceCounters::get(&counters.oom_retries);
    }
}
