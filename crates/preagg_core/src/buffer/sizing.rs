use super::layout::FinalBufferLayout;
use crate::config::PreAggConfig;
use crate::plan::PlanEstimates;

/// Row capacity is this multiple of the estimated (salted) group count.
const ROOMS_PER_GROUP: f64 = 2.5;

/// Observations feeding the sizing of the next final buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizingInputs {
    /// Input rows processed by completed tasks.
    pub observed_rows: usize,
    /// Largest number of groups held by any final buffer so far.
    pub observed_groups: usize,
    /// Largest number of extra bytes used by any final buffer so far.
    pub observed_extra: usize,
    /// Row capacity of the previous buffer generation.
    pub previous_nrooms: Option<usize>,
    /// Extra area capacity of the previous buffer generation.
    pub previous_extra_bytes: usize,
    /// Set if the previous buffer overflowed.
    pub overflow_demand: Option<OverflowDemand>,
}

/// Space the task that overflowed a buffer needed, counting what the buffer
/// already held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverflowDemand {
    pub rooms: usize,
    pub extra_bytes: usize,
}

impl OverflowDemand {
    pub fn max(self, other: Self) -> Self {
        OverflowDemand {
            rooms: self.rooms.max(other.rooms),
            extra_bytes: self.extra_bytes.max(other.extra_bytes),
        }
    }
}

/// Estimate the number of groups the next buffer will need to hold.
///
/// Once enough rows have been observed, assumes the group count grows
/// logarithmically with the row count (`groups = a * ln(rows)`) and
/// extrapolates to either the planned row count or twice what's been seen.
pub fn estimate_groups(plan: &PlanEstimates, inputs: &SizingInputs, config: &PreAggConfig) -> f64 {
    if inputs.observed_rows < config.stats_min_rows.max(2) {
        return plan.groups.max(1.0);
    }

    let observed_rows = inputs.observed_rows as f64;
    let alpha = inputs.observed_groups as f64 / observed_rows.ln();
    let target_rows = if observed_rows < plan.rows / 2.0 {
        plan.rows
    } else {
        2.0 * observed_rows
    };

    (alpha * target_rows.ln()).max(1.0)
}

/// Estimate out of line bytes needed per group.
pub fn estimate_extra_per_group(
    plan: &PlanEstimates,
    inputs: &SizingInputs,
    config: &PreAggConfig,
) -> usize {
    if inputs.observed_groups < config.extra_stats_min_groups.max(1) {
        return plan.extra_bytes_per_group;
    }

    let observed = inputs.observed_extra.div_ceil(inputs.observed_groups);
    observed.max(plan.extra_bytes_per_group)
}

/// Salt spreading few groups across more rows to reduce contention on the
/// same hash slots.
pub fn key_dist_salt(groups: f64, width: usize) -> usize {
    let width = width as f64;
    if groups < width / 5.0 {
        ((width / (5.0 * groups.max(1.0))) as usize).max(1)
    } else {
        1
    }
}

/// Compute the layout of the next final buffer.
///
/// Row capacity never shrinks between generations, and grows by at least
/// the configured factor after an overflow. The extra area is grown the same
/// way after an overflow.
pub fn adjust_final_buffer_size(
    ncols: usize,
    width: usize,
    plan: &PlanEstimates,
    inputs: &SizingInputs,
    config: &PreAggConfig,
) -> FinalBufferLayout {
    let groups = estimate_groups(plan, inputs, config);
    let mut extra_per_group = estimate_extra_per_group(plan, inputs, config);
    let salt = key_dist_salt(groups, width);

    // Float to int casts saturate.
    let mut nrooms =
        ((groups * salt as f64 * ROOMS_PER_GROUP) as usize).saturating_add(config.buffer_slack_rows);

    if let Some(prev) = inputs.previous_nrooms {
        nrooms = nrooms.max(prev);
        if let Some(demand) = inputs.overflow_demand {
            let grown = prev.saturating_mul(config.overflow_growth_factor);
            nrooms = nrooms.max(grown).max(demand.rooms).max(1);

            let extra_needed = inputs
                .previous_extra_bytes
                .saturating_mul(config.overflow_growth_factor)
                .max(demand.extra_bytes);
            extra_per_group = extra_per_group.max(extra_needed.div_ceil(nrooms));
        }
    }

    FinalBufferLayout::new_quantized(
        ncols,
        nrooms.max(1),
        extra_per_group,
        salt,
        config.transfer_chunk_bytes,
    )
}
