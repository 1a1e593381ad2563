use serde::Serialize;

/// How a task reduces its input chunk before (or instead of) combining into
/// the final buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReductionMode {
    /// No grouping keys, everything folds into a single running total.
    NoGroup,
    /// Combine within each block of device threads first.
    Local,
    /// Combine across the whole device into a private hash table first.
    Global,
    /// Combine projected rows directly into the final buffer.
    Final,
    /// Zero-input task that only fixes up and drains a final buffer.
    TerminationOnly,
    /// Grouped task whose mode hasn't been picked yet.
    Undecided,
}

impl ReductionMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoGroup => "NoGroup",
            Self::Local => "Local",
            Self::Global => "Global",
            Self::Final => "Final",
            Self::TerminationOnly => "TerminationOnly",
            Self::Undecided => "Undecided",
        }
    }

    /// Parse a user-provided mode name. Only modes that can be requested
    /// explicitly are accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "nogroup" => Self::NoGroup,
            "local" => Self::Local,
            "global" => Self::Global,
            "final" => Self::Final,
            _ => return None,
        })
    }

    pub const fn is_grouped(&self) -> bool {
        matches!(self, Self::Local | Self::Global | Self::Final)
    }
}

/// Inputs for picking a grouped task's reduction mode.
#[derive(Debug, Clone, Copy)]
pub struct ModeInputs {
    pub plan_groups: f64,
    pub observed_groups: f64,
    pub completed_tasks: usize,
    /// Number of completed tasks after which observed statistics are fully
    /// trusted.
    pub trust_tasks: usize,
    /// Number of device threads cooperating in one block.
    pub block_width: usize,
    /// Rows in the task's chunk.
    pub task_rows: usize,
}

impl ModeInputs {
    /// Group count blended from the plan estimate and what we've observed so
    /// far, weighted by how many tasks have completed.
    pub fn blended_groups(&self) -> f64 {
        let trust = self.trust_tasks.max(1);
        let weight = self.completed_tasks.min(trust) as f64 / trust as f64;
        self.plan_groups * (1.0 - weight) + self.observed_groups * weight
    }
}

/// Pick a mode for a grouped task.
///
/// This is only a performance heuristic. Every grouped mode produces the same
/// final result.
pub fn choose_grouped_mode(inputs: &ModeInputs) -> ReductionMode {
    let estimate = inputs.blended_groups();

    if estimate < inputs.block_width as f64 / 4.0 {
        ReductionMode::Local
    } else if estimate < inputs.task_rows as f64 / 4.0 {
        ReductionMode::Global
    } else {
        ReductionMode::Final
    }
}
