/// Planning-time estimates handed to the operator.
///
/// Used as the baseline for buffer sizing and reduction mode selection until
/// run-time statistics become trustworthy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanEstimates {
    /// Estimated number of input rows.
    pub rows: f64,
    /// Estimated number of groups.
    pub groups: f64,
    /// Estimated number of input chunks.
    pub chunks: usize,
    /// Average out-of-line bytes per group.
    pub extra_bytes_per_group: usize,
}

impl PlanEstimates {
    /// Replace estimates sizing can't work with.
    ///
    /// Negative or non-finite counts fall back to the defaults, and the
    /// group count is kept between one and the row count.
    pub fn sanitized(self) -> Self {
        let defaults = PlanEstimates::default();
        let rows = usable_count(self.rows).unwrap_or(defaults.rows);
        let groups = usable_count(self.groups).unwrap_or(defaults.groups);
        PlanEstimates {
            rows,
            groups: groups.min(rows).max(1.0),
            ..self
        }
    }

    pub fn rows_per_chunk(&self) -> f64 {
        if self.chunks > 0 {
            self.rows / self.chunks as f64
        } else {
            self.rows
        }
    }
}

fn usable_count(v: f64) -> Option<f64> {
    (v.is_finite() && v >= 0.0).then_some(v)
}

impl Default for PlanEstimates {
    fn default() -> Self {
        PlanEstimates {
            rows: 1000.0,
            groups: 100.0,
            chunks: 1,
            extra_bytes_per_group: 0,
        }
    }
}
