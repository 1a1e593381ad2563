use std::fmt;

use hashbrown::HashMap;
use preagg_error::Result;

use crate::chunk::RowChunk;
use crate::datum::PartialRow;
use crate::kernels::{ReductionKernels, RowError};

/// Contents of one final buffer after it was drained to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedBatch {
    /// Generation of the buffer the rows came from.
    pub generation: u64,
    /// Number of drained rows. A salted buffer may hold several rows for the
    /// same group, so this can exceed the number of distinct groups.
    pub num_rows: usize,
    pub rows: Vec<PartialRow>,
}

/// Output of a pre-aggregation execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PreAggOutput {
    /// Partially aggregated groups.
    Groups(DrainedBatch),
    /// Input rows the device couldn't handle, to be processed on the CPU.
    Fallback(RowChunk),
}

impl fmt::Display for PreAggOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Groups(batch) => write!(
                f,
                "groups (generation: {}, rows: {})",
                batch.generation, batch.num_rows
            ),
            Self::Fallback(chunk) => write!(f, "fallback (rows: {})", chunk.num_rows()),
        }
    }
}

/// Merge partial rows from any number of drained batches into one row per
/// group.
///
/// This is the host side final aggregation step.
pub fn merge_partial_rows(
    kernels: &dyn ReductionKernels,
    rows: impl IntoIterator<Item = PartialRow>,
) -> Result<Vec<PartialRow>> {
    let mut groups: Vec<PartialRow> = Vec::new();
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();

    for row in rows {
        let candidates = index.entry(kernels.hash_value(&row)).or_default();
        match candidates
            .iter()
            .copied()
            .find(|&idx| kernels.key_match(&groups[idx], &row))
        {
            Some(idx) => kernels
                .global_combine(&mut groups[idx], &row)
                .map_err(RowError::into_db_error)?,
            None => {
                candidates.push(groups.len());
                groups.push(row);
            }
        }
    }

    Ok(groups)
}
