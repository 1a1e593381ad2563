use hashbrown::HashMap;
use preagg_error::{DbError, Result};
use tracing::trace;

use super::event::DeviceEvent;
use super::final_table::{CombineStats, FinalStorage};
use super::working::WorkingBuffers;
use crate::chunk::RowChunk;
use crate::datum::{Datum, PartialRow};
use crate::kernels::{ReductionKernels, RowError};
use crate::mode::ReductionMode;

/// Status reported by the main reduction kernel.
#[derive(Debug)]
pub enum KernelStatus {
    Success,
    /// A row couldn't be processed on the device. Nothing from this chunk
    /// was written to the final buffer.
    CpuReCheck,
    /// Ran out of space. If `final_in_progress` is set, some rows were
    /// already combined into the final buffer.
    NoSpace { final_in_progress: bool },
    Fatal(DbError),
}

#[derive(Debug)]
pub struct ReduceOutcome {
    pub status: KernelStatus,
    /// Reduced rows not yet combined into the final buffer.
    pub remaining: Vec<PartialRow>,
    /// Number of rows actually present in the input chunk.
    pub rows_in: usize,
    pub combine: CombineStats,
}

impl ReduceOutcome {
    fn status(status: KernelStatus, rows_in: usize) -> Self {
        ReduceOutcome {
            status,
            remaining: Vec::new(),
            rows_in,
            combine: CombineStats::default(),
        }
    }
}

/// Input to the main reduction kernel.
#[derive(Debug)]
pub enum ReduceInput<'a> {
    /// Project and reduce a chunk from scratch.
    Chunk(&'a RowChunk),
    /// Only combine rows left over from a previous attempt.
    Remaining(Vec<PartialRow>),
}

/// Everything the main reduction kernel runs against.
#[derive(Debug)]
pub struct ReduceContext<'a> {
    pub kernels: &'a dyn ReductionKernels,
    pub mode: ReductionMode,
    pub block_width: usize,
    pub working: &'a WorkingBuffers,
    pub storage: &'a FinalStorage,
    pub init_event: &'a DeviceEvent,
    /// Offset into the distribution salt ids, varied per task so that hot
    /// groups spread over several final buffer rows.
    pub salt_offset: usize,
}

/// The main reduction kernel.
///
/// Projects the chunk into the working buffers, reduces according to the
/// task's mode, then combines the result into the final buffer.
pub fn run_main_kernel(ctx: &ReduceContext, input: ReduceInput) -> ReduceOutcome {
    let (mut rows, rows_in, from_chunk) = match input {
        ReduceInput::Remaining(rows) => (rows, 0, false),
        ReduceInput::Chunk(chunk) => {
            let rows_in = chunk.num_rows();
            if rows_in > ctx.working.nitems() {
                trace!(rows_in, nitems = ctx.working.nitems(), "working buffers too small");
                return ReduceOutcome::status(
                    KernelStatus::NoSpace {
                        final_in_progress: false,
                    },
                    rows_in,
                );
            }

            let projected = match project(ctx.kernels, chunk) {
                Ok(projected) => projected,
                Err(RowError::CpuReCheck) => {
                    return ReduceOutcome::status(KernelStatus::CpuReCheck, rows_in);
                }
                Err(RowError::Fatal(err)) => {
                    return ReduceOutcome::status(KernelStatus::Fatal(err), rows_in);
                }
            };

            match reduce_private(ctx, projected) {
                Ok(Some(rows)) => (rows, rows_in, true),
                Ok(None) => {
                    return ReduceOutcome::status(
                        KernelStatus::NoSpace {
                            final_in_progress: false,
                        },
                        rows_in,
                    );
                }
                Err(RowError::CpuReCheck) => {
                    return ReduceOutcome::status(KernelStatus::CpuReCheck, rows_in);
                }
                Err(RowError::Fatal(err)) => {
                    return ReduceOutcome::status(KernelStatus::Fatal(err), rows_in);
                }
            }
        }
    };

    // Final buffer hash slots have to be initialized before we touch them.
    ctx.init_event.wait();

    let pending = rows.len();
    match ctx.storage.combine(ctx.kernels, &mut rows, ctx.salt_offset) {
        Ok(stats) if stats.recheck => {
            // The chunk can only go to the CPU if none of it reached the
            // final buffer, otherwise its rows would be counted twice.
            let combined = pending - rows.len();
            if from_chunk && combined == 0 {
                trace!("final combine needs cpu recheck before touching the buffer");
                return ReduceOutcome::status(KernelStatus::CpuReCheck, rows_in);
            }
            ReduceOutcome {
                status: KernelStatus::Fatal(
                    DbError::new("Row needs CPU re-check after the final buffer was modified")
                        .with_field("rows_combined", combined)
                        .with_field("rows_pending", rows.len()),
                ),
                remaining: Vec::new(),
                rows_in,
                combine: stats,
            }
        }
        Ok(stats) if stats.exhausted => {
            trace!(remaining = rows.len(), "final buffer exhausted");
            ReduceOutcome {
                status: KernelStatus::NoSpace {
                    final_in_progress: true,
                },
                remaining: rows,
                rows_in,
                combine: stats,
            }
        }
        Ok(stats) => ReduceOutcome {
            status: KernelStatus::Success,
            remaining: Vec::new(),
            rows_in,
            combine: stats,
        },
        Err(err) => ReduceOutcome::status(KernelStatus::Fatal(err), rows_in),
    }
}

fn project(kernels: &dyn ReductionKernels, chunk: &RowChunk) -> Result<Vec<PartialRow>, RowError> {
    chunk.rows.iter().map(|row| kernels.projection(row)).collect()
}

/// Reduce projected rows in the task's private buffers.
///
/// Returns None if the private hash table is too small.
fn reduce_private(
    ctx: &ReduceContext,
    rows: Vec<PartialRow>,
) -> Result<Option<Vec<PartialRow>>, RowError> {
    match ctx.mode {
        ReductionMode::Final => Ok(Some(rows)),
        ReductionMode::NoGroup => {
            let mut iter = rows.into_iter();
            let Some(mut acc) = iter.next() else {
                return Ok(Some(Vec::new()));
            };
            for row in iter {
                ctx.kernels.nogroup_combine(&mut acc, &row)?;
            }
            Ok(Some(vec![acc]))
        }
        ReductionMode::Local => {
            let width = ctx.block_width.max(1);
            let mut out = Vec::with_capacity(rows.len());
            let mut rows = rows.into_iter().peekable();
            while rows.peek().is_some() {
                let block: Vec<_> = rows.by_ref().take(width).collect();
                // Groups within a block are bounded by the block width.
                let groups = group_rows(ctx.kernels, block, usize::MAX, |acc, row| {
                    ctx.kernels.local_combine(acc, row)
                })?;
                out.extend(groups.into_iter().flatten());
            }
            Ok(Some(out))
        }
        ReductionMode::Global => {
            group_rows(ctx.kernels, rows, ctx.working.hash_size(), |acc, row| {
                ctx.kernels.global_combine(acc, row)
            })
        }
        ReductionMode::TerminationOnly | ReductionMode::Undecided => {
            Err(DbError::new("Main kernel launched without a reduction mode")
                .with_field("mode", ctx.mode.as_str())
                .into())
        }
    }
}

/// Group rows by key, combining rows of the same group.
///
/// Returns None if the number of groups exceeds `max_groups`.
fn group_rows<F>(
    kernels: &dyn ReductionKernels,
    rows: Vec<PartialRow>,
    max_groups: usize,
    combine: F,
) -> Result<Option<Vec<PartialRow>>, RowError>
where
    F: Fn(&mut [Datum], &[Datum]) -> Result<(), RowError>,
{
    let mut groups: Vec<PartialRow> = Vec::new();
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();

    for row in rows {
        let hash = kernels.hash_value(&row);
        let candidates = index.entry(hash).or_default();
        let existing = candidates
            .iter()
            .copied()
            .find(|&idx| kernels.key_match(&groups[idx], &row));

        match existing {
            Some(idx) => combine(groups[idx].as_mut_slice(), &row)?,
            None => {
                if groups.len() >= max_groups {
                    return Ok(None);
                }
                candidates.push(groups.len());
                groups.push(row);
            }
        }
    }

    Ok(Some(groups))
}
