//! The compiled reduction module consumed by the scheduler.

pub mod aggregate;
pub mod hash;

use std::fmt::{self, Debug};

use preagg_error::{DbError, Result};

use crate::datum::{Datum, PartialRow};

/// Named entry points of a reduction module. The first six are provided by
/// the compiled module, the last two by the device runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelEntryPoint {
    Projection,
    HashValue,
    KeyMatch,
    LocalCombine,
    GlobalCombine,
    NoGroupCombine,
    InitFinalHash,
    FixupVarlena,
}

impl KernelEntryPoint {
    pub const ALL: [KernelEntryPoint; 8] = [
        Self::Projection,
        Self::HashValue,
        Self::KeyMatch,
        Self::LocalCombine,
        Self::GlobalCombine,
        Self::NoGroupCombine,
        Self::InitFinalHash,
        Self::FixupVarlena,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Projection => "preagg_projection",
            Self::HashValue => "preagg_hashvalue",
            Self::KeyMatch => "preagg_keymatch",
            Self::LocalCombine => "preagg_local_calc",
            Self::GlobalCombine => "preagg_global_calc",
            Self::NoGroupCombine => "preagg_nogroup_calc",
            Self::InitFinalHash => "preagg_init_final_hash",
            Self::FixupVarlena => "preagg_fixup_varlena",
        }
    }

    pub const fn is_runtime_kernel(&self) -> bool {
        matches!(self, Self::InitFinalHash | Self::FixupVarlena)
    }
}

impl fmt::Display for KernelEntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Row-level failure from projecting or combining rows.
#[derive(Debug)]
pub enum RowError {
    /// The row can't be handled on the device and has to be re-evaluated on
    /// the CPU, e.g. an unsupported value or an integer overflow.
    CpuReCheck,
    Fatal(DbError),
}

impl RowError {
    /// Convert to an error for callers that have no CPU fallback to route
    /// the row to.
    pub fn into_db_error(self) -> DbError {
        match self {
            RowError::CpuReCheck => DbError::new("Row cannot be reduced on the device"),
            RowError::Fatal(err) => err,
        }
    }
}

impl From<DbError> for RowError {
    fn from(value: DbError) -> Self {
        RowError::Fatal(value)
    }
}

/// A compiled reduction module.
///
/// Projected rows hold the group keys in the first `num_group_keys` columns
/// followed by partial aggregate states.
pub trait ReductionKernels: Debug + Sync + Send {
    fn num_group_keys(&self) -> usize;

    /// Total number of columns in a projected row.
    fn num_columns(&self) -> usize;

    /// If projected rows may contain out of line values which need to be
    /// fixed up before the final buffer can be read back.
    fn has_notbyval(&self) -> bool;

    /// Turn an input row into a partial row holding a single row's state.
    fn projection(&self, row: &[Datum]) -> Result<PartialRow, RowError>;

    /// Hash the group keys of a projected row.
    fn hash_value(&self, row: &[Datum]) -> u64;

    /// Check if two projected rows belong to the same group.
    fn key_match(&self, a: &[Datum], b: &[Datum]) -> bool;

    /// Combine `row` into `acc` within a thread block.
    ///
    /// `acc` is left unchanged on error.
    fn local_combine(&self, acc: &mut [Datum], row: &[Datum]) -> Result<(), RowError>;

    /// Combine `row` into `acc` across the device, and into the final buffer.
    fn global_combine(&self, acc: &mut [Datum], row: &[Datum]) -> Result<(), RowError>;

    /// Combine `row` into the single running total when there are no group
    /// keys.
    fn nogroup_combine(&self, acc: &mut [Datum], row: &[Datum]) -> Result<(), RowError>;
}
