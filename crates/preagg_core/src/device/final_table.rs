use std::sync::Arc;

use parking_lot::Mutex;
use preagg_error::{DbError, OptionExt, Result, ResultExt};

use super::memory::DeviceAllocation;
use crate::buffer::layout::FinalBufferLayout;
use crate::datum::{Datum, PartialRow};
use crate::kernels::{ReductionKernels, RowError};
use crate::kernels::hash::combine_hashes;

/// A value stored in a final buffer row slot.
#[derive(Debug, Clone, PartialEq)]
enum SlotDatum {
    Value(Datum),
    /// Out of line bytes stored in the extra area.
    Extra { offset: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HashEntry {
    hash: u64,
    row: usize,
}

/// Why combining a row into the table stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// The row needed more space than the buffer has left.
    NoSpace,
    /// The row can't be combined on the device.
    CpuReCheck,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CombineStats {
    /// Groups newly inserted.
    pub new_groups: usize,
    /// Extra bytes consumed.
    pub extra_used: usize,
    /// Set if the buffer ran out of space before all rows were combined.
    pub exhausted: bool,
    /// Set if a row needs re-checking on the CPU. That row and every row
    /// after it are left uncombined.
    pub recheck: bool,
}

#[derive(Debug)]
struct FinalTable {
    initialized: bool,
    slots: Vec<Option<HashEntry>>,
    rows: Vec<Vec<SlotDatum>>,
    extra: Vec<u8>,
    /// If any row holds a value in the extra area.
    has_unfixed: bool,
}

/// Device resident storage for a final buffer.
///
/// Holds the device memory for the buffer. Memory is returned to the pool
/// when the storage is dropped.
#[derive(Debug)]
pub struct FinalStorage {
    layout: FinalBufferLayout,
    table: Mutex<FinalTable>,
    _allocation: DeviceAllocation,
}

impl FinalStorage {
    pub fn new(layout: FinalBufferLayout, allocation: DeviceAllocation) -> Self {
        FinalStorage {
            table: Mutex::new(FinalTable {
                initialized: false,
                slots: Vec::new(),
                rows: Vec::new(),
                extra: Vec::new(),
                has_unfixed: false,
            }),
            layout,
            _allocation: allocation,
        }
    }

    pub fn layout(&self) -> &FinalBufferLayout {
        &self.layout
    }

    /// Reset all hash slots. Runs as the hash table initializer kernel.
    pub fn init_hash(&self) {
        let mut table = self.table.lock();
        table.slots = vec![None; self.layout.hash_slots];
        table.rows = Vec::with_capacity(self.layout.nrooms);
        table.extra = Vec::with_capacity(self.layout.extra_bytes);
        table.has_unfixed = false;
        table.initialized = true;
    }

    pub fn num_groups(&self) -> usize {
        self.table.lock().rows.len()
    }

    /// Combine partial rows into the table.
    ///
    /// `rows` is consumed front to back. On running out of space, the rows
    /// that were not combined are left in `rows` and the returned stats are
    /// marked exhausted. A row that can't be combined on the device stops the
    /// combine the same way, with the stats marked for recheck. Rows are
    /// combined whole, a row is never partially applied.
    pub fn combine(
        &self,
        kernels: &dyn ReductionKernels,
        rows: &mut Vec<PartialRow>,
        salt_offset: usize,
    ) -> Result<CombineStats> {
        let mut table = self.table.lock();
        if !table.initialized {
            return Err(DbError::new("Final buffer hash table not initialized"));
        }

        let mut stats = CombineStats::default();
        let mut combined = 0;
        let salt = self.layout.key_dist_salt;

        for (idx, row) in rows.iter().enumerate() {
            let salt_id = (salt_offset + idx) % salt;
            let hash = combine_hashes(kernels.hash_value(row), salt_id as u64);
            match table.combine_row(&self.layout, kernels, row, hash)? {
                Ok(row_stats) => {
                    stats.new_groups += row_stats.new_groups;
                    stats.extra_used += row_stats.extra_used;
                    combined += 1;
                }
                Err(Stop::NoSpace) => {
                    stats.exhausted = true;
                    break;
                }
                Err(Stop::CpuReCheck) => {
                    stats.recheck = true;
                    break;
                }
            }
        }

        if combined < rows.len() {
            rows.drain(..combined);
            return Ok(stats);
        }

        rows.clear();
        Ok(stats)
    }

    /// Move out of line values back inline. A no-op if there's nothing to
    /// fix up.
    pub fn fixup_varlena(&self) -> Result<()> {
        let mut table = self.table.lock();
        if !table.has_unfixed {
            return Ok(());
        }

        let FinalTable { rows, extra, .. } = &mut *table;
        for row in rows.iter_mut() {
            for slot in row.iter_mut() {
                if let SlotDatum::Extra { offset, len } = *slot {
                    *slot = SlotDatum::Value(read_extra(extra, offset, len)?);
                }
            }
        }
        table.has_unfixed = false;

        Ok(())
    }

    /// Copy all rows back to the host.
    ///
    /// Errors if out of line values haven't been fixed up.
    pub fn copy_to_host(&self) -> Result<Vec<PartialRow>> {
        let table = self.table.lock();
        if table.has_unfixed {
            return Err(DbError::new(
                "Final buffer contains variable-length values that were not fixed up",
            ));
        }

        table
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|slot| match slot {
                        SlotDatum::Value(d) => Ok(d.clone()),
                        SlotDatum::Extra { .. } => Err(DbError::new("Unexpected out of line value")),
                    })
                    .collect()
            })
            .collect()
    }
}

impl FinalTable {
    fn combine_row(
        &mut self,
        layout: &FinalBufferLayout,
        kernels: &dyn ReductionKernels,
        row: &[Datum],
        hash: u64,
    ) -> Result<Result<CombineStats, Stop>> {
        let cap = self.slots.len();
        if cap == 0 {
            return Ok(Err(Stop::NoSpace));
        }

        let mut offset = (hash % cap as u64) as usize;
        for _ in 0..cap {
            match self.slots[offset] {
                Some(ent) if ent.hash == hash => {
                    let mut existing = self.materialize(ent.row)?;
                    if kernels.key_match(&existing, row) {
                        match kernels.global_combine(&mut existing, row) {
                            Ok(()) => return self.write_back(layout, ent.row, existing),
                            Err(RowError::CpuReCheck) => return Ok(Err(Stop::CpuReCheck)),
                            Err(RowError::Fatal(err)) => return Err(err),
                        }
                    }
                }
                Some(_) => (),
                None => return self.insert(layout, offset, hash, row),
            }
            offset = inc_and_wrap_offset(offset, cap);
        }

        Ok(Err(Stop::NoSpace))
    }

    fn insert(
        &mut self,
        layout: &FinalBufferLayout,
        slot: usize,
        hash: u64,
        row: &[Datum],
    ) -> Result<Result<CombineStats, Stop>> {
        if self.rows.len() >= layout.nrooms {
            return Ok(Err(Stop::NoSpace));
        }
        let needed: usize = row.iter().map(|d| d.out_of_line_len()).sum();
        if self.extra.len() + needed > layout.extra_bytes {
            return Ok(Err(Stop::NoSpace));
        }

        let stored: Vec<_> = row.iter().map(|d| self.store(d)).collect();
        let row_idx = self.rows.len();
        self.rows.push(stored);
        self.slots[slot] = Some(HashEntry { hash, row: row_idx });

        Ok(Ok(CombineStats {
            new_groups: 1,
            extra_used: needed,
            ..Default::default()
        }))
    }

    fn write_back(
        &mut self,
        layout: &FinalBufferLayout,
        row_idx: usize,
        combined: PartialRow,
    ) -> Result<Result<CombineStats, Stop>> {
        // Only values that changed need new out of line space.
        let current = self.materialize(row_idx)?;
        let needed: usize = combined
            .iter()
            .zip(&current)
            .filter(|(new, old)| new != old)
            .map(|(new, _)| new.out_of_line_len())
            .sum();
        if self.extra.len() + needed > layout.extra_bytes {
            return Ok(Err(Stop::NoSpace));
        }

        for (col, (new, old)) in combined.iter().zip(&current).enumerate() {
            if new != old {
                let stored = self.store(new);
                self.rows[row_idx][col] = stored;
            }
        }

        Ok(Ok(CombineStats {
            new_groups: 0,
            extra_used: needed,
            ..Default::default()
        }))
    }

    fn store(&mut self, datum: &Datum) -> SlotDatum {
        match datum {
            Datum::Text(s) => {
                let offset = self.extra.len();
                self.extra.extend_from_slice(s.as_bytes());
                self.has_unfixed = true;
                SlotDatum::Extra {
                    offset,
                    len: s.len(),
                }
            }
            other => SlotDatum::Value(other.clone()),
        }
    }

    fn materialize(&self, row_idx: usize) -> Result<PartialRow> {
        let row = self
            .rows
            .get(row_idx)
            .ok_or_else(|| DbError::new("Hash slot points past row area").with_field("row", row_idx))?;

        row.iter()
            .map(|slot| match slot {
                SlotDatum::Value(d) => Ok(d.clone()),
                SlotDatum::Extra { offset, len } => read_extra(&self.extra, *offset, *len),
            })
            .collect()
    }
}

fn read_extra(extra: &[u8], offset: usize, len: usize) -> Result<Datum> {
    let bytes = extra
        .get(offset..offset.saturating_add(len))
        .required("Out of line value past extra area")?;
    let s = std::str::from_utf8(bytes).context("Invalid out of line text")?;
    Ok(Datum::Text(Arc::from(s)))
}

/// Increment offset by one, wrapping around to zero at `cap`.
const fn inc_and_wrap_offset(offset: usize, cap: usize) -> usize {
    if offset + 1 == cap { 0 } else { offset + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::DeviceMemoryPool;
    use crate::kernels::aggregate::{AggregateKind, GroupKey, GroupedAggregateKernels};

    fn storage(nrooms: usize, extra_per_row: usize, salt: usize) -> FinalStorage {
        let layout = FinalBufferLayout::new_exact(2, nrooms, extra_per_row, salt);
        let pool = DeviceMemoryPool::new(1 << 20);
        let alloc = pool.allocate(layout.total_bytes()).unwrap();
        let storage = FinalStorage::new(layout, alloc);
        storage.init_hash();
        storage
    }

    fn count_kernels() -> GroupedAggregateKernels {
        GroupedAggregateKernels::new([GroupKey::int(0)], [AggregateKind::Count(None)])
    }

    fn partial(key: i64, count: i64) -> PartialRow {
        vec![Datum::Int64(key), Datum::Int64(count)]
    }

    #[test]
    fn combine_groups() {
        let s = storage(10, 0, 1);
        let k = count_kernels();
        let mut rows = vec![partial(1, 1), partial(2, 1), partial(1, 3)];
        let stats = s.combine(&k, &mut rows, 0).unwrap();
        assert_eq!(2, stats.new_groups);
        assert!(!stats.exhausted);
        assert!(rows.is_empty());

        let mut out = s.copy_to_host().unwrap();
        out.sort_by_key(|r| r[0].try_as_i64());
        assert_eq!(vec![partial(1, 4), partial(2, 1)], out);
    }

    #[test]
    fn no_space_keeps_remainder() {
        let s = storage(2, 0, 1);
        let k = count_kernels();
        let mut rows = vec![partial(1, 1), partial(2, 1), partial(1, 1), partial(3, 1), partial(4, 1)];
        let stats = s.combine(&k, &mut rows, 0).unwrap();
        assert!(stats.exhausted);
        assert_eq!(2, stats.new_groups);
        assert_eq!(vec![partial(3, 1), partial(4, 1)], rows);
        assert_eq!(2, s.num_groups());
    }

    #[test]
    fn salt_spreads_groups() {
        let s = storage(10, 0, 3);
        let k = count_kernels();
        let mut rows = vec![partial(1, 1); 6];
        s.combine(&k, &mut rows, 0).unwrap();

        let out = s.copy_to_host().unwrap();
        assert_eq!(3, out.len());
        let total: i64 = out.iter().map(|r| r[1].try_as_i64().unwrap()).sum();
        assert_eq!(6, total);
    }

    #[test]
    fn text_requires_fixup() {
        let s = storage(10, 16, 1);
        let k = GroupedAggregateKernels::new([GroupKey::text(0)], [AggregateKind::MaxText(1)]);
        let mut rows = vec![
            vec![Datum::text("a"), Datum::text("x")],
            vec![Datum::text("a"), Datum::text("z")],
            vec![Datum::text("a"), Datum::text("y")],
        ];
        let stats = s.combine(&k, &mut rows, 0).unwrap();
        assert_eq!(3, stats.extra_used);

        s.copy_to_host().unwrap_err();
        s.fixup_varlena().unwrap();
        // Idempotent.
        s.fixup_varlena().unwrap();

        let out = s.copy_to_host().unwrap();
        assert_eq!(vec![vec![Datum::text("a"), Datum::text("z")]], out);
    }

    #[test]
    fn fixup_without_varlena_is_noop() {
        let s = storage(10, 0, 1);
        let k = count_kernels();
        let mut rows = vec![partial(7, 2)];
        s.combine(&k, &mut rows, 0).unwrap();

        let before = s.copy_to_host().unwrap();
        s.fixup_varlena().unwrap();
        assert_eq!(before, s.copy_to_host().unwrap());
    }

    #[test]
    fn extra_area_exhausted() {
        let s = storage(4, 1, 1);
        let k = GroupedAggregateKernels::new([GroupKey::text(0)], [AggregateKind::Count(None)]);
        let mut rows = vec![
            vec![Datum::text("abc"), Datum::Int64(1)],
            vec![Datum::text("def"), Datum::Int64(1)],
            vec![Datum::text("ghi"), Datum::Int64(1)],
        ];
        // 8 bytes of extra space fits two keys.
        let stats = s.combine(&k, &mut rows, 0).unwrap();
        assert!(stats.exhausted);
        assert_eq!(1, rows.len());
    }

    #[test]
    fn overflowing_row_stops_combine() {
        let s = storage(10, 0, 1);
        let k = GroupedAggregateKernels::new([GroupKey::int(0)], [AggregateKind::Sum(1)]);
        let mut rows = vec![partial(1, i64::MAX), partial(2, 1), partial(1, 1), partial(3, 1)];
        let stats = s.combine(&k, &mut rows, 0).unwrap();
        assert!(stats.recheck);
        assert!(!stats.exhausted);
        assert_eq!(2, stats.new_groups);
        assert_eq!(vec![partial(1, 1), partial(3, 1)], rows);

        let mut out = s.copy_to_host().unwrap();
        out.sort_by_key(|r| r[0].try_as_i64());
        assert_eq!(vec![partial(1, i64::MAX), partial(2, 1)], out);
    }

    #[test]
    fn combine_before_init_errors() {
        let layout = FinalBufferLayout::new_exact(2, 4, 0, 1);
        let pool = DeviceMemoryPool::new(1 << 20);
        let s = FinalStorage::new(layout, pool.allocate(8).unwrap());
        let mut rows = vec![partial(1, 1)];
        s.combine(&count_kernels(), &mut rows, 0).unwrap_err();
    }

    #[test]
    fn read_extra_bounds_and_utf8() {
        assert_eq!(Datum::text("bc"), read_extra(b"abcd", 1, 2).unwrap());

        let err = read_extra(b"abcd", 3, 2).unwrap_err();
        assert_eq!("Out of line value past extra area", err.get_msg());

        let err = read_extra(&[0xff, 0xfe], 0, 2).unwrap_err();
        assert_eq!("Invalid out of line text", err.get_msg());
        assert!(std::error::Error::source(&err).is_some());
    }
}
