use std::ops::Range;

use serde::Serialize;

/// Bytes of a row slot holding a by-value datum.
pub const DATUM_BYTES: usize = 8;
/// Bytes of the per-datum null flag.
pub const ISNULL_BYTES: usize = 1;
pub const ALIGN: usize = 8;
/// Fixed header at the start of every final buffer.
pub const HEAD_BYTES: usize = 64;
/// Per-column metadata stored in the header.
pub const COLMETA_BYTES: usize = 16;
pub const HASH_SLOT_BYTES: usize = 8;

/// Round up to `ALIGN`, saturating at the largest aligned `usize`.
pub const fn align_up(n: usize) -> usize {
    match n.div_ceil(ALIGN).checked_mul(ALIGN) {
        Some(n) => n,
        None => usize::MAX / ALIGN * ALIGN,
    }
}

/// Bytes of a single row slot with `ncols` columns.
pub const fn row_unit_bytes(ncols: usize) -> usize {
    align_up(ncols * (DATUM_BYTES + ISNULL_BYTES))
}

/// Byte layout of a final buffer.
///
/// All regions live in a single allocation and are computed once when the
/// layout is created:
///
/// ```text
/// | head | row slots (nrooms) | hash slots (2 * nrooms) | extra |
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalBufferLayout {
    pub ncols: usize,
    /// Number of row slots.
    pub nrooms: usize,
    /// Number of hash slots, always twice the number of row slots.
    pub hash_slots: usize,
    /// Capacity of the out of line area.
    pub extra_bytes: usize,
    /// Number of distinct copies of each group spread across the table.
    pub key_dist_salt: usize,
    pub head: Range<usize>,
    pub rows: Range<usize>,
    pub hash: Range<usize>,
    pub extra: Range<usize>,
}

impl FinalBufferLayout {
    /// Create a layout for at least `nrooms` row slots.
    ///
    /// The total footprint is rounded up to a multiple of `chunk_bytes` (and
    /// never less than a single chunk). The extra row slots gained from
    /// rounding are kept.
    ///
    /// Sizes saturate at `usize::MAX` instead of overflowing. Such a layout
    /// can never be allocated.
    pub fn new_quantized(
        ncols: usize,
        nrooms: usize,
        extra_per_row: usize,
        key_dist_salt: usize,
        chunk_bytes: usize,
    ) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        let head_bytes = align_up(HEAD_BYTES + ncols * COLMETA_BYTES);
        let unit = Self::bytes_per_room(ncols, extra_per_row);

        let len = nrooms.saturating_mul(unit).saturating_add(head_bytes);
        let total = len
            .div_ceil(chunk_bytes)
            .max(1)
            .saturating_mul(chunk_bytes);
        let nrooms = (total.saturating_sub(head_bytes) / unit).max(nrooms);

        Self::new_exact(ncols, nrooms, extra_per_row, key_dist_salt)
    }

    /// Create a layout with exactly `nrooms` row slots.
    pub fn new_exact(
        ncols: usize,
        nrooms: usize,
        extra_per_row: usize,
        key_dist_salt: usize,
    ) -> Self {
        let head_bytes = align_up(HEAD_BYTES + ncols * COLMETA_BYTES);
        let hash_slots = nrooms.saturating_mul(2);
        let extra_bytes = align_up(nrooms.saturating_mul(extra_per_row));

        let head = 0..head_bytes;
        let rows = head.end..region_end(head.end, nrooms, row_unit_bytes(ncols));
        let hash = rows.end..region_end(rows.end, hash_slots, HASH_SLOT_BYTES);
        let extra = hash.end..hash.end.saturating_add(extra_bytes);

        FinalBufferLayout {
            ncols,
            nrooms,
            hash_slots,
            extra_bytes,
            key_dist_salt: key_dist_salt.max(1),
            head,
            rows,
            hash,
            extra,
        }
    }

    fn bytes_per_room(ncols: usize, extra_per_row: usize) -> usize {
        (row_unit_bytes(ncols) + 2 * HASH_SLOT_BYTES).saturating_add(extra_per_row)
    }

    pub fn total_bytes(&self) -> usize {
        self.extra.end
    }

    /// Extra bytes available per row slot.
    pub fn extra_per_row(&self) -> usize {
        if self.nrooms == 0 {
            0
        } else {
            self.extra_bytes / self.nrooms
        }
    }
}

fn region_end(start: usize, count: usize, unit: usize) -> usize {
    start.saturating_add(count.saturating_mul(unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_contiguous() {
        let layout = FinalBufferLayout::new_exact(3, 100, 16, 1);
        assert_eq!(0, layout.head.start);
        assert_eq!(layout.head.end, layout.rows.start);
        assert_eq!(layout.rows.end, layout.hash.start);
        assert_eq!(layout.hash.end, layout.extra.start);
        assert_eq!(200, layout.hash_slots);
        assert_eq!(1600, layout.extra_bytes);
        assert_eq!(layout.extra.end, layout.total_bytes());
    }

    #[test]
    fn quantized_fills_single_chunk() {
        let chunk = 64 * 1024;
        let layout = FinalBufferLayout::new_quantized(2, 10, 0, 1, chunk);
        assert!(layout.nrooms > 10);
        assert!(layout.total_bytes() <= chunk);

        // Rounding up happens in whole chunks.
        let bigger = FinalBufferLayout::new_quantized(2, layout.nrooms + 1, 0, 1, chunk);
        assert!(bigger.total_bytes() > chunk);
        assert!(bigger.total_bytes() <= 2 * chunk);
    }

    #[test]
    fn quantized_tiny_chunk_is_exact() {
        let layout = FinalBufferLayout::new_quantized(2, 10, 0, 1, 1);
        assert_eq!(10, layout.nrooms);
    }

    #[test]
    fn huge_layout_saturates() {
        let layout = FinalBufferLayout::new_quantized(2, usize::MAX / 4, 16, 1, 64 * 1024);
        assert_eq!(usize::MAX, layout.total_bytes());
        assert_eq!(usize::MAX / 4 * 2, layout.hash_slots);
        assert!(layout.rows.end <= layout.hash.start);
    }
}
