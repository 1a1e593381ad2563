use std::fmt::Debug;

use preagg_error::Result;

use crate::datum::Datum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFormat {
    /// Rows are materialized and the row count is exact.
    Row,
    /// Rows are stored in blocks. The true row count is only known once the
    /// blocks are read, `rows_per_block` is the estimated density.
    Block {
        blocks: usize,
        rows_per_block: usize,
    },
}

/// One batch of input rows processed by a single reduction task.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChunk {
    pub format: ChunkFormat,
    pub rows: Vec<Vec<Datum>>,
}

impl RowChunk {
    pub fn new(rows: Vec<Vec<Datum>>) -> Self {
        RowChunk {
            format: ChunkFormat::Row,
            rows,
        }
    }

    pub fn new_block(blocks: usize, rows_per_block: usize, rows: Vec<Vec<Datum>>) -> Self {
        RowChunk {
            format: ChunkFormat::Block {
                blocks,
                rows_per_block,
            },
            rows,
        }
    }

    /// Row count used to size the task's private buffers before the chunk is
    /// read on the device.
    pub fn estimated_rows(&self) -> usize {
        match self.format {
            ChunkFormat::Row => self.rows.len(),
            ChunkFormat::Block {
                blocks,
                rows_per_block,
            } => blocks * rows_per_block,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Number of bytes needed to hold this chunk in device memory.
    pub fn byte_len(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.iter().map(|d| d.transfer_len()).sum::<usize>())
            .sum()
    }
}

/// Lazy, restartable sequence of row chunks.
pub trait RowSource: Debug + Send {
    /// Get the next chunk, returning None once the source is exhausted.
    fn next_chunk(&mut self) -> Result<Option<RowChunk>>;

    /// Restart the source from the beginning.
    fn rescan(&mut self) -> Result<()>;
}

/// Row source over chunks that are already in memory.
#[derive(Debug, Clone)]
pub struct ChunkedRowSource {
    chunks: Vec<RowChunk>,
    pos: usize,
}

impl ChunkedRowSource {
    pub fn new(chunks: impl IntoIterator<Item = RowChunk>) -> Self {
        ChunkedRowSource {
            chunks: chunks.into_iter().collect(),
            pos: 0,
        }
    }

    /// Split `rows` into row-format chunks of at most `rows_per_chunk` rows.
    pub fn from_rows(rows: Vec<Vec<Datum>>, rows_per_chunk: usize) -> Self {
        let rows_per_chunk = rows_per_chunk.max(1);
        let mut chunks = Vec::with_capacity(rows.len().div_ceil(rows_per_chunk));
        let mut iter = rows.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<_> = iter.by_ref().take(rows_per_chunk).collect();
            chunks.push(RowChunk::new(chunk));
        }

        ChunkedRowSource { chunks, pos: 0 }
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

impl RowSource for ChunkedRowSource {
    fn next_chunk(&mut self) -> Result<Option<RowChunk>> {
        let chunk = self.chunks.get(self.pos).cloned();
        if chunk.is_some() {
            self.pos += 1;
        }
        Ok(chunk)
    }

    fn rescan(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }
}
