use crate::row::Row;
use crate::statistics::Statistics;

/// The payload a [`crate::processor::BatchProcessor`] hands back from one
/// `get_batch` call.
///
/// A chunk is either a flat sequence of rows (the common case) or, once a
/// splitting stage has partitioned rows into buckets, an ordered sequence of
/// bucket-batches that a parallel stage consumes one bucket per worker.
#[derive(Debug, Clone)]
pub enum Chunk {
    Rows(Vec<Row>),
    Buckets(Vec<Vec<Row>>),
}

impl Chunk {
    pub fn len(&self) -> usize {
        match self {
            Chunk::Rows(rows) => rows.len(),
            Chunk::Buckets(buckets) => buckets.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            Chunk::Rows(rows) => Some(rows),
            Chunk::Buckets(_) => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Chunk::Rows(rows) => Some(rows),
            Chunk::Buckets(_) => None,
        }
    }
}

/// Result of one `get_batch` call: the chunk produced, the statistics
/// accrued while producing it, and the number of rows it represents.
///
/// `batch_size` is distinct from `chunk.len()`: a processor may advertise a
/// maximum request size larger than what it actually had available, and a
/// terminating processor reports the true cumulative row count it drained
/// from its predecessor rather than the batch size it was asked for.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub chunk: Chunk,
    pub statistics: Statistics,
    pub batch_size: usize,
}

impl BatchResult {
    pub fn new(chunk: Chunk, statistics: Statistics) -> Self {
        let batch_size = chunk.len();
        Self { chunk, statistics, batch_size }
    }

    pub fn empty() -> Self {
        Self { chunk: Chunk::Rows(Vec::new()), statistics: Statistics::new(), batch_size: 0 }
    }
}

/// Merges `addition` into `accumulator`'s statistics in place and replaces
/// its chunk/batch_size with `addition`'s — the fold used by every stage
/// that drains a predecessor across several `get_batch` calls before
/// yielding its own result.
pub fn append_result(accumulator: &mut BatchResult, addition: BatchResult) {
    accumulator.statistics += addition.statistics;
    accumulator.chunk = addition.chunk;
    accumulator.batch_size = addition.batch_size;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_len_sums_across_buckets() {
        let chunk = Chunk::Buckets(vec![vec![Row::new(), Row::new()], vec![Row::new()]]);
        assert_eq!(chunk.len(), 3);
    }

    #[test]
    fn append_result_merges_statistics_and_replaces_chunk() {
        let mut acc = BatchResult::new(Chunk::Rows(vec![Row::new()]), Statistics::single("rows_read", 1));
        let addition = BatchResult::new(Chunk::Rows(vec![Row::new(), Row::new()]), Statistics::single("rows_read", 2));
        append_result(&mut acc, addition);
        assert_eq!(acc.statistics.get("rows_read"), 3);
        assert_eq!(acc.batch_size, 2);
    }
}
