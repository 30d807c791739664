use async_trait::async_trait;
use etl_core::reporter::ProgressReporter;
use etl_core::{BatchProcessor, BatchResult, Chunk, EtlError};
use std::sync::Arc;

/// Drains a predecessor to exhaustion, reporting progress after every batch
/// and folding all of its statistics into one final result.
///
/// Every processor chain ends in a `ClosedLoopBatchProcessor` equivalent:
/// without one, nothing ever actually pulls rows through the chain, since
/// `BatchProcessor` is pull-based end to end. The final `BatchResult` it
/// yields carries an empty chunk and `batch_size` equal to the true total
/// of rows processed upstream — not the `max_batch_size` it was asked for,
/// which the original implementation echoed back by mistake.
pub struct ClosedLoopTerminator<P> {
    predecessor: P,
    reporter: Arc<dyn ProgressReporter>,
    processor_name: String,
    exhausted: bool,
}

impl<P: BatchProcessor> ClosedLoopTerminator<P> {
    pub fn new(predecessor: P, reporter: Arc<dyn ProgressReporter>, processor_name: impl Into<String>) -> Self {
        Self { predecessor, reporter, processor_name: processor_name.into(), exhausted: false }
    }
}

#[async_trait]
impl<P: BatchProcessor> BatchProcessor for ClosedLoopTerminator<P> {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        if self.exhausted {
            return Ok(None);
        }
        self.exhausted = true;

        let mut total = BatchResult::empty();
        while let Some(batch) = self.predecessor.get_batch(max_batch_size).await? {
            total.statistics += batch.statistics.clone();
            total.batch_size += batch.batch_size;
            self.reporter.report_progress(&self.processor_name, &batch).await;
        }

        total.chunk = Chunk::Rows(Vec::new());
        Ok(Some(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_core::reporter::TaskTreeSpec;
    use etl_core::row::Row;
    use etl_core::task::TaskReturn;
    use etl_core::Statistics;
    use std::sync::Mutex;

    struct RecordingReporter {
        batches: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingReporter {
        fn new() -> Self {
            Self { batches: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ProgressReporter for RecordingReporter {
        async fn register_tasks(&self, _tree: &TaskTreeSpec) {}
        async fn started_task(&self, _name: &str) {}
        async fn finished_task(&self, _name: &str, _result: &TaskReturn) {}
        async fn report_progress(&self, processor_name: &str, batch: &BatchResult) {
            self.batches.lock().unwrap().push((processor_name.to_string(), batch.batch_size));
        }
    }

    struct FixedBatches(Vec<Vec<Row>>);

    #[async_trait]
    impl BatchProcessor for FixedBatches {
        async fn get_batch(&mut self, _max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
            if self.0.is_empty() {
                return Ok(None);
            }
            let rows = self.0.remove(0);
            let batch_size = rows.len();
            Ok(Some(BatchResult { chunk: Chunk::Rows(rows), statistics: Statistics::single("rows_read", batch_size as i64), batch_size }))
        }
    }

    #[tokio::test]
    async fn reports_progress_per_batch_and_merges_statistics() {
        let predecessor = FixedBatches(vec![vec![Row::new(), Row::new()], vec![Row::new()]]);
        let reporter = Arc::new(RecordingReporter::new());
        let mut terminator = ClosedLoopTerminator::new(predecessor, reporter.clone(), "loader");

        let result = terminator.get_batch(100).await.unwrap().unwrap();
        assert!(result.chunk.is_empty());
        assert_eq!(result.batch_size, 3);
        assert_eq!(result.statistics.get("rows_read"), 3);

        let recorded = reporter.batches.lock().unwrap();
        assert_eq!(recorded.as_slice(), &[("loader".to_string(), 2), ("loader".to_string(), 1)]);

        assert!(terminator.get_batch(100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_source_yields_one_empty_result() {
        let predecessor = FixedBatches(Vec::new());
        let reporter = Arc::new(RecordingReporter::new());
        let mut terminator = ClosedLoopTerminator::new(predecessor, reporter, "loader");

        let result = terminator.get_batch(100).await.unwrap().unwrap();
        assert!(result.chunk.is_empty());
        assert_eq!(result.batch_size, 0);
        assert!(terminator.get_batch(100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_size_reflects_actual_total_not_requested_max() {
        let predecessor = FixedBatches(vec![vec![Row::new()]]);
        let reporter = Arc::new(RecordingReporter::new());
        let mut terminator = ClosedLoopTerminator::new(predecessor, reporter, "loader");

        let result = terminator.get_batch(5_000).await.unwrap().unwrap();
        assert_eq!(result.batch_size, 1);
    }
}
