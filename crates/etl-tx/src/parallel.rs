use async_trait::async_trait;
use etl_core::row::Row;
use etl_core::{BatchProcessor, BatchResult, Chunk, EtlError, Statistics};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

/// The simplest possible [`BatchProcessor`]: hands back exactly one batch
/// (the bucket-batch it was constructed with) and is exhausted after that.
///
/// Used to wrap one bucket-batch so a fresh `worker_factory()` chain has
/// something to pull from, matching the original's `SingleBatchWrapper`.
pub struct SingleBatchSource {
    batch: Option<Vec<Row>>,
}

impl SingleBatchSource {
    pub fn new(batch: Vec<Row>) -> Self {
        Self { batch: Some(batch) }
    }
}

#[async_trait]
impl BatchProcessor for SingleBatchSource {
    async fn get_batch(&mut self, _max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        Ok(self.batch.take().map(|rows| BatchResult::new(Chunk::Rows(rows), Statistics::new())))
    }
}

/// Builds a fresh worker chain rooted at a given bucket-batch source, so
/// every bucket in a wave gets its own sink session rather than sharing
/// one across worker tasks.
pub type WorkerFactory = Arc<dyn Fn(SingleBatchSource) -> Box<dyn BatchProcessor> + Send + Sync>;

/// Dispatches each wave's bucket-batches to a bounded worker pool,
/// prefetching waves from the predecessor on a background task.
///
/// The predecessor MUST emit [`Chunk::Buckets`] chunks (i.e. must be a
/// [`crate::splitter::SplittingProcessor`] or another wave producer). The
/// `max_batch_size` passed to this processor's first `get_batch` call is
/// the value forwarded to the predecessor for the lifetime of the run —
/// the predecessor needs one stable grid parameter, not a per-call hint.
pub struct ParallelWaveProcessor<P> {
    predecessor: Option<P>,
    worker_factory: WorkerFactory,
    max_workers: usize,
    prefetch: usize,
    waves: Option<mpsc::Receiver<Result<BatchResult, EtlError>>>,
    producer: Option<JoinHandle<()>>,
}

impl<P: BatchProcessor + 'static> ParallelWaveProcessor<P> {
    pub fn new(predecessor: P, worker_factory: WorkerFactory, max_workers: usize, prefetch: usize) -> Self {
        Self { predecessor: Some(predecessor), worker_factory, max_workers, prefetch, waves: None, producer: None }
    }

    /// Spawns the single-producer prefetch task on first use, with a
    /// bounded channel of capacity `prefetch + 1`: room for `prefetch`
    /// waves plus the one currently in flight.
    fn ensure_producer(&mut self, max_batch_size: usize) {
        if self.waves.is_some() {
            return;
        }
        let mut predecessor = self.predecessor.take().expect("producer started twice");
        let (tx, rx) = mpsc::channel(self.prefetch + 1);

        let handle = tokio::spawn(async move {
            loop {
                match predecessor.get_batch(max_batch_size).await {
                    Ok(Some(wave)) => {
                        if tx.send(Ok(wave)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        self.waves = Some(rx);
        self.producer = Some(handle);
    }

    async fn process_wave(&self, wave: BatchResult) -> Result<BatchResult, EtlError> {
        let buckets = match wave.chunk {
            Chunk::Buckets(buckets) => buckets,
            Chunk::Rows(_) => return Err(EtlError::Splitter("parallel wave processor predecessor did not emit a wave".into())),
        };

        debug!(bucket_count = buckets.len(), "processing wave");

        let semaphore = Arc::new(Semaphore::new(self.max_workers.max(1)));
        let mut set: JoinSet<Result<Option<BatchResult>, EtlError>> = JoinSet::new();
        for bucket in buckets {
            let factory = self.worker_factory.clone();
            let permit = semaphore.clone();
            set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                let len = bucket.len();
                let mut worker = factory(SingleBatchSource::new(bucket));
                worker.get_batch(len).await
            });
        }

        let mut merged_statistics = wave.statistics;
        let mut merged_chunk = Vec::new();
        let mut total = 0usize;

        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(inner) => inner,
                Err(join_err) => Err(EtlError::worker(anyhow::anyhow!("worker task panicked: {join_err}"))),
            };
            match outcome {
                Ok(Some(result)) => {
                    merged_statistics += result.statistics;
                    total += result.batch_size;
                    if let Some(rows) = result.chunk.into_rows() {
                        merged_chunk.extend(rows);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    return Err(EtlError::worker(e));
                }
            }
        }

        Ok(BatchResult { chunk: Chunk::Rows(merged_chunk), statistics: merged_statistics, batch_size: total })
    }
}

#[async_trait]
impl<P: BatchProcessor + 'static> BatchProcessor for ParallelWaveProcessor<P> {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        self.ensure_producer(max_batch_size);
        let wave = match self.waves.as_mut().expect("producer started").recv().await {
            Some(Ok(wave)) => wave,
            Some(Err(e)) => return Err(e),
            None => return Ok(None),
        };
        Some(self.process_wave(wave).await).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_core::value::Value;

    struct FixedWaves(Option<Vec<Vec<Vec<Row>>>>);

    #[async_trait]
    impl BatchProcessor for FixedWaves {
        async fn get_batch(&mut self, _max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
            let Some(mut waves) = self.0.take() else { return Ok(None) };
            if waves.is_empty() {
                return Ok(None);
            }
            let wave = waves.remove(0);
            self.0 = Some(waves);
            let size = wave.iter().map(Vec::len).sum();
            Ok(Some(BatchResult { chunk: Chunk::Buckets(wave), statistics: Statistics::new(), batch_size: size }))
        }
    }

    fn row_with_marker(boom: bool) -> Row {
        let mut row = Row::new();
        row.insert("boom".into(), Value::Bool(boom));
        row
    }

    fn counting_worker_factory() -> WorkerFactory {
        Arc::new(|mut source: SingleBatchSource| {
            Box::new(CountingWorker { source: Some(source.batch.take().unwrap_or_default()) }) as Box<dyn BatchProcessor>
        })
    }

    struct CountingWorker {
        source: Option<Vec<Row>>,
    }

    #[async_trait]
    impl BatchProcessor for CountingWorker {
        async fn get_batch(&mut self, _max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
            let Some(rows) = self.source.take() else { return Ok(None) };
            if rows.iter().any(|r| r.get("boom").and_then(|v| if let Value::Bool(b) = v { Some(*b) } else { None }).unwrap_or(false)) {
                return Err(EtlError::worker(anyhow::anyhow!("worker exploded on marker row")));
            }
            let statistics = Statistics::single("rows_written", rows.len() as i64);
            let batch_size = rows.len();
            Ok(Some(BatchResult { chunk: Chunk::Rows(rows), statistics, batch_size }))
        }
    }

    #[tokio::test]
    async fn merges_worker_statistics_and_flattens_chunks() {
        let wave = vec![vec![row_with_marker(false), row_with_marker(false)], vec![row_with_marker(false)]];
        let predecessor = FixedWaves(Some(vec![wave]));
        let mut processor = ParallelWaveProcessor::new(predecessor, counting_worker_factory(), 4, 2);

        let result = processor.get_batch(10).await.unwrap().unwrap();
        assert_eq!(result.statistics.get("rows_written"), 3);
        assert_eq!(result.batch_size, 3);
        assert_eq!(result.chunk.len(), 3);
        assert!(processor.get_batch(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_fast_on_first_worker_error_yields_no_partial_result() {
        // Scenario C: one wave of four bucket-batches, one explodes.
        let wave = vec![
            vec![row_with_marker(false)],
            vec![row_with_marker(false)],
            vec![row_with_marker(true)],
            vec![row_with_marker(false)],
        ];
        let predecessor = FixedWaves(Some(vec![wave]));
        let mut processor = ParallelWaveProcessor::new(predecessor, counting_worker_factory(), 4, 2);

        let err = processor.get_batch(10).await.unwrap_err();
        match err {
            EtlError::Worker { source } => assert!(source.to_string().contains("exploded")),
            other => panic!("expected Worker error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn preserves_wave_order_across_multiple_waves() {
        let wave1 = vec![vec![row_with_marker(false)]];
        let wave2 = vec![vec![row_with_marker(false), row_with_marker(false)]];
        let predecessor = FixedWaves(Some(vec![wave1, wave2]));
        let mut processor = ParallelWaveProcessor::new(predecessor, counting_worker_factory(), 4, 2);

        let first = processor.get_batch(10).await.unwrap().unwrap();
        let second = processor.get_batch(10).await.unwrap().unwrap();
        assert_eq!(first.batch_size, 1);
        assert_eq!(second.batch_size, 2);
    }
}
