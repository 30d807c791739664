use crate::extractor::IdExtractor;
use etl_core::row::Row;
use etl_core::{BatchProcessor, BatchResult, Chunk, EtlError, Statistics};
use async_trait::async_trait;
use std::collections::VecDeque;

/// A claim a bucket consumes within a wave: the resource the non-overlap
/// rule tracks to keep concurrently-applied bucket-batches conflict-free.
///
/// Bi-partite buckets claim their row-slot and col-slot independently (two
/// claims of different kinds can never collide with each other); mono-partite
/// buckets claim the node indices they touch directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Claim {
    RowSlot(usize),
    ColSlot(usize),
    Node(usize),
}

/// Routes incoming rows into a `table_size x table_size` grid of FIFO
/// buckets via an injected [`IdExtractor`], and emits them back out as
/// waves of non-overlapping bucket-batches.
///
/// `SplittingProcessor` is itself a [`BatchProcessor`]: its `chunk` is
/// always [`Chunk::Buckets`], one sub-vector per bucket in the emitted
/// wave, aligned with the wave's bucket order.
pub struct SplittingProcessor<P, E> {
    predecessor: P,
    extractor: E,
    table_size: usize,
    near_full_ratio: f64,
    burst_multiplier: u32,
    buffer: Vec<Vec<VecDeque<Row>>>,
    accumulated: Statistics,
    /// Held-back candidate for "the last emission" (the only one that
    /// carries accumulated statistics): every time a new wave is staged,
    /// whatever was previously held in `pending` is known not to be last
    /// and moves into `ready`.
    pending: Option<(Vec<Vec<Row>>, usize)>,
    /// Waves already confirmed not to be the last emission, waiting to be
    /// returned one per `get_batch` call.
    ready: VecDeque<(Vec<Vec<Row>>, usize)>,
    predecessor_exhausted: bool,
}

impl<P: BatchProcessor, E: IdExtractor> SplittingProcessor<P, E> {
    /// `near_full_ratio` must be in `(0, 1]`; `burst_multiplier` must be `>= 1`.
    /// If `extractor.table_size()` is `Some`, it must match `table_size`.
    pub fn new(predecessor: P, extractor: E, table_size: usize, near_full_ratio: f64, burst_multiplier: u32) -> Result<Self, EtlError> {
        if let Some(expected) = extractor.table_size() {
            if expected != table_size {
                return Err(EtlError::Splitter(format!(
                    "table_size mismatch: constructor got {table_size}, extractor expects {expected}"
                )));
            }
        }
        if !(near_full_ratio > 0.0 && near_full_ratio <= 1.0) {
            return Err(EtlError::Splitter(format!("near_full_ratio must be in (0, 1], got {near_full_ratio}")));
        }
        if burst_multiplier < 1 {
            return Err(EtlError::Splitter(format!("burst_multiplier must be >= 1, got {burst_multiplier}")));
        }

        let buffer = (0..table_size).map(|_| (0..table_size).map(|_| VecDeque::new()).collect()).collect();
        Ok(Self {
            predecessor,
            extractor,
            table_size,
            near_full_ratio,
            burst_multiplier,
            buffer,
            accumulated: Statistics::new(),
            pending: None,
            ready: VecDeque::new(),
            predecessor_exhausted: false,
        })
    }

    fn claims(&self, row: usize, col: usize) -> Vec<Claim> {
        if self.extractor.monopartite() {
            if row == col {
                vec![Claim::Node(row)]
            } else {
                vec![Claim::Node(row), Claim::Node(col)]
            }
        } else {
            vec![Claim::RowSlot(row), Claim::ColSlot(col)]
        }
    }

    fn route(&mut self, row: Row) -> Result<(), EtlError> {
        let (mut r, mut c) = self.extractor.extract(&row)?;
        if self.extractor.monopartite() && r > c {
            std::mem::swap(&mut r, &mut c);
        }
        if r >= self.table_size || c >= self.table_size {
            return Err(EtlError::BucketRange { table_size: self.table_size, key: format!("({r}, {c})") });
        }
        self.buffer[r][c].push_back(row);
        Ok(())
    }

    /// All non-empty buckets as `(len, row, col)`, sorted by `(-len, row, col)`
    /// for deterministic tie-breaking.
    fn candidates(&self, min_len: usize) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        for r in 0..self.table_size {
            for c in 0..self.table_size {
                let len = self.buffer[r][c].len();
                if len >= min_len {
                    out.push((len, r, c));
                }
            }
        }
        out.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        out
    }

    /// Greedy non-overlapping bucket selection: `seed` buckets are taken as
    /// fixed, then candidates with `len >= min_bucket_len` are added in
    /// `(-len, row, col)` order as long as their claims don't collide,
    /// stopping once the wave reaches `table_size` buckets.
    fn select_wave(&self, min_bucket_len: usize, seed: &[(usize, usize)]) -> Vec<(usize, usize)> {
        let candidates = self.candidates(min_bucket_len);
        if candidates.is_empty() && seed.is_empty() {
            return Vec::new();
        }

        let mut used = std::collections::HashSet::new();
        let mut wave = Vec::new();
        for &(r, c) in seed {
            used.extend(self.claims(r, c));
            wave.push((r, c));
        }

        for (_, r, c) in candidates {
            if wave.contains(&(r, c)) {
                continue;
            }
            let claims = self.claims(r, c);
            if claims.iter().any(|claim| used.contains(claim)) {
                continue;
            }
            wave.push((r, c));
            used.extend(claims);
            if wave.len() >= self.table_size {
                break;
            }
        }
        wave
    }

    fn hottest_bucket_at_least(&self, threshold: usize) -> Option<(usize, usize, usize)> {
        self.candidates(threshold).into_iter().map(|(len, r, c)| (r, c, len)).max_by_key(|(_, _, len)| *len)
    }

    /// Extracts up to `max_batch_size` rows from the head of each bucket in
    /// `wave`, in order, producing one bucket-batch per wave entry.
    fn flush(&mut self, wave: &[(usize, usize)], max_batch_size: usize) -> Vec<Vec<Row>> {
        wave.iter()
            .map(|&(r, c)| {
                let queue = &mut self.buffer[r][c];
                let take = max_batch_size.min(queue.len());
                queue.drain(..take).collect()
            })
            .collect()
    }

    /// Replaces `pending` with a freshly flushed wave. Whatever was
    /// previously held in `pending` is now known not to be the last
    /// emission, so it moves into the `ready` queue (the splitter always
    /// holds back exactly one candidate so it can stamp statistics on the
    /// true last one once upstream exhausts).
    fn stage(&mut self, wave: &[(usize, usize)], max_batch_size: usize) {
        let buckets = self.flush(wave, max_batch_size);
        let size = buckets.iter().map(Vec::len).sum();
        if let Some(previous) = self.pending.replace((buckets, size)) {
            self.ready.push_back(previous);
        }
    }

    fn drain_ready(&mut self, max_batch_size: usize, near_full: usize) {
        loop {
            let full_seed = self.select_wave(max_batch_size, &[]);
            if full_seed.is_empty() {
                break;
            }
            let wave = self.select_wave(near_full, &full_seed);
            self.stage(&wave, max_batch_size);
        }
    }

    fn drain_bursts(&mut self, max_batch_size: usize, near_full: usize, burst: usize) {
        while let Some((hot_r, hot_c, _)) = self.hottest_bucket_at_least(burst) {
            let wave = self.select_wave(near_full, &[(hot_r, hot_c)]);
            self.stage(&wave, max_batch_size);
        }
    }
}

#[async_trait]
impl<P: BatchProcessor, E: IdExtractor> BatchProcessor for SplittingProcessor<P, E> {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        let near_full = 1.max((max_batch_size as f64 * self.near_full_ratio) as usize);
        let burst = self.burst_multiplier as usize * max_batch_size;

        loop {
            if let Some((buckets, size)) = self.ready.pop_front() {
                return Ok(Some(BatchResult { chunk: Chunk::Buckets(buckets), statistics: Statistics::new(), batch_size: size }));
            }

            if self.predecessor_exhausted {
                return Ok(self.pending.take().map(|(buckets, size)| {
                    let statistics = std::mem::take(&mut self.accumulated);
                    BatchResult { chunk: Chunk::Buckets(buckets), statistics, batch_size: size }
                }));
            }

            match self.predecessor.get_batch(max_batch_size).await? {
                Some(upstream) => {
                    self.accumulated += upstream.statistics;
                    let rows =
                        upstream.chunk.into_rows().ok_or_else(|| EtlError::Splitter("splitter received a bucketed chunk".into()))?;
                    for row in rows {
                        self.route(row)?;
                    }
                    self.drain_ready(max_batch_size, near_full);
                    self.drain_bursts(max_batch_size, near_full, burst);
                }
                None => {
                    self.predecessor_exhausted = true;
                    loop {
                        let wave = self.select_wave(1, &[]);
                        if wave.is_empty() {
                            break;
                        }
                        self.stage(&wave, max_batch_size);
                    }
                }
            }

            // Loop back: either a wave just became ready, upstream just
            // exhausted (handled at the top next iteration), or neither —
            // in which case we pull upstream again.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{CanonicalIntegerExtractor, TupleLastDigitExtractor};
    use etl_core::value::Value;
    use std::collections::HashSet;

    struct FixedSource(Option<Vec<Row>>);

    #[async_trait]
    impl BatchProcessor for FixedSource {
        async fn get_batch(&mut self, _max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
            Ok(self.0.take().map(|rows| {
                let n = rows.len() as i64;
                BatchResult::new(Chunk::Rows(rows), Statistics::single("rows_read", n))
            }))
        }
    }

    fn tuple_row(a: i64, b: i64) -> Row {
        let mut row = Row::new();
        row.insert("a".into(), Value::Int(a));
        row.insert("b".into(), Value::Int(b));
        row
    }

    async fn drain_all<P: BatchProcessor>(p: &mut P, max: usize) -> Vec<BatchResult> {
        let mut out = Vec::new();
        while let Some(batch) = p.get_batch(max).await.unwrap() {
            out.push(batch);
        }
        out
    }

    #[tokio::test]
    async fn rejects_table_size_mismatch() {
        let source = FixedSource(Some(vec![]));
        let extractor = TupleLastDigitExtractor::new(10);
        let err = SplittingProcessor::new(source, extractor, 7, 0.85, 25).err().unwrap();
        assert!(matches!(err, EtlError::Splitter(_)));
    }

    #[tokio::test]
    async fn rejects_near_full_ratio_out_of_range() {
        let too_low = FixedSource(Some(vec![]));
        assert!(SplittingProcessor::new(too_low, TupleLastDigitExtractor::new(10), 10, 0.0, 25).is_err());
        let too_high = FixedSource(Some(vec![]));
        assert!(SplittingProcessor::new(too_high, TupleLastDigitExtractor::new(10), 10, 1.5, 25).is_err());
    }

    #[tokio::test]
    async fn bi_partite_waves_have_distinct_rows_and_cols_and_no_loss() {
        // Scenario A: T=3, M=2, buckets (0,0)x5 (1,1)x5 (2,2)x5 (0,1)x2 (1,2)x2 (2,0)x2 (2,1)x1
        let mut rows = Vec::new();
        for _ in 0..5 {
            rows.push(tuple_row(0, 0));
            rows.push(tuple_row(1, 1));
            rows.push(tuple_row(2, 2));
        }
        for _ in 0..2 {
            rows.push(tuple_row(0, 1));
            rows.push(tuple_row(1, 2));
            rows.push(tuple_row(2, 0));
        }
        rows.push(tuple_row(2, 1));
        let total_in = rows.len();

        let source = FixedSource(Some(rows));
        let extractor = TupleLastDigitExtractor::new(3);
        let mut splitter = SplittingProcessor::new(source, extractor, 3, 0.85, 25).unwrap();

        let waves = drain_all(&mut splitter, 2).await;
        assert!(!waves.is_empty());

        let mut total_out = 0;
        for wave in &waves {
            let buckets = match &wave.chunk {
                Chunk::Buckets(b) => b,
                _ => panic!("expected bucketed chunk"),
            };
            let mut seen_rows = HashSet::new();
            let mut seen_cols = HashSet::new();
            for bucket in buckets {
                assert!(bucket.len() <= 2);
                if bucket.is_empty() {
                    continue;
                }
                let extractor = TupleLastDigitExtractor::new(3);
                let (r, c) = extractor.extract(&bucket[0]).unwrap();
                for row in bucket {
                    assert_eq!(extractor.extract(row).unwrap(), (r, c));
                }
                assert!(seen_rows.insert(r), "row {r} reused within a wave");
                assert!(seen_cols.insert(c), "col {c} reused within a wave");
                total_out += bucket.len();
            }
        }
        assert_eq!(total_out, total_in);
    }

    #[tokio::test]
    async fn mono_partite_waves_never_reuse_a_node_index() {
        // Scenario B: 400 pairs of distinct integers, both orderings present.
        let mut rows = Vec::new();
        for i in 0..400i64 {
            let (a, b) = (i * 7 + 1, i * 13 + 2);
            let mut forward = Row::new();
            forward.insert("start".into(), Value::Int(a));
            forward.insert("end".into(), Value::Int(b));
            let mut backward = Row::new();
            backward.insert("start".into(), Value::Int(b));
            backward.insert("end".into(), Value::Int(a));
            rows.push(forward);
            rows.push(backward);
        }
        let total_in = rows.len();

        let source = FixedSource(Some(rows));
        let extractor = CanonicalIntegerExtractor::new(17, "start", "end");
        let mut splitter = SplittingProcessor::new(source, extractor, 17, 0.85, 25).unwrap();

        let waves = drain_all(&mut splitter, 8).await;
        let mut total_out = 0;
        for wave in &waves {
            let buckets = match &wave.chunk {
                Chunk::Buckets(b) => b,
                _ => panic!("expected bucketed chunk"),
            };
            let mut used_nodes = HashSet::new();
            let extractor = CanonicalIntegerExtractor::new(17, "start", "end");
            for bucket in buckets {
                if bucket.is_empty() {
                    continue;
                }
                let (r, c) = extractor.extract(&bucket[0]).unwrap();
                let nodes: Vec<usize> = if r == c { vec![r] } else { vec![r, c] };
                for n in nodes {
                    assert!(used_nodes.insert(n), "node {n} reused within a mono-partite wave");
                }
                total_out += bucket.len();
            }
        }
        assert_eq!(total_out, total_in);
    }

    #[tokio::test]
    async fn emits_only_last_wave_with_accumulated_statistics() {
        let mut rows = Vec::new();
        for _ in 0..10 {
            rows.push(tuple_row(0, 0));
        }
        let source = FixedSource(Some(rows));
        let extractor = TupleLastDigitExtractor::new(3);
        let mut splitter = SplittingProcessor::new(source, extractor, 3, 0.85, 25).unwrap();

        let waves = drain_all(&mut splitter, 3).await;
        assert_eq!(waves.len(), 4);
        assert_eq!(waves[0].batch_size, 3);
        assert_eq!(waves[1].batch_size, 3);
        assert_eq!(waves[2].batch_size, 3);
        assert_eq!(waves[3].batch_size, 1);
        for wave in &waves[..waves.len() - 1] {
            assert!(wave.statistics.is_empty());
        }
        assert_eq!(waves.last().unwrap().statistics.get("rows_read"), 10);
    }

    #[tokio::test]
    async fn out_of_range_bucket_is_an_error() {
        struct BadExtractor;
        impl IdExtractor for BadExtractor {
            fn extract(&self, _row: &Row) -> Result<(usize, usize), EtlError> {
                Ok((99, 99))
            }
        }
        let source = FixedSource(Some(vec![tuple_row(0, 0)]));
        let mut splitter = SplittingProcessor::new(source, BadExtractor, 3, 0.85, 25).unwrap();
        let err = splitter.get_batch(2).await.unwrap_err();
        assert!(matches!(err, EtlError::BucketRange { .. }));
    }

    #[tokio::test]
    async fn empty_source_emits_nothing() {
        let source = FixedSource(Some(vec![]));
        let extractor = TupleLastDigitExtractor::new(3);
        let mut splitter = SplittingProcessor::new(source, extractor, 3, 0.85, 25).unwrap();
        assert!(splitter.get_batch(2).await.unwrap().is_none());
    }
}
