use async_trait::async_trait;
use etl_core::context::{CypherQuery, GraphSessionFactory};
use etl_core::{BatchProcessor, BatchResult, Chunk, EtlError, Statistics};
use std::sync::Arc;

/// A Cypher statement (or several, run in order against the same batch)
/// that a [`CypherSink`] executes with the batch's rows bound as `batch`.
#[derive(Debug, Clone)]
pub enum CypherSpec {
    Single(String),
    Many(Vec<String>),
}

/// Writes a batch of rows to the target graph database by running a
/// configured Cypher statement (or sequence of statements) with the rows
/// bound as the `batch` parameter, folding the database's reported
/// counters into the batch's statistics.
pub struct CypherSink<P> {
    predecessor: P,
    session_factory: Arc<dyn GraphSessionFactory>,
    spec: CypherSpec,
}

impl<P: BatchProcessor> CypherSink<P> {
    pub fn new(predecessor: P, session_factory: Arc<dyn GraphSessionFactory>, spec: CypherSpec) -> Self {
        Self { predecessor, session_factory, spec }
    }
}

#[async_trait]
impl<P: BatchProcessor + Send> BatchProcessor for CypherSink<P> {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        let Some(batch) = self.predecessor.get_batch(max_batch_size).await? else {
            return Ok(None);
        };

        let rows = batch.chunk.as_rows().ok_or_else(|| EtlError::Sink("cypher sink received a bucketed chunk".into()))?;

        let owned_statements;
        let query = match &self.spec {
            CypherSpec::Single(q) => CypherQuery::Single(q.as_str()),
            CypherSpec::Many(qs) => {
                owned_statements = qs.iter().map(String::as_str).collect::<Vec<_>>();
                CypherQuery::Many(&owned_statements)
            }
        };

        let mut session = self.session_factory.session().await?;
        let counters = session.run_query(query, rows).await?;

        let mut statistics = batch.statistics;
        for (key, value) in counters.into_pairs() {
            if value != 0 {
                statistics += Statistics::single(key, value);
            }
        }

        Ok(Some(BatchResult { chunk: Chunk::Rows(rows.to_vec()), statistics, batch_size: batch.batch_size }))
    }
}
