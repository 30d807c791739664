use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etl_core::row::{with_origin_index, Row};
use etl_core::value::Value;
use etl_core::{BatchProcessor, BatchResult, Chunk, EtlError, Statistics};
use futures::StreamExt;
use sqlx::{postgres::PgPool, Column, Row as SqlxRow, TypeInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Applied to every row as it comes off the database, before the row is
/// handed to the rest of the pipeline.
pub type RowTransformer = Box<dyn Fn(Row) -> Row + Send + Sync>;

/// Streams rows out of a SQL query without paging (no `LIMIT`/`OFFSET`):
/// the query runs once against a dedicated background task holding the
/// connection, and rows flow back over a bounded channel so `get_batch`
/// can hand out batches of any requested size without the database
/// driver's streaming cursor ever crossing an await boundary owned by the
/// caller.
pub struct SqlSource {
    receiver: mpsc::Receiver<Result<Row, EtlError>>,
    worker: Option<JoinHandle<()>>,
    exhausted: bool,
}

impl SqlSource {
    pub async fn open(pool: PgPool, query: impl Into<String>, transformer: Option<RowTransformer>) -> Self {
        let query = normalize_query(query.into());
        let (tx, rx) = mpsc::channel(64);

        let handle = tokio::spawn(async move {
            let mut stream = sqlx::query(&query).fetch(&pool);
            let mut next_index = 0usize;
            while let Some(next) = stream.next().await {
                let mapped = next.map_err(|e| EtlError::Source(e.to_string())).map(|pg_row| {
                    let row = with_origin_index(row_from_pg_row(&pg_row), next_index);
                    next_index += 1;
                    match &transformer {
                        Some(f) => f(row),
                        None => row,
                    }
                });
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });

        Self { receiver: rx, worker: Some(handle), exhausted: false }
    }
}

#[async_trait]
impl BatchProcessor for SqlSource {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(max_batch_size);
        while rows.len() < max_batch_size {
            match self.receiver.recv().await {
                Some(Ok(row)) => rows.push(row),
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Err(e);
                }
                None => {
                    self.exhausted = true;
                    if let Some(handle) = self.worker.take() {
                        let _ = handle.await;
                    }
                    break;
                }
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }

        let statistics = Statistics::single("rows_read", rows.len() as i64);
        Ok(Some(BatchResult::new(Chunk::Rows(rows), statistics)))
    }
}

/// Strips a trailing `;` (and surrounding whitespace) so the query can be
/// embedded in drivers that reject a trailing statement terminator.
fn normalize_query(query: String) -> String {
    query.trim().trim_end_matches(';').trim().to_string()
}

/// Best-effort dynamic decode of a Postgres row into a [`Row`], trying
/// progressively looser scalar types per column until one decodes.
fn row_from_pg_row(pg_row: &sqlx::postgres::PgRow) -> Row {
    let mut row = Row::new();
    for column in pg_row.columns() {
        let name = column.name();
        let value = decode_column(pg_row, name, column.type_info().name());
        row.insert(name.into(), value);
    }
    row
}

fn decode_column(pg_row: &sqlx::postgres::PgRow, name: &str, type_name: &str) -> Value {
    match type_name {
        "INT2" | "INT4" | "INT8" => pg_row.try_get::<Option<i64>, _>(name).ok().flatten().map(Value::Int).unwrap_or(Value::Null),
        "FLOAT4" | "FLOAT8" | "NUMERIC" => {
            pg_row.try_get::<Option<f64>, _>(name).ok().flatten().map(Value::Float).unwrap_or(Value::Null)
        }
        "BOOL" => pg_row.try_get::<Option<bool>, _>(name).ok().flatten().map(Value::Bool).unwrap_or(Value::Null),
        "TIMESTAMPTZ" | "TIMESTAMP" => {
            pg_row.try_get::<Option<DateTime<Utc>>, _>(name).ok().flatten().map(Value::Timestamp).unwrap_or(Value::Null)
        }
        _ => pg_row.try_get::<Option<String>, _>(name).ok().flatten().map(Value::Str).unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_query_strips_trailing_semicolon_and_whitespace() {
        assert_eq!(normalize_query("select 1;  \n".to_string()), "select 1");
        assert_eq!(normalize_query("select 1".to_string()), "select 1");
    }
}
