use async_trait::async_trait;
use etl_core::row::Row;
use etl_core::{BatchProcessor, BatchResult, Chunk, EtlError, Statistics};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use validator::Validate;

/// One field-level complaint about a row that failed [`RowSchema::validate`].
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

/// Per-row validation contract a job supplies to [`ValidationProcessor`].
///
/// `validate` both checks and transforms: a conforming row is projected
/// into its canonical shape (aliased field names resolved, derived fields
/// filled in) before being passed downstream, matching the original's
/// `model(**row).model_dump()` round-trip through a pydantic model.
pub trait RowSchema: Send + Sync {
    fn validate(&self, row: &Row) -> Result<Row, Vec<ValidationIssue>>;
}

#[derive(Serialize)]
struct ErrorRecord {
    row: Row,
    errors: Vec<ValidationIssue>,
}

/// Adapts a `#[derive(Deserialize, Serialize, Validate)]` struct into a
/// [`RowSchema`]: projects the row into `T` through `serde_json` (resolving
/// `#[serde(rename/alias)]` field names along the way), runs
/// [`validator::Validate::validate`], and serializes the validated value
/// back into canonical `Row` shape.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Serialize + Validate + Send + Sync> RowSchema for TypedSchema<T> {
    fn validate(&self, row: &Row) -> Result<Row, Vec<ValidationIssue>> {
        let as_value = |e: serde_json::Error| vec![ValidationIssue { field: "_row".into(), message: e.to_string() }];

        let json = serde_json::to_value(row).map_err(as_value)?;
        let typed: T = serde_json::from_value(json).map_err(as_value)?;

        typed.validate().map_err(|report| {
            report
                .field_errors()
                .into_iter()
                .flat_map(|(field, errors)| {
                    errors.iter().map(move |e| ValidationIssue {
                        field: field.to_string(),
                        message: e.message.as_ref().map(|m| m.to_string()).unwrap_or_else(|| e.code.to_string()),
                    })
                })
                .collect::<Vec<_>>()
        })?;

        let back = serde_json::to_value(&typed).map_err(as_value)?;
        serde_json::from_value(back).map_err(as_value)
    }
}

/// Validates every row of each upstream batch against a [`RowSchema`],
/// forwarding conforming rows and appending one NDJSON object per
/// nonconforming row to `error_file`.
///
/// `batch_size` is preserved as the upstream row count (rows read, not
/// rows valid); `valid_rows`/`invalid_rows` counters merge into the
/// upstream statistics.
pub struct ValidationProcessor<P, S> {
    predecessor: P,
    schema: S,
    error_file: PathBuf,
}

impl<P: BatchProcessor, S: RowSchema> ValidationProcessor<P, S> {
    pub fn new(predecessor: P, schema: S, error_file: impl AsRef<Path>) -> Self {
        Self { predecessor, schema, error_file: error_file.as_ref().to_path_buf() }
    }

    fn write_errors(&self, invalid: &[ErrorRecord]) -> Result<(), EtlError> {
        if invalid.is_empty() {
            return Ok(());
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.error_file)
            .map_err(|e| EtlError::Validation(format!("{}: {e}", self.error_file.display())))?;
        for record in invalid {
            let line = serde_json::to_string(record).map_err(|e| EtlError::Validation(format!("serializing error record: {e}")))?;
            writeln!(file, "{line}").map_err(|e| EtlError::Validation(format!("{}: {e}", self.error_file.display())))?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P: BatchProcessor, S: RowSchema> BatchProcessor for ValidationProcessor<P, S> {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        let Some(batch) = self.predecessor.get_batch(max_batch_size).await? else {
            return Ok(None);
        };

        let rows = batch.chunk.into_rows().ok_or_else(|| EtlError::Validation("validator received a bucketed chunk".into()))?;
        let original_count = rows.len();

        let mut valid = Vec::with_capacity(rows.len());
        let mut invalid = Vec::new();
        for row in rows {
            match self.schema.validate(&row) {
                Ok(transformed) => valid.push(transformed),
                Err(errors) => invalid.push(ErrorRecord { row, errors }),
            }
        }

        self.write_errors(&invalid)?;

        let mut statistics = batch.statistics;
        statistics += Statistics::single("valid_rows", valid.len() as i64);
        statistics += Statistics::single("invalid_rows", invalid.len() as i64);

        Ok(Some(BatchResult { chunk: Chunk::Rows(valid), statistics, batch_size: original_count }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etl_core::value::Value;
    use etl_core::Chunk;

    struct EvenAgeSchema;

    impl RowSchema for EvenAgeSchema {
        fn validate(&self, row: &Row) -> Result<Row, Vec<ValidationIssue>> {
            match row.get("age").and_then(Value::as_int) {
                Some(age) if age % 2 == 0 => Ok(row.clone()),
                Some(_) => Err(vec![ValidationIssue { field: "age".into(), message: "age must be even".into() }]),
                None => Err(vec![ValidationIssue { field: "age".into(), message: "missing".into() }]),
            }
        }
    }

    struct FixedSource(Option<Vec<Row>>);

    #[async_trait]
    impl BatchProcessor for FixedSource {
        async fn get_batch(&mut self, _max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
            Ok(self.0.take().map(|rows| BatchResult::new(Chunk::Rows(rows), Statistics::single("rows_read", 0))))
        }
    }

    fn row_with_age(age: i64) -> Row {
        let mut row = Row::new();
        row.insert("age".into(), Value::Int(age));
        row
    }

    #[tokio::test]
    async fn splits_valid_and_invalid_and_writes_error_file() {
        let dir = tempfile::tempdir().unwrap();
        let error_path = dir.path().join("errors.ndjson");
        let source = FixedSource(Some(vec![row_with_age(2), row_with_age(3), row_with_age(4)]));
        let mut validator = ValidationProcessor::new(source, EvenAgeSchema, &error_path);

        let batch = validator.get_batch(10).await.unwrap().unwrap();
        assert_eq!(batch.statistics.get("valid_rows"), 2);
        assert_eq!(batch.statistics.get("invalid_rows"), 1);
        assert_eq!(batch.batch_size, 3);

        let contents = std::fs::read_to_string(&error_path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("age must be even"));
    }

    #[tokio::test]
    async fn preserves_upstream_statistics() {
        let error_path = tempfile::tempdir().unwrap().path().join("errors.ndjson");
        let source = FixedSource(Some(vec![row_with_age(2)]));
        let mut validator = ValidationProcessor::new(source, EvenAgeSchema, &error_path);
        let batch = validator.get_batch(10).await.unwrap().unwrap();
        assert_eq!(batch.statistics.get("rows_read"), 0);
    }

    #[derive(serde::Deserialize, serde::Serialize, validator::Validate)]
    struct Person {
        #[validate(length(min = 1))]
        name: String,
        #[validate(range(min = 0, max = 130))]
        age: i64,
    }

    fn person_row(name: &str, age: i64) -> Row {
        let mut row = Row::new();
        row.insert("name".into(), Value::Str(name.to_string()));
        row.insert("age".into(), Value::Int(age));
        row
    }

    #[tokio::test]
    async fn typed_schema_validates_and_round_trips_through_row() {
        let dir = tempfile::tempdir().unwrap();
        let error_path = dir.path().join("errors.ndjson");
        let source = FixedSource(Some(vec![person_row("Ada", 36), person_row("", 200)]));
        let mut validator = ValidationProcessor::new(source, TypedSchema::<Person>::new(), &error_path);

        let batch = validator.get_batch(10).await.unwrap().unwrap();
        assert_eq!(batch.statistics.get("valid_rows"), 1);
        assert_eq!(batch.statistics.get("invalid_rows"), 1);

        let rows = batch.chunk.into_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name").and_then(Value::as_str), Some("Ada"));
    }
}
