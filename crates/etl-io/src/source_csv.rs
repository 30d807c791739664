use async_trait::async_trait;
use etl_core::row::{with_origin_index, Row};
use etl_core::value::Value;
use etl_core::{BatchProcessor, BatchResult, Chunk, EtlError, Statistics};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Dialect knobs for [`CsvSource::open_with`], mirroring the delimiter,
/// quote and escape character options exposed by `csv::ReaderBuilder`.
///
/// [`Default`] matches RFC 4180: comma-delimited, double-quoted, with no
/// escape character (quotes are escaped by doubling).
#[derive(Debug, Clone, Copy)]
pub struct CsvDialect {
    pub delimiter: u8,
    pub quote: u8,
    pub escape: Option<u8>,
}

impl Default for CsvDialect {
    fn default() -> Self {
        Self { delimiter: b',', quote: b'"', escape: None }
    }
}

/// Reads rows out of a single CSV file, transparently decompressing `.gz`
/// files and stripping a leading UTF-8 BOM from the first header.
///
/// Each row is annotated with the reserved origin-index key via
/// [`with_origin_index`], empty fields become [`Value::Null`], and fields
/// whose header is empty are dropped rather than stored under an empty key.
pub struct CsvSource {
    path: PathBuf,
    reader: csv::Reader<Box<dyn Read + Send>>,
    headers: Vec<String>,
    next_index: usize,
    exhausted: bool,
}

impl CsvSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EtlError> {
        Self::open_with(path, CsvDialect::default())
    }

    pub fn open_with(path: impl AsRef<Path>, dialect: CsvDialect) -> Result<Self, EtlError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| EtlError::Source(format!("{}: {e}", path.display())))?;

        let raw: Box<dyn Read + Send> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut builder = csv::ReaderBuilder::new();
        builder.has_headers(true).delimiter(dialect.delimiter).quote(dialect.quote);
        if let Some(escape) = dialect.escape {
            builder.escape(Some(escape));
        }
        let mut reader = builder.from_reader(raw);

        let mut headers: Vec<String> =
            reader.headers().map_err(|e| EtlError::Source(format!("{}: {e}", path.display())))?.iter().map(str::to_string).collect();

        if let Some(first) = headers.first_mut() {
            if let Some(stripped) = first.strip_prefix('\u{feff}') {
                *first = stripped.to_string();
            }
        }

        debug!(path = %path.display(), headers = ?headers, "opened CSV source");
        Ok(Self { path, reader, headers, next_index: 0, exhausted: false })
    }

    fn clean_row(&self, record: &csv::StringRecord) -> Row {
        let mut row = Row::new();
        for (header, field) in self.headers.iter().zip(record.iter()) {
            if header.is_empty() {
                continue;
            }
            row.insert(header.as_str().into(), Value::from(field));
        }
        row
    }
}

#[async_trait]
impl BatchProcessor for CsvSource {
    async fn get_batch(&mut self, max_batch_size: usize) -> Result<Option<BatchResult>, EtlError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(max_batch_size);
        let mut record = csv::StringRecord::new();
        while rows.len() < max_batch_size {
            let has_more =
                self.reader.read_record(&mut record).map_err(|e| EtlError::Source(format!("{}: {e}", self.path.display())))?;
            if !has_more {
                self.exhausted = true;
                break;
            }
            let row = with_origin_index(self.clean_row(&record), self.next_index);
            self.next_index += 1;
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(None);
        }

        let statistics = Statistics::single("rows_read", rows.len() as i64);
        Ok(Some(BatchResult::new(Chunk::Rows(rows), statistics)))
    }
}
