use etl_core::row::Row;
use etl_core::value::Value;
use etl_core::EtlError;

/// Knuth's multiplicative hashing constant, used by [`CanonicalIntegerExtractor`]
/// to scatter sequential integer IDs across the bucket grid.
const KNUTH_MULTIPLICATIVE_CONSTANT: u64 = 2654435761;

/// Maps one incoming row to a `(row, col)` coordinate inside the splitter's
/// `table_size x table_size` bucket grid.
///
/// `table_size()` lets the splitter validate its own constructor argument
/// against the extractor's expectation (spec: "table_size mismatch between
/// extractor hint and constructor argument -> construction fails"), and
/// `monopartite()` selects the non-overlap rule the splitter applies when
/// scheduling waves.
pub trait IdExtractor: Send + Sync {
    fn extract(&self, row: &Row) -> Result<(usize, usize), EtlError>;

    /// `None` means the extractor carries no table-size hint and the
    /// splitter's constructor argument is authoritative.
    fn table_size(&self) -> Option<usize> {
        None
    }

    fn monopartite(&self) -> bool {
        false
    }
}

fn last_digit(value: &Value) -> Result<usize, EtlError> {
    let rendered = value.to_string();
    let last = rendered.chars().last().ok_or_else(|| EtlError::Splitter(format!("empty key rendering for {value}")))?;
    last.to_digit(10).map(|d| d as usize).ok_or_else(|| EtlError::Splitter(format!("non-digit trailing character in {rendered}")))
}

/// Bi-partite extractor over a 2-element tuple of scalar values, bucketing
/// by the last decimal digit of each element's string rendering.
pub struct TupleLastDigitExtractor {
    table_size: usize,
}

impl TupleLastDigitExtractor {
    pub fn new(table_size: usize) -> Self {
        Self { table_size }
    }
}

impl Default for TupleLastDigitExtractor {
    /// `table_size` defaults to 10, matching the last-digit range it routes on.
    fn default() -> Self {
        Self::new(10)
    }
}

impl IdExtractor for TupleLastDigitExtractor {
    fn extract(&self, row: &Row) -> Result<(usize, usize), EtlError> {
        let a = row.get("a").ok_or_else(|| EtlError::Splitter("row missing key 'a'".into()))?;
        let b = row.get("b").ok_or_else(|| EtlError::Splitter("row missing key 'b'".into()))?;
        Ok((last_digit(a)?, last_digit(b)?))
    }

    fn table_size(&self) -> Option<usize> {
        Some(self.table_size)
    }
}

/// Bi-partite extractor reading two named dict keys from a [`Row`],
/// bucketing by the last decimal digit of each.
pub struct DictLastDigitExtractor {
    table_size: usize,
    start_key: String,
    end_key: String,
}

impl DictLastDigitExtractor {
    pub fn new(table_size: usize, start_key: impl Into<String>, end_key: impl Into<String>) -> Self {
        Self { table_size, start_key: start_key.into(), end_key: end_key.into() }
    }
}

impl IdExtractor for DictLastDigitExtractor {
    fn extract(&self, row: &Row) -> Result<(usize, usize), EtlError> {
        let start = row.get(self.start_key.as_str()).ok_or_else(|| EtlError::Splitter(format!("row missing key '{}'", self.start_key)))?;
        let end = row.get(self.end_key.as_str()).ok_or_else(|| EtlError::Splitter(format!("row missing key '{}'", self.end_key)))?;
        Ok((last_digit(start)?, last_digit(end)?))
    }

    fn table_size(&self) -> Option<usize> {
        Some(self.table_size)
    }
}

/// Mono-partite extractor for integer endpoint IDs: scatters each ID via
/// Knuth multiplicative hashing and folds the result so `row <= col`,
/// guaranteeing `(a, b)` and `(b, a)` land in the same bucket.
pub struct CanonicalIntegerExtractor {
    table_size: usize,
    start_key: String,
    end_key: String,
}

impl CanonicalIntegerExtractor {
    pub fn new(table_size: usize, start_key: impl Into<String>, end_key: impl Into<String>) -> Self {
        Self { table_size, start_key: start_key.into(), end_key: end_key.into() }
    }

    fn hash_one(&self, id: i64) -> usize {
        let scattered = (id as u64).wrapping_mul(KNUTH_MULTIPLICATIVE_CONSTANT) & 0xffff_ffff;
        (scattered % self.table_size as u64) as usize
    }
}

impl IdExtractor for CanonicalIntegerExtractor {
    fn extract(&self, row: &Row) -> Result<(usize, usize), EtlError> {
        let start = row
            .get(self.start_key.as_str())
            .and_then(Value::as_int)
            .ok_or_else(|| EtlError::Splitter(format!("row missing integer key '{}'", self.start_key)))?;
        let end = row
            .get(self.end_key.as_str())
            .and_then(Value::as_int)
            .ok_or_else(|| EtlError::Splitter(format!("row missing integer key '{}'", self.end_key)))?;

        let (mut r, mut c) = (self.hash_one(start), self.hash_one(end));
        if r > c {
            std::mem::swap(&mut r, &mut c);
        }
        Ok((r, c))
    }

    fn table_size(&self) -> Option<usize> {
        Some(self.table_size)
    }

    fn monopartite(&self) -> bool {
        true
    }
}
