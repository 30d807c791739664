use crate::value::Value;
use arcstr::ArcStr;
use std::collections::BTreeMap;

/// Reserved row key a source annotates each row with: the row's 0-based
/// origin index within its source stream.
pub const ORIGIN_INDEX_KEY: &str = "_row";

/// An unordered mapping from field name to scalar [`Value`].
///
/// Backed by a `BTreeMap` (not a `HashMap`) so that iteration order — and
/// therefore NDJSON error-file output and test assertions — is
/// deterministic. Field names are `ArcStr` so that cloning a `Row` (e.g.
/// when a bucket-batch is replayed into a fresh worker chain) does not
/// reallocate every key.
pub type Row = BTreeMap<ArcStr, Value>;

/// Stamps the reserved origin-index key onto `row`, overwriting any
/// existing value under that key.
pub fn with_origin_index(mut row: Row, index: usize) -> Row {
    row.insert(ArcStr::from(ORIGIN_INDEX_KEY), Value::Int(index as i64));
    row
}

/// Returns the origin index previously stamped by [`with_origin_index`], if present.
pub fn origin_index(row: &Row) -> Option<usize> {
    row.get(ORIGIN_INDEX_KEY).and_then(Value::as_int).map(|i| i as usize)
}
