//! Mid-pipeline processors built on top of [`etl_core::BatchProcessor`]:
//! per-row validation, relationship-aware splitting into conflict-free
//! waves, wave-parallel dispatch onto a bounded worker pool, and the
//! closed-loop terminator every chain ends in.
//!
//! Sources and sinks live in `etl-io`; this crate holds everything that
//! sits between them.

mod extractor;
mod parallel;
mod splitter;
mod terminator;
mod validation;

pub use extractor::{CanonicalIntegerExtractor, DictLastDigitExtractor, IdExtractor, TupleLastDigitExtractor};
pub use parallel::{ParallelWaveProcessor, SingleBatchSource, WorkerFactory};
pub use splitter::SplittingProcessor;
pub use terminator::ClosedLoopTerminator;
pub use validation::{RowSchema, TypedSchema, ValidationIssue, ValidationProcessor};
