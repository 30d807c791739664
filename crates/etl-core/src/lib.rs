//! Core types shared by every stage of the ETL engine: the row/value data
//! model, the pull-based processor contract, the task tree and the
//! process-scoped context used to reach the target graph database and
//! progress reporter.

pub mod batch;
pub mod context;
pub mod error;
pub mod processor;
pub mod reporter;
pub mod row;
pub mod statistics;
pub mod task;
pub mod value;

pub use batch::{append_result, BatchResult, Chunk};
pub use context::{Counters, CypherQuery, ETLContext, GraphSession, GraphSessionFactory};
pub use error::EtlError;
pub use processor::BatchProcessor;
pub use reporter::{ProgressReporter, StdoutProgressReporter, TaskTreeSpec};
pub use row::{origin_index, with_origin_index, Row, ORIGIN_INDEX_KEY};
pub use statistics::Statistics;
pub use task::{ParallelTaskGroup, Task, TaskGroup, TaskReturn};
pub use value::Value;
