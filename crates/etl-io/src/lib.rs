//! Concrete I/O for the ETL engine: CSV and SQL sources, and a Neo4j-backed
//! graph sink/session-factory/progress-mirror trio.

/// CSV file source implementation
pub mod source_csv;

/// Streaming SQL source implementation
pub mod source_sql;

/// Neo4j `GraphSessionFactory`/`GraphSession` implementation
pub mod graph;

/// Cypher batch sink
pub mod sink_cypher;

/// Neo4j-mirroring progress reporter
pub mod neo4j_reporter;

pub use graph::{Neo4jConfig, Neo4jGraphClient};
pub use neo4j_reporter::Neo4jProgressReporter;
pub use sink_cypher::{CypherSink, CypherSpec};
pub use source_csv::{CsvDialect, CsvSource};
pub use source_sql::{RowTransformer, SqlSource};
