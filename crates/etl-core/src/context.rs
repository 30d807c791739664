use crate::error::EtlError;
use crate::reporter::ProgressReporter;
use crate::row::Row;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::sync::Arc;

/// Mirrors the counters a Neo4j driver reports after executing a write
/// query (`SummaryCounters`), so sinks can fold them into [`crate::statistics::Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub constraints_added: i64,
    pub constraints_removed: i64,
    pub indexes_added: i64,
    pub indexes_removed: i64,
    pub labels_added: i64,
    pub labels_removed: i64,
    pub nodes_created: i64,
    pub nodes_deleted: i64,
    pub properties_set: i64,
    pub relationships_created: i64,
    pub relationships_deleted: i64,
}

impl Add for Counters {
    type Output = Counters;

    fn add(self, rhs: Counters) -> Counters {
        Counters {
            constraints_added: self.constraints_added + rhs.constraints_added,
            constraints_removed: self.constraints_removed + rhs.constraints_removed,
            indexes_added: self.indexes_added + rhs.indexes_added,
            indexes_removed: self.indexes_removed + rhs.indexes_removed,
            labels_added: self.labels_added + rhs.labels_added,
            labels_removed: self.labels_removed + rhs.labels_removed,
            nodes_created: self.nodes_created + rhs.nodes_created,
            nodes_deleted: self.nodes_deleted + rhs.nodes_deleted,
            properties_set: self.properties_set + rhs.properties_set,
            relationships_created: self.relationships_created + rhs.relationships_created,
            relationships_deleted: self.relationships_deleted + rhs.relationships_deleted,
        }
    }
}

impl Counters {
    pub fn into_pairs(self) -> Vec<(&'static str, i64)> {
        vec![
            ("constraints_added", self.constraints_added),
            ("constraints_removed", self.constraints_removed),
            ("indexes_added", self.indexes_added),
            ("indexes_removed", self.indexes_removed),
            ("labels_added", self.labels_added),
            ("labels_removed", self.labels_removed),
            ("nodes_created", self.nodes_created),
            ("nodes_deleted", self.nodes_deleted),
            ("properties_set", self.properties_set),
            ("relationships_created", self.relationships_created),
            ("relationships_deleted", self.relationships_deleted),
        ]
    }
}

/// One or more Cypher statements to run against a batch of rows, each row
/// bound as the `batch` list parameter.
pub enum CypherQuery<'a> {
    Single(&'a str),
    Many(&'a [&'a str]),
}

/// An open handle to the target graph database, abstracting over the
/// concrete driver so sinks, the progress mirror and tests can share one
/// interface.
#[async_trait]
pub trait GraphSession: Send {
    async fn run_query(&mut self, query: CypherQuery<'_>, rows: &[Row]) -> Result<Counters, EtlError>;

    /// Runs a query with no `batch` parameter bound, for schema/constraint
    /// setup statements.
    async fn run_statement(&mut self, query: &str) -> Result<Counters, EtlError>;
}

/// Opens [`GraphSession`]s against a configured target database.
#[async_trait]
pub trait GraphSessionFactory: Send + Sync {
    async fn session(&self) -> Result<Box<dyn GraphSession>, EtlError>;

    /// Name of the database sessions from this factory are bound to, used
    /// by reporters that need to pick a (possibly different) test database.
    fn database_name(&self) -> &str;
}

/// Process-scoped handle every processor and task receives: how to open a
/// session against the target graph database, and where to report
/// progress. Cheap to clone — both fields are `Arc`s.
#[derive(Clone)]
pub struct ETLContext {
    session_factory: Arc<dyn GraphSessionFactory>,
    reporter: Arc<dyn ProgressReporter>,
}

impl ETLContext {
    pub fn new(session_factory: Arc<dyn GraphSessionFactory>, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self { session_factory, reporter }
    }

    pub fn session_factory(&self) -> &Arc<dyn GraphSessionFactory> {
        &self.session_factory
    }

    pub fn reporter(&self) -> &Arc<dyn ProgressReporter> {
        &self.reporter
    }

    /// Reads an environment variable through the `config` crate's
    /// environment source, so job specs and env vars share one lookup path.
    pub fn env(key: &str) -> Option<String> {
        let settings = config::Config::builder().add_source(config::Environment::default()).build().ok()?;
        settings.get_string(&key.to_lowercase()).ok()
    }

    /// True when running under the engine's test harness (set by the test
    /// binary / `#[tokio::test]` setup), the Rust analogue of selecting a
    /// `_test` suffixed database under pytest.
    pub fn test_mode() -> bool {
        Self::env("ETL_TEST_MODE").as_deref() == Some("1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_add_is_element_wise() {
        let a = Counters { nodes_created: 2, ..Default::default() };
        let b = Counters { nodes_created: 3, properties_set: 1, ..Default::default() };
        let sum = a + b;
        assert_eq!(sum.nodes_created, 5);
        assert_eq!(sum.properties_set, 1);
    }
}
