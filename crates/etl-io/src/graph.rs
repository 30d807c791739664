use async_trait::async_trait;
use etl_core::context::{Counters, CypherQuery, GraphSession, GraphSessionFactory};
use etl_core::row::Row;
use etl_core::value::Value;
use etl_core::EtlError;
use neo4rs::{BoltType, Graph, Query};
use tracing::debug;

/// How to reach the target Neo4j instance: connection URI, credentials and
/// the database name sessions from this factory are bound to.
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

/// [`GraphSessionFactory`] backed by a pooled `neo4rs` Bolt connection.
pub struct Neo4jGraphClient {
    graph: Graph,
    database: String,
}

impl Neo4jGraphClient {
    pub async fn connect(config: Neo4jConfig) -> Result<Self, EtlError> {
        let graph = Graph::new(&config.uri, &config.username, &config.password)
            .await
            .map_err(|e| EtlError::Sink(format!("connecting to {}: {e}", config.uri)))?;
        Ok(Self { graph, database: config.database })
    }
}

#[async_trait]
impl GraphSessionFactory for Neo4jGraphClient {
    async fn session(&self) -> Result<Box<dyn GraphSession>, EtlError> {
        Ok(Box::new(Neo4jSession { graph: self.graph.clone(), database: self.database.clone() }))
    }

    fn database_name(&self) -> &str {
        &self.database
    }
}

struct Neo4jSession {
    graph: Graph,
    database: String,
}

#[async_trait]
impl GraphSession for Neo4jSession {
    async fn run_query(&mut self, query: CypherQuery<'_>, rows: &[Row]) -> Result<Counters, EtlError> {
        let batch = rows_to_bolt_list(rows);
        match query {
            CypherQuery::Single(cypher) => self.run_one(cypher, Some(batch)).await,
            CypherQuery::Many(statements) => {
                let mut total = Counters::default();
                for cypher in statements {
                    total = total + self.run_one(cypher, Some(batch.clone())).await?;
                }
                Ok(total)
            }
        }
    }

    async fn run_statement(&mut self, query: &str) -> Result<Counters, EtlError> {
        self.run_one(query, None).await
    }
}

impl Neo4jSession {
    async fn run_one(&mut self, cypher: &str, batch: Option<BoltType>) -> Result<Counters, EtlError> {
        debug!(database = %self.database, cypher, "running cypher statement");
        let mut query = Query::new(cypher.to_string());
        if let Some(batch) = batch {
            query = query.param("batch", batch);
        }

        let mut result = self
            .graph
            .execute(query)
            .await
            .map_err(|e| EtlError::Sink(format!("executing query: {e}")))?;

        while result.next().await.map_err(|e| EtlError::Sink(format!("reading result row: {e}")))?.is_some() {}

        let summary = result.finish().await.map_err(|e| EtlError::Sink(format!("reading summary: {e}")))?;
        Ok(summary.map(counters_from_summary).unwrap_or_default())
    }
}

fn counters_from_summary(summary: neo4rs::summary::Summary) -> Counters {
    let stats = summary.stats();
    Counters {
        constraints_added: stats.constraints_added as i64,
        constraints_removed: stats.constraints_removed as i64,
        indexes_added: stats.indexes_added as i64,
        indexes_removed: stats.indexes_removed as i64,
        labels_added: stats.labels_added as i64,
        labels_removed: stats.labels_removed as i64,
        nodes_created: stats.nodes_created as i64,
        nodes_deleted: stats.nodes_deleted as i64,
        properties_set: stats.properties_set as i64,
        relationships_created: stats.relationships_created as i64,
        relationships_deleted: stats.relationships_deleted as i64,
    }
}

fn rows_to_bolt_list(rows: &[Row]) -> BoltType {
    BoltType::List(rows.iter().map(row_to_bolt_map).collect::<Vec<_>>().into())
}

fn row_to_bolt_map(row: &Row) -> BoltType {
    let pairs = row.iter().map(|(k, v)| (k.as_str().into(), value_to_bolt(v)));
    BoltType::Map(pairs.collect())
}

fn value_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Str(s) => BoltType::String(s.clone().into()),
        Value::Int(i) => BoltType::Integer((*i).into()),
        Value::Float(f) => BoltType::Float((*f).into()),
        Value::Bool(b) => BoltType::Boolean((*b).into()),
        Value::Timestamp(t) => BoltType::String(t.to_rfc3339().into()),
        Value::Point(lon, lat) => {
            let pairs = [("longitude".into(), BoltType::Float((*lon).into())), ("latitude".into(), BoltType::Float((*lat).into()))];
            BoltType::Map(pairs.into_iter().collect())
        }
        Value::Null => BoltType::Null(neo4rs::BoltNull),
    }
}
