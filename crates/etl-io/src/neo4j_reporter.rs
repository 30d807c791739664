use async_trait::async_trait;
use chrono::Utc;
use etl_core::context::{CypherQuery, GraphSessionFactory};
use etl_core::row::Row;
use etl_core::value::Value;
use etl_core::{BatchResult, ProgressReporter, TaskReturn, TaskTreeSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Mirrors task lifecycle and batch statistics into the target graph
/// database as `ETLTask`/`ETLRun`/`ETLStats` nodes, so a run's progress can
/// be queried the same way the data it loaded can be.
///
/// Each task gets a stable `uuid` property, enforced unique by a
/// constraint created the first time this reporter runs against a
/// database. Sub-tasks are linked to their parent via `HAS_SUB_TASK`, and
/// each completed task is linked to an `ETLStats` node via `HAS_STATS`
/// carrying its cleaned statistics as properties.
pub struct Neo4jProgressReporter {
    session_factory: Arc<dyn GraphSessionFactory>,
    run_id: Uuid,
    task_ids: Mutex<HashMap<String, Uuid>>,
    task_started_at: Mutex<HashMap<String, Instant>>,
    constraint_created: Mutex<bool>,
}

impl Neo4jProgressReporter {
    pub fn new(session_factory: Arc<dyn GraphSessionFactory>) -> Self {
        Self {
            session_factory,
            run_id: Uuid::new_v4(),
            task_ids: Mutex::new(HashMap::new()),
            task_started_at: Mutex::new(HashMap::new()),
            constraint_created: Mutex::new(false),
        }
    }

    async fn ensure_constraint(&self) {
        let mut created = self.constraint_created.lock().expect("lock poisoned");
        if *created {
            return;
        }
        let Ok(mut session) = self.session_factory.session().await else {
            warn!("could not open session to create ETLTask uuid constraint");
            return;
        };
        let statement = "CREATE CONSTRAINT etl_task_uuid IF NOT EXISTS FOR (t:ETLTask) REQUIRE t.uuid IS UNIQUE";
        if let Err(e) = session.run_statement(statement).await {
            warn!(error = %e, "failed creating ETLTask uuid constraint");
        }
        *created = true;
    }

    fn task_id(&self, name: &str) -> Uuid {
        let mut ids = self.task_ids.lock().expect("lock poisoned");
        *ids.entry(name.to_string()).or_insert_with(Uuid::new_v4)
    }

    async fn merge_task_node(&self, name: &str, parent: Option<&str>) {
        self.ensure_constraint().await;
        let Ok(mut session) = self.session_factory.session().await else { return };

        let uuid = self.task_id(name);
        let mut row = Row::new();
        row.insert("uuid".into(), Value::Str(uuid.to_string()));
        row.insert("name".into(), Value::Str(name.to_string()));
        row.insert("run_id".into(), Value::Str(self.run_id.to_string()));

        let statement = "UNWIND $batch AS r MERGE (t:ETLTask {uuid: r.uuid}) SET t.name = r.name, t.run_id = r.run_id";
        if let Err(e) = session.run_query(CypherQuery::Single(statement), &[row]).await {
            warn!(error = %e, task = name, "failed merging ETLTask node");
            return;
        }

        if let Some(parent) = parent {
            let parent_uuid = self.task_id(parent);
            let mut edge = Row::new();
            edge.insert("parent".into(), Value::Str(parent_uuid.to_string()));
            edge.insert("child".into(), Value::Str(uuid.to_string()));
            let edge_statement =
                "UNWIND $batch AS r MATCH (p:ETLTask {uuid: r.parent}), (c:ETLTask {uuid: r.child}) MERGE (p)-[:HAS_SUB_TASK]->(c)";
            if let Err(e) = session.run_query(CypherQuery::Single(edge_statement), &[edge]).await {
                warn!(error = %e, task = name, "failed linking ETLTask to parent");
            }
        }
    }

    fn register_recursive<'a>(&'a self, spec: &'a TaskTreeSpec, parent: Option<&'a str>, out: &mut Vec<(String, Option<String>)>) {
        match spec {
            TaskTreeSpec::Leaf(name) => out.push((name.clone(), parent.map(str::to_string))),
            TaskTreeSpec::Group(name, children) => {
                out.push((name.clone(), parent.map(str::to_string)));
                for child in children {
                    self.register_recursive(child, Some(name.as_str()), out);
                }
            }
        }
    }
}

#[async_trait]
impl ProgressReporter for Neo4jProgressReporter {
    async fn register_tasks(&self, tree: &TaskTreeSpec) {
        let mut pairs = Vec::new();
        self.register_recursive(tree, None, &mut pairs);
        for (name, parent) in pairs {
            self.merge_task_node(&name, parent.as_deref()).await;
        }
    }

    async fn started_task(&self, name: &str) {
        self.task_started_at.lock().expect("lock poisoned").insert(name.to_string(), Instant::now());

        let Ok(mut session) = self.session_factory.session().await else { return };
        let uuid = self.task_id(name);
        let mut row = Row::new();
        row.insert("uuid".into(), Value::Str(uuid.to_string()));
        row.insert("start_time".into(), Value::Str(Utc::now().to_rfc3339()));

        let statement = "UNWIND $batch AS r MATCH (t:ETLTask {uuid: r.uuid}) SET t.startTime = r.start_time";
        if let Err(e) = session.run_query(CypherQuery::Single(statement), &[row]).await {
            warn!(error = %e, task = name, "failed recording ETLTask start time");
        }
    }

    async fn finished_task(&self, name: &str, result: &TaskReturn) {
        let Ok(mut session) = self.session_factory.session().await else { return };
        let uuid = self.task_id(name);

        let duration_ms = self.task_started_at.lock().expect("lock poisoned").remove(name).map(|start| start.elapsed().as_millis() as i64);

        let cleaned = result.statistics.cleaned();
        let mut row = Row::new();
        row.insert("task_uuid".into(), Value::Str(uuid.to_string()));
        row.insert("stats_uuid".into(), Value::Str(Uuid::new_v4().to_string()));
        row.insert("success".into(), Value::Bool(result.success));
        row.insert("end_time".into(), Value::Str(Utc::now().to_rfc3339()));
        row.insert("duration_ms".into(), duration_ms.map(Value::Int).unwrap_or(Value::Null));
        for (key, value) in &cleaned.0 {
            row.insert(key.as_str().into(), Value::Int(*value));
        }

        let statement = "UNWIND $batch AS r \
            MATCH (t:ETLTask {uuid: r.task_uuid}) \
            CREATE (s:ETLStats) SET s = r, s.uuid = r.stats_uuid \
            CREATE (t)-[:HAS_STATS]->(s) \
            SET t.success = r.success, t.endTime = r.end_time, t.durationMs = r.duration_ms";
        if let Err(e) = session.run_query(CypherQuery::Single(statement), &[row]).await {
            warn!(error = %e, task = name, "failed recording ETLStats node");
        }
    }

    async fn report_progress(&self, processor_name: &str, batch: &BatchResult) {
        let cleaned = batch.statistics.cleaned();
        if cleaned.is_empty() {
            return;
        }
        let Ok(mut session) = self.session_factory.session().await else { return };

        let mut row = Row::new();
        row.insert("uuid".into(), Value::Str(Uuid::new_v4().to_string()));
        row.insert("run_id".into(), Value::Str(self.run_id.to_string()));
        row.insert("processor".into(), Value::Str(processor_name.to_string()));
        row.insert("batch_size".into(), Value::Int(batch.batch_size as i64));
        for (key, value) in &cleaned.0 {
            row.insert(key.as_str().into(), Value::Int(*value));
        }

        let statement = "UNWIND $batch AS r \
            MATCH (run:ETLRun {uuid: r.run_id}) \
            CREATE (s:ETLStats) SET s = r \
            CREATE (run)-[:HAS_STATS]->(s)";
        if let Err(e) = session.run_query(CypherQuery::Single(statement), &[row]).await {
            warn!(error = %e, processor = processor_name, "failed recording progress stats");
        }
    }
}
