use crate::batch::BatchResult;
use crate::task::TaskReturn;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tabled::builder::Builder as TableBuilder;
use tabled::settings::Style;

/// Describes the shape of a job's task tree before it runs, so a reporter
/// can pre-render the full tree and then fill in status as tasks execute.
#[derive(Debug, Clone)]
pub enum TaskTreeSpec {
    Leaf(String),
    Group(String, Vec<TaskTreeSpec>),
}

impl TaskTreeSpec {
    fn flatten(&self, depth: usize, out: &mut Vec<(usize, String)>) {
        match self {
            TaskTreeSpec::Leaf(name) => out.push((depth, name.clone())),
            TaskTreeSpec::Group(name, children) => {
                out.push((depth, name.clone()));
                for child in children {
                    child.flatten(depth + 1, out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Status {
    Pending,
    Running,
    Done(bool),
}

/// Receives lifecycle notifications for a job's task tree and its
/// per-batch statistics, so progress can be surfaced to an operator or
/// mirrored into an external system.
///
/// Methods are async (rather than fire-and-forget) because a mirroring
/// implementation writes these notifications to the target graph database
/// itself, which is a real I/O call callers must be able to await and
/// propagate errors from.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn register_tasks(&self, tree: &TaskTreeSpec);
    async fn started_task(&self, name: &str);
    async fn finished_task(&self, name: &str, result: &TaskReturn);
    async fn report_progress(&self, processor_name: &str, batch: &BatchResult);
}

struct TreeState {
    order: Vec<(usize, String)>,
    status: Vec<Status>,
    started_at: Vec<Option<Instant>>,
}

/// Prints the task tree and cleaned batch statistics to stdout as the job
/// runs, the default reporter when no external mirroring is configured.
pub struct StdoutProgressReporter {
    tree: Mutex<Option<TreeState>>,
}

impl Default for StdoutProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StdoutProgressReporter {
    pub fn new() -> Self {
        Self { tree: Mutex::new(None) }
    }

    fn render_tree(state: &TreeState) {
        for ((depth, name), status) in state.order.iter().zip(state.status.iter()) {
            let marker = match status {
                Status::Pending => " ",
                Status::Running => ">",
                Status::Done(true) => "x",
                Status::Done(false) => "!",
            };
            let indent = "  ".repeat(*depth);
            println!("{indent}[{marker}] {name}");
        }
    }

    fn format_duration(d: Duration) -> String {
        let millis = d.as_secs_f64() * 1000.0;
        if millis < 1000.0 {
            format!("{millis:.1}ms")
        } else {
            format!("{:.2}s", d.as_secs_f64())
        }
    }
}

#[async_trait]
impl ProgressReporter for StdoutProgressReporter {
    async fn register_tasks(&self, spec: &TaskTreeSpec) {
        let mut order = Vec::new();
        spec.flatten(0, &mut order);
        let status = vec![Status::Pending; order.len()];
        let started_at = vec![None; order.len()];
        let state = TreeState { order, status, started_at };
        Self::render_tree(&state);
        *self.tree.lock().expect("reporter lock poisoned") = Some(state);
    }

    async fn started_task(&self, name: &str) {
        let mut guard = self.tree.lock().expect("reporter lock poisoned");
        let depth = if let Some(state) = guard.as_mut() {
            if let Some(idx) = state.order.iter().position(|(_, n)| n == name) {
                state.status[idx] = Status::Running;
                state.started_at[idx] = Some(Instant::now());
                state.order[idx].0
            } else {
                0
            }
        } else {
            0
        };
        drop(guard);
        println!("{}[>] starting {name}", "  ".repeat(depth));
    }

    async fn finished_task(&self, name: &str, result: &TaskReturn) {
        let mut guard = self.tree.lock().expect("reporter lock poisoned");
        let mut elapsed = None;
        let mut depth = 0;
        if let Some(state) = guard.as_mut() {
            if let Some(idx) = state.order.iter().position(|(_, n)| n == name) {
                state.status[idx] = Status::Done(result.success);
                depth = state.order[idx].0;
                elapsed = state.started_at[idx].map(|start| start.elapsed());
            }
        }
        drop(guard);

        let indent = "  ".repeat(depth);
        let duration = elapsed.map(Self::format_duration).unwrap_or_else(|| "?".to_string());
        println!("{indent}[{}] finished {name} with success: {} in {duration}", if result.success { "x" } else { "!" }, result.success);
        if let Some(error) = &result.error {
            eprintln!("task {name} failed: {error}");
        }
    }

    async fn report_progress(&self, processor_name: &str, batch: &BatchResult) {
        let cleaned = batch.statistics.cleaned();
        if cleaned.is_empty() {
            return;
        }
        let mut builder = TableBuilder::default();
        builder.push_record(["key", "value"]);
        for (key, value) in &cleaned.0 {
            builder.push_record([key.clone(), value.to_string()]);
        }
        let mut table = builder.build();
        table.with(Style::rounded());
        println!("{processor_name} (batch_size={}):\n{table}", batch.batch_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::Statistics;

    #[test]
    fn flatten_preserves_depth_and_order() {
        let tree = TaskTreeSpec::Group(
            "root".into(),
            vec![TaskTreeSpec::Leaf("a".into()), TaskTreeSpec::Group("b".into(), vec![TaskTreeSpec::Leaf("c".into())])],
        );
        let mut out = Vec::new();
        tree.flatten(0, &mut out);
        assert_eq!(out, vec![(0, "root".to_string()), (1, "a".to_string()), (1, "b".to_string()), (2, "c".to_string())]);
    }

    #[tokio::test]
    async fn started_and_finished_task_update_status_without_panicking() {
        let reporter = StdoutProgressReporter::new();
        reporter.register_tasks(&TaskTreeSpec::Leaf("load".into())).await;
        reporter.started_task("load").await;
        reporter.finished_task("load", &TaskReturn::ok(Statistics::single("rows_read", 1))).await;
    }

    #[tokio::test]
    async fn finished_task_captures_elapsed_time_since_started() {
        let reporter = StdoutProgressReporter::new();
        reporter.register_tasks(&TaskTreeSpec::Leaf("load".into())).await;
        reporter.started_task("load").await;
        {
            let guard = reporter.tree.lock().unwrap();
            let state = guard.as_ref().unwrap();
            let idx = state.order.iter().position(|(_, n)| n == "load").unwrap();
            assert!(state.started_at[idx].is_some());
        }
        reporter.finished_task("load", &TaskReturn::ok(Statistics::new())).await;
        let guard = reporter.tree.lock().unwrap();
        let state = guard.as_ref().unwrap();
        let idx = state.order.iter().position(|(_, n)| n == "load").unwrap();
        assert!(matches!(state.status[idx], Status::Done(true)));
    }
}
