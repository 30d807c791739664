use crate::context::ETLContext;
use crate::statistics::Statistics;
use async_trait::async_trait;
use std::ops::Add;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Outcome of running a [`Task`]: whether it succeeded, what it counted,
/// and (on failure) an accumulated error message.
#[derive(Debug, Clone, Default)]
pub struct TaskReturn {
    pub success: bool,
    pub statistics: Statistics,
    pub error: Option<String>,
}

impl TaskReturn {
    pub fn ok(statistics: Statistics) -> Self {
        Self { success: true, statistics, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, statistics: Statistics::new(), error: Some(error.into()) }
    }
}

impl Add for TaskReturn {
    type Output = TaskReturn;

    /// Combines two results: success is logical AND, statistics merge
    /// element-wise, and errors are joined with `" | "`.
    fn add(self, rhs: TaskReturn) -> TaskReturn {
        let error = match (self.error, rhs.error) {
            (Some(a), Some(b)) => Some(format!("{a} | {b}")),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        TaskReturn { success: self.success && rhs.success, statistics: self.statistics + rhs.statistics, error }
    }
}

/// A named unit of work in the job's task tree.
///
/// `run_internal` holds the actual work; `execute` wraps it with progress
/// reporting (`started_task`/`finished_task` against `context.reporter()`).
#[async_trait]
pub trait Task: Send + Sync {
    fn task_name(&self) -> &str;

    /// Whether the parent `TaskGroup`/`ParallelTaskGroup` should abort the
    /// remaining siblings if this task fails. Defaults to `true`.
    fn abort_on_fail(&self) -> bool {
        true
    }

    async fn run_internal(&mut self, context: &ETLContext) -> TaskReturn;

    async fn execute(&mut self, context: &ETLContext) -> TaskReturn {
        context.reporter().started_task(self.task_name()).await;
        let result = self.run_internal(context).await;
        context.reporter().finished_task(self.task_name(), &result).await;
        result
    }
}

/// Runs child tasks one after another, aborting as soon as a task that
/// requires it (`abort_on_fail() == true`) fails.
pub struct TaskGroup {
    name: String,
    tasks: Vec<Box<dyn Task>>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>, tasks: Vec<Box<dyn Task>>) -> Self {
        Self { name: name.into(), tasks }
    }
}

#[async_trait]
impl Task for TaskGroup {
    fn task_name(&self) -> &str {
        &self.name
    }

    fn abort_on_fail(&self) -> bool {
        self.tasks.iter().any(|t| t.abort_on_fail())
    }

    async fn run_internal(&mut self, context: &ETLContext) -> TaskReturn {
        let mut total = TaskReturn::ok(Statistics::new());
        for task in self.tasks.iter_mut() {
            let result = task.execute(context).await;
            let abort = !result.success && task.abort_on_fail();
            total = total + result;
            if abort {
                break;
            }
        }
        total
    }
}

/// Runs child tasks concurrently, cancelling the remaining siblings as
/// soon as one task that requires it fails.
pub struct ParallelTaskGroup {
    name: String,
    tasks: Vec<Box<dyn Task>>,
}

impl ParallelTaskGroup {
    pub fn new(name: impl Into<String>, tasks: Vec<Box<dyn Task>>) -> Self {
        Self { name: name.into(), tasks }
    }
}

#[async_trait]
impl Task for ParallelTaskGroup {
    fn task_name(&self) -> &str {
        &self.name
    }

    fn abort_on_fail(&self) -> bool {
        self.tasks.iter().any(|t| t.abort_on_fail())
    }

    async fn run_internal(&mut self, context: &ETLContext) -> TaskReturn {
        let context = Arc::new(context.clone());
        let mut set = JoinSet::new();
        for mut task in std::mem::take(&mut self.tasks) {
            let ctx = context.clone();
            set.spawn(async move {
                let result = task.execute(&ctx).await;
                (task.abort_on_fail(), result)
            });
        }

        let mut total = TaskReturn::ok(Statistics::new());
        let mut abort = false;
        while let Some(joined) = set.join_next().await {
            let (task_abort_on_fail, result) = match joined {
                Ok(pair) => pair,
                Err(join_err) => (true, TaskReturn::failed(format!("task panicked: {join_err}"))),
            };
            if !result.success && task_abort_on_fail {
                abort = true;
            }
            total = total + result;
            if abort {
                set.abort_all();
                break;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_return_add_is_logical_and_and_joins_errors() {
        let a = TaskReturn::ok(Statistics::single("x", 1));
        let b = TaskReturn::failed("boom");
        let combined = a + b;
        assert!(!combined.success);
        assert_eq!(combined.statistics.get("x"), 1);
        assert_eq!(combined.error.as_deref(), Some("boom"));
    }

    #[test]
    fn task_return_add_joins_two_errors_with_pipe() {
        let a = TaskReturn::failed("first");
        let b = TaskReturn::failed("second");
        let combined = a + b;
        assert_eq!(combined.error.as_deref(), Some("first | second"));
    }
}
