//! Task handler capability and its execution context.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::task::Task;

/// Errors returned by task bodies.
///
/// The variant decides what the worker records: retryable errors consume the
/// retry budget, everything else is final.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// No handler is registered under the task name.
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    /// The argument payload does not match what the handler expects.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A failure that may succeed on another attempt.
    #[error("{0}")]
    Failed(String),

    /// A failure that will not succeed on another attempt.
    #[error("{0}")]
    Fatal(String),

    /// The handler panicked.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The handler observed a revoke request and stopped.
    #[error("Task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Creates a retryable failure.
    pub fn retryable(msg: impl std::fmt::Display) -> Self {
        TaskError::Failed(msg.to_string())
    }

    /// Creates a permanent failure.
    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        TaskError::Fatal(msg.to_string())
    }

    /// Returns whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Failed(_) | TaskError::Panicked(_))
    }
}

/// Everything a handler can see about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub worker_id: String,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn new(task: Task, worker_id: impl Into<String>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            task,
            worker_id: worker_id.into(),
            cancel,
        }
    }

    /// Decodes the argument payload.
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.task.args.clone())
            .map_err(|e| TaskError::InvalidArguments(e.to_string()))
    }

    /// Returns whether a revoke was requested while running.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once a revoke was requested. Long-running
    /// bodies call this between steps.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Executable body of a named task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct RegionArgs {
        region: String,
    }

    fn ctx(args: Value) -> TaskContext {
        TaskContext::new(
            Task::new("sync_region", args),
            "worker-0",
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_parse_args() {
        let args: RegionArgs = ctx(json!({"region": "A"})).parse_args().expect("valid");
        assert_eq!(args.region, "A");

        let err = ctx(json!([1, 2])).parse_args::<RegionArgs>().expect_err("mismatch");
        assert!(matches!(err, TaskError::InvalidArguments(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TaskError::retryable("timeout").is_retryable());
        assert!(TaskError::Panicked("boom".into()).is_retryable());
        assert!(!TaskError::fatal("bad input").is_retryable());
        assert!(!TaskError::UnknownTask("x".into()).is_retryable());
        assert!(!TaskError::Cancelled.is_retryable());
    }

    #[test]
    fn test_cancellation_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new(Task::new("t", json!([])), "w", Arc::clone(&flag));

        assert!(ctx.check_cancelled().is_ok());
        flag.store(true, Ordering::SeqCst);
        assert_eq!(ctx.check_cancelled(), Err(TaskError::Cancelled));
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new(|ctx: TaskContext| async move {
            let args: RegionArgs = ctx.parse_args()?;
            Ok(json!({ "synced": args.region }))
        });

        let out = handler.run(ctx(json!({"region": "B"}))).await.expect("runs");
        assert_eq!(out, json!({"synced": "B"}));
    }
}
