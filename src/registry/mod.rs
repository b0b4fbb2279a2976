//! Task registry: maps task names to their handlers.
//!
//! Workers resolve the body of every leased task here. The registry is built
//! once at startup and shared read-only afterwards.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskbeat::registry::{TaskRegistry, TaskError};
//!
//! let mut registry = TaskRegistry::new();
//! registry.register_fn("sync_region", |ctx| async move {
//!     let region: String = ctx.parse_args()?;
//!     Ok(serde_json::json!({ "region": region }))
//! });
//! ```

pub mod handler;

pub use handler::{FnHandler, TaskContext, TaskError, TaskHandler};

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

/// Name to handler map.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        tracing::debug!(task = %name, "Registered task handler");
        self.handlers.insert(name, handler);
    }

    /// Registers an async closure under `name`.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler::new(f)));
    }

    /// Returns whether a handler is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Returns the registered task names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for `ctx.task.name` on its own tokio task.
    ///
    /// A panic inside the handler is reported as [`TaskError::Panicked`]
    /// instead of unwinding into the caller.
    pub async fn execute(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let handler = self
            .handlers
            .get(&ctx.task.name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(ctx.task.name.clone()))?;

        match tokio::spawn(async move { handler.run(ctx).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(TaskError::Panicked(panic_message(join_err.into_panic())))
            }
            Err(join_err) => Err(TaskError::Failed(join_err.to_string())),
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn ctx(name: &str) -> TaskContext {
        TaskContext::new(
            Task::new(name, json!([2, 3])),
            "worker-0",
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register_fn("add", |ctx: TaskContext| async move {
            let (a, b): (i64, i64) = ctx.parse_args()?;
            Ok(json!(a + b))
        });
        registry.register_fn("explode", |_ctx: TaskContext| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        registry
    }

    #[tokio::test]
    async fn test_execute_by_name() {
        let out = registry().execute(ctx("add")).await.expect("runs");
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let err = registry().execute(ctx("missing")).await.expect_err("unknown");
        assert_eq!(err, TaskError::UnknownTask("missing".to_string()));
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let err = registry().execute(ctx("explode")).await.expect_err("panics");
        assert_eq!(err, TaskError::Panicked("kaboom".to_string()));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_names_sorted() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["add".to_string(), "explode".to_string()]);
        assert!(registry.contains("add"));
        assert_eq!(registry.len(), 2);
    }
}
