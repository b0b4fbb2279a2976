//! taskbeat: distributed periodic task scheduling and execution.
//!
//! A beat scheduler turns cron and interval schedules into task submissions,
//! a dispatcher validates and enqueues them on a broker with visibility-timeout
//! leases, worker pools execute them against a task registry, and every status
//! change is recorded in a result store that a read-only monitor observes.

pub mod beat;
pub mod broker;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod retry;
pub mod store;
pub mod sync;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use dispatcher::{DispatchError, Dispatcher, RevokeOutcome};
pub use engine::Backends;
pub use error::{EngineError, ErrorKind, ValidationError};
pub use registry::{TaskContext, TaskError, TaskRegistry};
pub use task::{ResultRecord, Task, TaskId, TaskOptions, TaskState, Transition};
