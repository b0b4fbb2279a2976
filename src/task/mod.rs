//! Task model: tasks, submission options, status state machine and result
//! records.

pub mod model;
pub mod record;
pub mod state;

pub use model::{Task, TaskId, TaskOptions, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE, MAX_RETRIES_LIMIT};
pub use record::{ResultRecord, Transition, TransitionError, TransitionUpdate};
pub use state::TaskState;
