//! Task status state machine.
//!
//! Retry and failure handling are explicit transitions in a table rather
//! than control flow. The table is the single authority consulted by every
//! result store before a status change is written.
//!
//! ```text
//!             ┌──────────────────────────────┐
//!             ▼                              │
//! PENDING ─► STARTED ─┬─► SUCCESS            │
//!    │         ▲  │   ├─► FAILURE            │
//!    │         │  │   ├─► REVOKED            │
//!    │         │  │   └─► RETRY ─────────────┘
//!    │         └──┘ (redelivery)
//!    ├─► REVOKED
//!    └─► FAILURE (rejected before start)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a task as tracked by the result store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Dispatched, waiting for a worker.
    Pending,
    /// Leased by a worker and executing.
    Started,
    /// Completed successfully.
    Success,
    /// Failed permanently.
    Failure,
    /// Failed, scheduled for another attempt.
    Retry,
    /// Cancelled before completion.
    Revoked,
}

impl TaskState {
    /// All states, in lifecycle order.
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Started,
        TaskState::Success,
        TaskState::Failure,
        TaskState::Retry,
        TaskState::Revoked,
    ];

    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Retry => "RETRY",
            TaskState::Revoked => "REVOKED",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }

    /// Returns whether a revoke request can still prevent execution.
    pub fn is_revocable(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Retry)
    }

    /// Looks up `self -> next` in the transition table.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;

        match (self, next) {
            (Pending, Started | Failure | Revoked) => true,
            // STARTED -> STARTED is a redelivery after an expired lease.
            (Started, Started | Success | Failure | Retry | Revoked) => true,
            (Retry, Started | Failure | Revoked) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskState::Pending),
            "STARTED" => Ok(TaskState::Started),
            "SUCCESS" => Ok(TaskState::Success),
            "FAILURE" => Ok(TaskState::Failure),
            "RETRY" => Ok(TaskState::Retry),
            "REVOKED" => Ok(TaskState::Revoked),
            other => Err(format!("unknown task state '{}'", other)),
        }
    }
}
