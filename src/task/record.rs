//! Result records and their transition history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{Task, TaskId};
use super::state::TaskState;

/// A status change rejected by the transition table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid transition for task {task_id}: {from} -> {to}")]
pub struct TransitionError {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

/// Current state of a task as seen by producers and the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub task_name: String,
    pub queue: String,
    pub status: TaskState,
    /// Return value of a successful execution.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Last error message (FAILURE or RETRY).
    #[serde(default)]
    pub error: Option<String>,
    /// Retries consumed so far.
    pub retries: u32,
    /// Worker that last touched the task.
    #[serde(default)]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Creates the PENDING record written at dispatch.
    pub fn pending(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name.clone(),
            queue: task.queue.clone(),
            status: TaskState::Pending,
            value: None,
            error: None,
            retries: task.retry_count,
            worker_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Returns whether the record reached a final state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies `update` if the transition table allows it.
    ///
    /// On success the record is mutated and the history entry to append is
    /// returned (its `seq` is assigned by the store). On rejection the record
    /// is left untouched.
    pub fn apply(
        &mut self,
        update: &TransitionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        if !self.status.can_transition_to(update.to) {
            return Err(TransitionError {
                task_id: self.task_id,
                from: self.status,
                to: update.to,
            });
        }

        let from = self.status;
        self.status = update.to;
        self.updated_at = now;
        if update.worker_id.is_some() {
            self.worker_id = update.worker_id.clone();
        }
        if let Some(retries) = update.retries {
            self.retries = retries;
        }

        match update.to {
            TaskState::Started => {
                self.started_at = Some(now);
            }
            TaskState::Success => {
                self.value = update.value.clone();
                self.error = None;
                self.finished_at = Some(now);
            }
            TaskState::Failure | TaskState::Revoked => {
                self.error = update.error.clone();
                self.finished_at = Some(now);
            }
            TaskState::Retry => {
                self.error = update.error.clone();
            }
            TaskState::Pending => {}
        }

        Ok(Transition {
            seq: 0,
            task_id: self.task_id,
            task_name: self.task_name.clone(),
            from: Some(from),
            to: update.to,
            worker_id: update.worker_id.clone(),
            detail: update.error.clone(),
            at: now,
        })
    }
}

/// One entry of the append-only status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Store-assigned, strictly increasing feed cursor.
    pub seq: i64,
    pub task_id: TaskId,
    pub task_name: String,
    /// `None` for the initial PENDING entry.
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub worker_id: Option<String>,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl Transition {
    /// History entry for a freshly created record.
    pub fn created(record: &ResultRecord) -> Self {
        Self {
            seq: 0,
            task_id: record.task_id,
            task_name: record.task_name.clone(),
            from: None,
            to: TaskState::Pending,
            worker_id: None,
            detail: None,
            at: record.created_at,
        }
    }
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionUpdate {
    pub to: TaskState,
    pub worker_id: Option<String>,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retries: Option<u32>,
}

impl TransitionUpdate {
    fn to(state: TaskState) -> Self {
        Self {
            to: state,
            worker_id: None,
            value: None,
            error: None,
            retries: None,
        }
    }

    /// A worker began executing the task.
    pub fn started(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            ..Self::to(TaskState::Started)
        }
    }

    /// The task body returned a value.
    pub fn success(worker_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            value: Some(value),
            ..Self::to(TaskState::Success)
        }
    }

    /// The task failed permanently.
    pub fn failure(worker_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            worker_id,
            error: Some(error.into()),
            ..Self::to(TaskState::Failure)
        }
    }

    /// The task failed and will be attempted again.
    pub fn retry(worker_id: impl Into<String>, error: impl Into<String>, retries: u32) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            error: Some(error.into()),
            retries: Some(retries),
            ..Self::to(TaskState::Retry)
        }
    }

    /// The task was cancelled.
    pub fn revoked(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::to(TaskState::Revoked)
        }
    }
}
