//! Result store: durable task state, transition history and engine-owned
//! tables.
//!
//! # Overview
//!
//! The store holds:
//! - **Result records**: current state of every task, one row per task
//! - **Transitions**: append-only status history, also the monitor feed
//! - **Idempotency keys**: SHA-256 digests mapped to the task they created
//! - **Schedule state**: last/next run of every beat entry
//! - **Sync log**: outcome of each period synchronisation
//!
//! Every status change goes through [`ResultStore::transition`], which
//! consults the transition table and rejects changes out of terminal
//! states. Two workers racing to finalize the same task therefore produce
//! exactly one terminal write.
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskbeat::store::{PostgresStore, ResultStore};
//!
//! let store = PostgresStore::connect("postgres://localhost/taskbeat").await?;
//! store.run_migrations().await?;
//!
//! let record = store.get(task_id).await?;
//! ```

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Transient;
use crate::task::{ResultRecord, Task, TaskId, TaskState, Transition, TransitionError, TransitionUpdate};

pub use self::memory::MemoryStore;
pub use self::migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use self::postgres::PostgresStore;

/// Errors that can occur during result store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// No record exists for the task.
    #[error("No result record for task {0}")]
    NotFound(TaskId),

    /// The transition table rejected the status change.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The store is not reachable.
    #[error("Result store unavailable")]
    Unavailable,
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::ConnectionFailed(_) | StoreError::Unavailable => true,
            StoreError::QueryFailed(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Result of registering a new task.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A PENDING record was written.
    Created(ResultRecord),
    /// The idempotency key already maps to this task; nothing was written.
    Duplicate(TaskId),
    /// The idempotency key maps to a PENDING task that never reached the
    /// broker; nothing was written.
    Stranded(Task),
}

impl CreateOutcome {
    /// Returns the id the producer should see.
    pub fn task_id(&self) -> TaskId {
        match self {
            CreateOutcome::Created(record) => record.task_id,
            CreateOutcome::Duplicate(id) => *id,
            CreateOutcome::Stranded(task) => task.id,
        }
    }
}

/// Number of records per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub started: u64,
    pub success: u64,
    pub failure: u64,
    pub retry: u64,
    pub revoked: u64,
}

impl StatusCounts {
    /// Adds `n` records in `state`.
    pub fn add(&mut self, state: TaskState, n: u64) {
        let slot = match state {
            TaskState::Pending => &mut self.pending,
            TaskState::Started => &mut self.started,
            TaskState::Success => &mut self.success,
            TaskState::Failure => &mut self.failure,
            TaskState::Retry => &mut self.retry,
            TaskState::Revoked => &mut self.revoked,
        };
        *slot += n;
    }

    /// Returns the count for `state`.
    pub fn get(&self, state: TaskState) -> u64 {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Started => self.started,
            TaskState::Success => self.success,
            TaskState::Failure => self.failure,
            TaskState::Retry => self.retry,
            TaskState::Revoked => self.revoked,
        }
    }

    /// Returns the number of records in any state.
    pub fn total(&self) -> u64 {
        TaskState::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Durable task state.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Writes the PENDING record for a task.
    ///
    /// When `key_hash` is set and already maps to a task, nothing is written
    /// and that task's id is returned.
    async fn create_pending(
        &self,
        task: &Task,
        key_hash: Option<&str>,
    ) -> Result<CreateOutcome, StoreError>;

    /// Records that the task was accepted by the broker.
    async fn mark_enqueued(&self, task_id: TaskId) -> Result<(), StoreError>;

    /// Returns PENDING tasks never accepted by the broker and created at or
    /// before `older_than`, oldest first.
    async fn unenqueued(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Applies a status change if the transition table allows it.
    async fn transition(
        &self,
        task_id: TaskId,
        update: TransitionUpdate,
    ) -> Result<ResultRecord, StoreError>;

    /// Returns the current record of a task.
    async fn get(&self, task_id: TaskId) -> Result<Option<ResultRecord>, StoreError>;

    /// Returns the transitions of a task in order.
    async fn history(&self, task_id: TaskId) -> Result<Vec<Transition>, StoreError>;

    /// Returns up to `limit` transitions with `seq > cursor`, in order.
    async fn transitions_since(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<Transition>, StoreError>;

    /// Returns the number of records per status.
    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;
}

/// Persisted run bookkeeping of one beat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub entry: String,
    /// Trigger the slots were computed from, as displayed by the entry.
    #[serde(default)]
    pub trigger: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
}

/// Storage for beat entry state.
#[async_trait]
pub trait ScheduleStateStore: Send + Sync {
    /// Loads the state of every entry ever saved.
    async fn load_schedule_state(&self) -> Result<Vec<ScheduleState>, StoreError>;

    /// Inserts or replaces the state of one entry.
    async fn save_schedule_state(&self, state: &ScheduleState) -> Result<(), StoreError>;
}

/// One synchronisation attempt of a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// "day", "month" or "year".
    pub period_type: String,
    /// Timestamp the sync was run for.
    pub last_sync_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// One synchronisation attempt of the snapshot events of a day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub event_date: NaiveDate,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Storage for the synchronisation log.
#[async_trait]
pub trait SyncLogStore: Send + Sync {
    /// Returns the latest successful entry of a period type.
    async fn last_successful_sync(
        &self,
        period_type: &str,
    ) -> Result<Option<SyncLogEntry>, StoreError>;

    /// Appends an entry.
    async fn record_sync(&self, entry: &SyncLogEntry) -> Result<(), StoreError>;

    /// Returns the latest event day synchronised successfully.
    async fn last_synced_event_date(&self) -> Result<Option<NaiveDate>, StoreError>;

    /// Appends an event log entry.
    async fn record_event_sync(&self, entry: &EventLogEntry) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let id = TaskId::new();
        let err = StoreError::NotFound(id);
        assert!(err.to_string().contains(&id.to_string()));

        let err = StoreError::InvalidTransition(TransitionError {
            task_id: id,
            from: TaskState::Success,
            to: TaskState::Started,
        });
        assert!(err.to_string().contains("SUCCESS -> STARTED"));
    }

    #[test]
    fn test_store_error_is_transient() {
        assert!(StoreError::Unavailable.is_transient());
        assert!(StoreError::QueryFailed(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::QueryFailed(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::NotFound(TaskId::new()).is_transient());
    }

    #[test]
    fn test_status_counts() {
        let mut counts = StatusCounts::default();
        counts.add(TaskState::Success, 3);
        counts.add(TaskState::Failure, 1);
        counts.add(TaskState::Success, 2);

        assert_eq!(counts.get(TaskState::Success), 5);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn test_create_outcome_task_id() {
        let id = TaskId::new();
        assert_eq!(CreateOutcome::Duplicate(id).task_id(), id);
    }
}
