//! Broker queue: durable hand-off of tasks from producers to workers.
//!
//! Delivery is at-least-once. A leased task is invisible to other workers
//! until it is acknowledged, returned with `nack`, or its visibility timeout
//! expires, at which point it becomes leasable again.
//!
//! # Implementations
//!
//! - [`RedisBroker`]: production backend, every state change is a Lua script
//! - [`MemoryBroker`]: single-process backend for tests and local runs
//!
//! # Queue Structure
//!
//! Each named queue keeps three sets of tasks:
//!
//! ```text
//!  push ──► delayed ──(eta reached)──► ready ──lease──► leased ──ack──► gone
//!              ▲                         ▲                │
//!              └───────nack(delay)───────┼────────────────┤
//!                                        └──(timeout)─────┘
//! ```

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::Transient;
use crate::task::{Task, TaskId};

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failed to connect to the broker.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Failed to (de)serialize a task payload.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The lease expired and the task was handed to another worker.
    #[error("Lease for task {0} is no longer held")]
    StaleLease(TaskId),

    /// The broker is not reachable.
    #[error("Broker unavailable")]
    Unavailable,
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        match self {
            BrokerError::ConnectionFailed(_) | BrokerError::Unavailable => true,
            BrokerError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            BrokerError::Serialization(_) | BrokerError::StaleLease(_) => false,
        }
    }
}

/// Exclusive, time-bounded claim on a delivered task.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// The delivered task. Workers update `retry_count` before `nack`.
    pub task: Task,
    /// Worker holding the lease.
    pub worker_id: String,
    /// Fencing token; operations with an outdated token are rejected.
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub visibility_timeout: Duration,
}

impl Lease {
    /// Returns when the task becomes visible again unless renewed.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.acquired_at
            + chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }
}

/// Statistics about a single queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue: String,
    /// Tasks visible to workers now.
    pub ready: usize,
    /// Tasks waiting for their eta or retry delay.
    pub delayed: usize,
    /// Tasks currently held by a worker.
    pub leased: usize,
}

impl QueueStats {
    /// Returns the number of tasks not yet acknowledged.
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.leased
    }
}

/// Liveness report published by each worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub queues: Vec<String>,
    pub concurrency: usize,
    /// Tasks executing right now.
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl WorkerHeartbeat {
    /// Returns whether the worker reported within `max_age` of `now`.
    pub fn is_alive(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(365));
        now - self.last_seen <= max_age
    }
}

/// Durable multi-queue task transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Checks that the broker is reachable.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Makes `task` available on its queue, delayed until its eta if set.
    async fn push(&self, task: &Task) -> Result<(), BrokerError>;

    /// Leases the next ready task from the first non-empty queue in `queues`.
    ///
    /// Returns `Ok(None)` when every queue is empty.
    async fn lease(
        &self,
        queues: &[String],
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, BrokerError>;

    /// Removes a leased task permanently.
    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError>;

    /// Returns a leased task to its queue after `requeue_delay`.
    ///
    /// The stored payload is replaced by `lease.task`, so retry counters
    /// incremented by the worker survive redelivery.
    async fn nack(&self, lease: &Lease, requeue_delay: Duration) -> Result<(), BrokerError>;

    /// Extends a lease by `visibility_timeout` from now.
    async fn renew(&self, lease: &Lease, visibility_timeout: Duration) -> Result<(), BrokerError>;

    /// Flags a task as revoked and drops it if it has not been delivered.
    ///
    /// Returns `true` when the task was removed before delivery.
    async fn revoke(&self, queue: &str, task_id: TaskId) -> Result<bool, BrokerError>;

    /// Returns whether a revoke was requested for the task.
    async fn is_revoked(&self, task_id: TaskId) -> Result<bool, BrokerError>;

    /// Returns counts for a queue.
    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError>;

    /// Lists every queue that has received a task.
    async fn queues(&self) -> Result<Vec<String>, BrokerError>;

    /// Publishes a worker liveness report.
    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), BrokerError>;

    /// Returns the last report of every known worker.
    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let id = TaskId::new();
        let err = BrokerError::StaleLease(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_broker_error_is_transient() {
        assert!(BrokerError::Unavailable.is_transient());
        assert!(BrokerError::ConnectionFailed("x".into()).is_transient());
        assert!(!BrokerError::StaleLease(TaskId::new()).is_transient());
    }

    #[test]
    fn test_queue_stats_total() {
        let stats = QueueStats {
            queue: "default".to_string(),
            ready: 10,
            delayed: 5,
            leased: 2,
        };

        assert_eq!(stats.total(), 17);
    }

    #[test]
    fn test_lease_deadline() {
        let task = Task::new("t", serde_json::json!([]));
        let now = Utc::now();
        let lease = Lease {
            task,
            worker_id: "w".to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            visibility_timeout: Duration::from_secs(30),
        };

        assert_eq!(lease.deadline(), now + chrono::Duration::seconds(30));
    }

    #[test]
    fn test_heartbeat_liveness() {
        let now = Utc::now();
        let hb = WorkerHeartbeat {
            worker_id: "w1".to_string(),
            hostname: "host".to_string(),
            queues: vec!["default".to_string()],
            concurrency: 4,
            active: 1,
            processed: 10,
            failed: 0,
            started_at: now,
            last_seen: now - chrono::Duration::seconds(20),
        };

        assert!(hb.is_alive(now, Duration::from_secs(30)));
        assert!(!hb.is_alive(now, Duration::from_secs(10)));
    }
}
