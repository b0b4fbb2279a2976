//! Worker pool: leases tasks from the broker, runs them, records outcomes.
//!
//! # Lifecycle of one delivery
//!
//! ```text
//!  lease ──► revoked? ──yes──► REVOKED + ack
//!              │ no
//!              ▼
//!         registered? ──no──► FAILURE + ack
//!              │ yes
//!              ▼
//!          STARTED ──rejected (terminal)──► ack (duplicate delivery)
//!              │
//!              ▼
//!          execute ─┬─ Ok ─────────────────────────► SUCCESS + ack
//!                   ├─ Cancelled ──────────────────► REVOKED + ack
//!                   ├─ retryable, budget left ─────► RETRY + nack(backoff)
//!                   └─ otherwise ──────────────────► FAILURE + ack
//! ```
//!
//! Infrastructure errors while recording are retried with backoff. When they
//! persist the lease is abandoned so the broker redelivers the task after its
//! visibility timeout.

mod executor;
pub mod pool;

use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;

pub use self::pool::{PoolStats, WorkerPool, WorkerPoolConfig};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Broker unreachable at startup.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Invalid pool configuration.
    #[error("Invalid worker configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}
