//! Lease lock: a named, time-bound ownership token.
//!
//! The beat scheduler holds one to guarantee a single active instance across
//! the cluster. A holder that stops renewing loses the lock once the TTL
//! runs out; another instance may then acquire it.
//!
//! # Example
//!
//! ```rust,ignore
//! let lock = RedisLock::connect("redis://localhost:6379", "taskbeat").await?;
//!
//! if lock.try_acquire("beat", "beat-host-1", Duration::from_secs(30)).await? {
//!     // leader until the TTL runs out, renew well before that
//!     lock.renew("beat", "beat-host-1", Duration::from_secs(30)).await?;
//! }
//! ```

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Transient;

pub use self::memory::MemoryLock;
pub use self::redis::RedisLock;

/// Default lock TTL (30 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Errors that can occur during lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock backend connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Malformed lock record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock backend unavailable")]
    Unavailable,
}

impl Transient for LockError {
    fn is_transient(&self) -> bool {
        match self {
            LockError::ConnectionFailed(_) | LockError::Unavailable => true,
            LockError::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            LockError::Serialization(_) => false,
        }
    }
}

/// Lock record contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock holder ID.
    pub holder_id: String,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock record for `holder_id` valid for `ttl` from `now`.
    pub fn new(holder_id: impl Into<String>, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder_id: holder_id.into(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            acquired_at: now,
        }
    }

    /// Returns whether this lock has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns the remaining TTL at `now`, or zero if expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Time-bound exclusive ownership of a named resource.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquires `key` for `holder` unless another holder's lock is live.
    ///
    /// Re-acquiring a lock already held by `holder` succeeds and resets the
    /// TTL, so a restarted process with a stable holder id resumes at once.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Extends the lock if `holder` still owns it.
    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Releases the lock if `holder` owns it.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError>;

    /// Returns the current live lock record, if any.
    async fn holder(&self, key: &str) -> Result<Option<LockInfo>, LockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_info_expiry() {
        let now = Utc::now();
        let info = LockInfo::new("beat-1", Duration::from_secs(30), now);

        assert!(!info.is_expired_at(now));
        assert!(info.is_expired_at(now + chrono::Duration::seconds(30)));
        assert_eq!(info.remaining_ttl(now), Duration::from_secs(30));
        assert_eq!(
            info.remaining_ttl(now + chrono::Duration::seconds(60)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_lock_error_is_transient() {
        assert!(LockError::Unavailable.is_transient());
        let err = LockError::Serialization(
            serde_json::from_str::<LockInfo>("nope").expect_err("invalid json"),
        );
        assert!(!err.is_transient());
    }
}
