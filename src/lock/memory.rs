//! In-process lease lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{LeaseLock, LockError, LockInfo};

/// Lease lock backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryLock {
    locks: Mutex<HashMap<String, LockInfo>>,
    unavailable: AtomicBool,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage of the lock backend.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LockError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseLock for MemoryLock {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.check()?;
        let now = Utc::now();
        let mut locks = self.locks.lock().await;

        if let Some(current) = locks.get(key) {
            if !current.is_expired_at(now) && current.holder_id != holder {
                return Ok(false);
            }
        }
        locks.insert(key.to_string(), LockInfo::new(holder, ttl, now));
        Ok(true)
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        self.check()?;
        let now = Utc::now();
        let mut locks = self.locks.lock().await;

        match locks.get_mut(key) {
            Some(current) if current.holder_id == holder && !current.is_expired_at(now) => {
                current.expires_at = LockInfo::new(holder, ttl, now).expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        self.check()?;
        let mut locks = self.locks.lock().await;

        match locks.get(key) {
            Some(current) if current.holder_id == holder => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        self.check()?;
        let now = Utc::now();
        Ok(self
            .locks
            .lock()
            .await
            .get(key)
            .filter(|info| !info.is_expired_at(now))
            .cloned())
    }
}
