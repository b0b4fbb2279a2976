//! Redis lease lock.
//!
//! The lock lives at `{ns}:lock:{key}` as a JSON [`LockInfo`] with a PX
//! expiry. Ownership checks and writes run in one Lua script.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;

use super::{LeaseLock, LockError, LockInfo};

/// Takes the lock when it is free or already ours.
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    local info = cjson.decode(current)
    if info.holder_id ~= ARGV[1] then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

const RENEW_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local info = cjson.decode(current)
if info.holder_id ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
local info = cjson.decode(current)
if info.holder_id ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// Lease lock backed by Redis.
pub struct RedisLock {
    redis: ConnectionManager,
    namespace: String,
    acquire: Script,
    renew: Script,
    release: Script,
}

impl RedisLock {
    /// Connects to Redis.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, LockError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| LockError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a lock client from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            acquire: Script::new(ACQUIRE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.namespace, key)
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl LeaseLock for RedisLock {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let info = serde_json::to_string(&LockInfo::new(holder, ttl, Utc::now()))?;
        let mut conn = self.redis.clone();

        let acquired: i64 = self
            .acquire
            .key(self.lock_key(key))
            .arg(holder)
            .arg(info)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let mut info = self
            .holder(key)
            .await?
            .unwrap_or_else(|| LockInfo::new(holder, ttl, now));
        info.expires_at = LockInfo::new(holder, ttl, now).expires_at;
        let info = serde_json::to_string(&info)?;
        let mut conn = self.redis.clone();

        let renewed: i64 = self
            .renew
            .key(self.lock_key(key))
            .arg(holder)
            .arg(info)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        let mut conn = self.redis.clone();

        let released: i64 = self
            .release
            .key(self.lock_key(key))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.lock_key(key)).await?;

        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }
}
