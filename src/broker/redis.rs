//! Redis broker with atomic lease management.
//!
//! # Key Layout
//!
//! All keys share the configured namespace prefix:
//!
//! - `{ns}:queues`: SET of queue names that have received a task
//! - `{ns}:q:{queue}:ready`: LIST of task ids (LPUSH on enqueue, RPOP on lease)
//! - `{ns}:q:{queue}:delayed`: ZSET of task ids scored by eta in ms
//! - `{ns}:q:{queue}:leases`: ZSET of leased task ids scored by deadline in ms
//! - `{ns}:q:{queue}:owners`: HASH task id -> lease token
//! - `{ns}:q:{queue}:payloads`: HASH task id -> task JSON
//! - `{ns}:revoked`: SET of task ids with a pending revoke
//! - `{ns}:workers`: HASH worker id -> heartbeat JSON
//!
//! # Reliability
//!
//! Every transition that touches more than one key runs as a Lua script so a
//! crashed client can never leave a task in two places. Expired leases are
//! reclaimed by the next `lease` call on the same queue and go back to the
//! head of the ready list.
//!
//! A task id is queued at most once: `push` is ignored while the payload is
//! present, and `lease` drops ready entries whose id still has a live owner.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Broker, BrokerError, Lease, QueueStats, WorkerHeartbeat};
use crate::task::{Task, TaskId};

const PUSH_SCRIPT: &str = r#"
redis.call('SADD', KEYS[1], ARGV[4])
if redis.call('HSETNX', KEYS[2], ARGV[1], ARGV[2]) == 0 then
    return 0
end
if tonumber(ARGV[3]) > 0 then
    redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
else
    redis.call('LPUSH', KEYS[4], ARGV[1])
end
return 1
"#;

const LEASE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])

local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    redis.call('LPUSH', KEYS[1], id)
end

local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[3], id)
    redis.call('HDEL', KEYS[4], id)
    redis.call('RPUSH', KEYS[1], id)
end

while true do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return false
    end
    local payload = redis.call('HGET', KEYS[5], id)
    if payload and redis.call('HEXISTS', KEYS[4], id) == 0 then
        redis.call('ZADD', KEYS[3], ARGV[2], id)
        redis.call('HSET', KEYS[4], id, ARGV[3])
        return payload
    end
end
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
return 1
"#;

const NACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
if tonumber(ARGV[4]) > 0 then
    redis.call('ZADD', KEYS[5], ARGV[4], ARGV[1])
else
    redis.call('LPUSH', KEYS[4], ARGV[1])
end
return 1
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

const REVOKE_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1]) + redis.call('ZREM', KEYS[2], ARGV[1])
if removed > 0 then
    redis.call('HDEL', KEYS[3], ARGV[1])
    return 1
end
redis.call('SADD', KEYS[4], ARGV[1])
return 0
"#;

struct Scripts {
    push: Script,
    lease: Script,
    ack: Script,
    nack: Script,
    renew: Script,
    revoke: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            push: Script::new(PUSH_SCRIPT),
            lease: Script::new(LEASE_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            nack: Script::new(NACK_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            revoke: Script::new(REVOKE_SCRIPT),
        }
    }
}

/// Keys of one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    ready: String,
    delayed: String,
    leases: String,
    owners: String,
    payloads: String,
}

impl QueueKeys {
    fn new(namespace: &str, queue: &str) -> Self {
        let base = format!("{}:q:{}", namespace, queue);
        Self {
            ready: format!("{}:ready", base),
            delayed: format!("{}:delayed", base),
            leases: format!("{}:leases", base),
            owners: format!("{}:owners", base),
            payloads: format!("{}:payloads", base),
        }
    }
}

/// Broker backed by Redis.
pub struct RedisBroker {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    namespace: String,
    scripts: Scripts,
}

impl RedisBroker {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `namespace` - Prefix for every key written by this broker
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, BrokerError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates a broker from an existing ConnectionManager.
    ///
    /// Useful when the lock and the broker share one Redis deployment.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            scripts: Scripts::new(),
        }
    }

    /// Clone of the underlying connection, for sharing with a [`RedisLock`](crate::lock::RedisLock).
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.namespace, queue)
    }

    fn queues_key(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    fn revoked_key(&self) -> String {
        format!("{}:revoked", self.namespace)
    }

    fn workers_key(&self) -> String {
        format!("{}:workers", self.namespace)
    }

    fn millis_from_now(delay: Duration) -> i64 {
        Utc::now().timestamp_millis() + delay.as_millis().min(i64::MAX as u128) as i64
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.redis.clone();
        ::redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn push(&self, task: &Task) -> Result<(), BrokerError> {
        let keys = self.keys(&task.queue);
        let id = task.id.to_string();
        let payload = serde_json::to_string(task)?;
        let eta_ms = match task.eta {
            Some(eta) if eta > Utc::now() => eta.timestamp_millis(),
            _ => 0,
        };
        let mut conn = self.redis.clone();

        let added: i64 = self
            .scripts
            .push
            .key(self.queues_key())
            .key(&keys.payloads)
            .key(&keys.delayed)
            .key(&keys.ready)
            .arg(&id)
            .arg(payload)
            .arg(eta_ms)
            .arg(&task.queue)
            .invoke_async(&mut conn)
            .await?;

        if added == 0 {
            tracing::debug!(
                task_id = %task.id,
                queue = %task.queue,
                "Task already queued, push ignored"
            );
        }
        Ok(())
    }

    async fn lease(
        &self,
        queues: &[String],
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        let mut conn = self.redis.clone();

        for queue in queues {
            let keys = self.keys(queue);
            let now = Utc::now();
            let token = Uuid::new_v4();

            let payload: Option<String> = self
                .scripts
                .lease
                .key(&keys.ready)
                .key(&keys.delayed)
                .key(&keys.leases)
                .key(&keys.owners)
                .key(&keys.payloads)
                .arg(now.timestamp_millis())
                .arg(Self::millis_from_now(visibility_timeout))
                .arg(token.to_string())
                .invoke_async(&mut conn)
                .await?;

            if let Some(payload) = payload {
                let task: Task = serde_json::from_str(&payload)?;
                return Ok(Some(Lease {
                    task,
                    worker_id: worker_id.to_string(),
                    token,
                    acquired_at: now,
                    visibility_timeout,
                }));
            }
        }

        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> Result<(), BrokerError> {
        let keys = self.keys(&lease.task.queue);
        let mut conn = self.redis.clone();

        let done: i64 = self
            .scripts
            .ack
            .key(&keys.leases)
            .key(&keys.owners)
            .key(&keys.payloads)
            .key(self.revoked_key())
            .arg(lease.task.id.to_string())
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await?;

        if done == 1 {
            Ok(())
        } else {
            Err(BrokerError::StaleLease(lease.task.id))
        }
    }

    async fn nack(&self, lease: &Lease, requeue_delay: Duration) -> Result<(), BrokerError> {
        let keys = self.keys(&lease.task.queue);
        let payload = serde_json::to_string(&lease.task)?;
        let eta_ms = if requeue_delay.is_zero() {
            0
        } else {
            Self::millis_from_now(requeue_delay)
        };
        let mut conn = self.redis.clone();

        let done: i64 = self
            .scripts
            .nack
            .key(&keys.leases)
            .key(&keys.owners)
            .key(&keys.payloads)
            .key(&keys.ready)
            .key(&keys.delayed)
            .arg(lease.task.id.to_string())
            .arg(lease.token.to_string())
            .arg(payload)
            .arg(eta_ms)
            .invoke_async(&mut conn)
            .await?;

        if done == 1 {
            Ok(())
        } else {
            Err(BrokerError::StaleLease(lease.task.id))
        }
    }

    async fn renew(&self, lease: &Lease, visibility_timeout: Duration) -> Result<(), BrokerError> {
        let keys = self.keys(&lease.task.queue);
        let mut conn = self.redis.clone();

        let done: i64 = self
            .scripts
            .renew
            .key(&keys.leases)
            .key(&keys.owners)
            .arg(lease.task.id.to_string())
            .arg(lease.token.to_string())
            .arg(Self::millis_from_now(visibility_timeout))
            .invoke_async(&mut conn)
            .await?;

        if done == 1 {
            Ok(())
        } else {
            Err(BrokerError::StaleLease(lease.task.id))
        }
    }

    async fn revoke(&self, queue: &str, task_id: TaskId) -> Result<bool, BrokerError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let removed: i64 = self
            .scripts
            .revoke
            .key(&keys.ready)
            .key(&keys.delayed)
            .key(&keys.payloads)
            .key(self.revoked_key())
            .arg(task_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }

    async fn is_revoked(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        let mut conn = self.redis.clone();
        let flagged: bool = conn
            .sismember(self.revoked_key(), task_id.to_string())
            .await?;
        Ok(flagged)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let keys = self.keys(queue);
        let mut conn = self.redis.clone();

        let (ready, delayed, leased): (usize, usize, usize) = ::redis::pipe()
            .llen(&keys.ready)
            .zcard(&keys.delayed)
            .zcard(&keys.leases)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue: queue.to_string(),
            ready,
            delayed,
            leased,
        })
    }

    async fn queues(&self) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.redis.clone();
        let mut queues: Vec<String> = conn.smembers(self.queues_key()).await?;
        queues.sort();
        Ok(queues)
    }

    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), BrokerError> {
        let data = serde_json::to_string(heartbeat)?;
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(self.workers_key(), &heartbeat.worker_id, data)
            .await?;
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>, BrokerError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.hvals(self.workers_key()).await?;

        let mut workers = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<WorkerHeartbeat>(&entry) {
                Ok(hb) => workers.push(hb),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed worker heartbeat"),
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys_layout() {
        let keys = QueueKeys::new("taskbeat", "sync");

        assert_eq!(keys.ready, "taskbeat:q:sync:ready");
        assert_eq!(keys.delayed, "taskbeat:q:sync:delayed");
        assert_eq!(keys.leases, "taskbeat:q:sync:leases");
        assert_eq!(keys.owners, "taskbeat:q:sync:owners");
        assert_eq!(keys.payloads, "taskbeat:q:sync:payloads");
    }

    #[test]
    fn test_scripts_check_lease_token() {
        for script in [ACK_SCRIPT, NACK_SCRIPT, RENEW_SCRIPT] {
            assert!(script.contains("~= ARGV[2]"));
        }
    }

    #[test]
    fn test_lease_script_reclaims_to_head() {
        // Ready is consumed with RPOP, so RPUSH puts reclaimed ids first in line.
        assert!(LEASE_SCRIPT.contains("RPUSH"));
        assert!(LEASE_SCRIPT.contains("RPOP"));
    }

    #[test]
    fn test_push_and_lease_keep_one_copy_per_task() {
        // The payload hash doubles as the "already queued" marker.
        assert!(PUSH_SCRIPT.contains("HSETNX"));
        // A popped id with a live owner is dropped, not leased again.
        assert!(LEASE_SCRIPT.contains("HEXISTS', KEYS[4], id) == 0"));
    }

    #[test]
    fn test_millis_from_now_is_in_future() {
        let now = Utc::now().timestamp_millis();
        let later = RedisBroker::millis_from_now(Duration::from_secs(30));
        assert!(later >= now + 30_000);
    }
}
