//! In-process broker.
//!
//! Holds every queue behind one mutex. Used by the test suite and by
//! `memory://` deployments where producer and workers share a process.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Broker, BrokerError, Lease, QueueStats, WorkerHeartbeat};
use crate::task::{Task, TaskId};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<TaskId>,
    delayed: Vec<(DateTime<Utc>, TaskId)>,
}

#[derive(Debug)]
struct LeaseSlot {
    queue: String,
    token: Uuid,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    queue_order: Vec<String>,
    payloads: HashMap<TaskId, Task>,
    leases: HashMap<TaskId, LeaseSlot>,
    revoked: HashSet<TaskId>,
    workers: HashMap<String, WorkerHeartbeat>,
}

impl Inner {
    fn queue_mut(&mut self, name: &str) -> &mut QueueState {
        if !self.queues.contains_key(name) {
            self.queue_order.push(name.to_string());
        }
        self.queues.entry(name.to_string()).or_default()
    }

    /// Moves due delayed tasks to the back of the queue and expired leases
    /// to the front.
    fn promote(&mut self, name: &str, now: DateTime<Utc>) {
        let expired: Vec<TaskId> = self
            .leases
            .iter()
            .filter(|(_, slot)| slot.queue == name && slot.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.leases.remove(id);
        }

        let queue = self.queue_mut(name);

        let mut due: Vec<(DateTime<Utc>, TaskId)> = Vec::new();
        queue.delayed.retain(|entry| {
            if entry.0 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(eta, _)| *eta);
        queue.ready.extend(due.into_iter().map(|(_, id)| id));

        for id in expired {
            queue.ready.push_front(id);
        }
    }
}

/// Broker backed by process memory.
#[derive(Debug)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable every call fails with
    /// [`BrokerError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable)
        }
    }

    fn check_token(inner: &Inner, lease: &Lease) -> Result<(), BrokerError> {
        match inner.leases.get(&lease.task.id) {
            Some(slot) if slot.token == lease.token => Ok(()),
            _ => Err(BrokerError::StaleLease(lease.task.id)),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check()
    }

    async fn push(&self, task: &Task) -> Result<(), BrokerError> {
        self.check()?;
        let mut inner = self.inner.lock().await;

        // Queued or leased already.
        if inner.payloads.contains_key(&task.id) {
            return Ok(());
        }
        inner.payloads.insert(task.id, task.clone());
        let now = Utc::now();
        let queue = inner.queue_mut(&task.queue);
        match task.eta {
            Some(eta) if eta > now => queue.delayed.push((eta, task.id)),
            _ => queue.ready.push_back(task.id),
        }
        Ok(())
    }

    async fn lease(
        &self,
        queues: &[String],
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Lease>, BrokerError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        for name in queues {
            inner.promote(name, now);

            while let Some(id) = inner.queue_mut(name).ready.pop_front() {
                if inner.leases.contains_key(&id) {
                    continue;
                }
                let Some(task) = inner.payloads.get(&id).cloned() else {
                    continue;
                };
                let token = Uuid::new_v4();
                inner.leases.insert(
                    id,
                    LeaseSlot {
                        queue: name.clone(),
                        token,
                        deadline,
                    },
                );
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
        self.check()?;
        let mut inner = self.inner.lock().await;
        Self::check_token(&inner, lease)?;

        let id = lease.task.id;
        inner.leases.remove(&id);
        inner.payloads.remove(&id);
        inner.revoked.remove(&id);
        Ok(())
    }

    async fn nack(&self, lease: &Lease, requeue_delay: Duration) -> Result<(), BrokerError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Self::check_token(&inner, lease)?;

        let id = lease.task.id;
        inner.leases.remove(&id);
        inner.payloads.insert(id, lease.task.clone());

        let queue = inner.queue_mut(&lease.task.queue);
        if requeue_delay.is_zero() {
            queue.ready.push_back(id);
        } else {
            let eta = Utc::now()
                + chrono::Duration::from_std(requeue_delay)
                    .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
            queue.delayed.push((eta, id));
        }
        Ok(())
    }

    async fn renew(&self, lease: &Lease, visibility_timeout: Duration) -> Result<(), BrokerError> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Self::check_token(&inner, lease)?;

        let deadline = Utc::now()
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        if let Some(slot) = inner.leases.get_mut(&lease.task.id) {
            slot.deadline = deadline;
        }
        Ok(())
    }

    async fn revoke(&self, queue: &str, task_id: TaskId) -> Result<bool, BrokerError> {
        self.check()?;
        let mut inner = self.inner.lock().await;

        let state = inner.queue_mut(queue);
        let before = state.ready.len() + state.delayed.len();
        state.ready.retain(|id| *id != task_id);
        state.delayed.retain(|(_, id)| *id != task_id);
        let removed = before != state.ready.len() + state.delayed.len();

        if removed {
            inner.payloads.remove(&task_id);
        } else {
            inner.revoked.insert(task_id);
        }
        Ok(removed)
    }

    async fn is_revoked(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        self.check()?;
        Ok(self.inner.lock().await.revoked.contains(&task_id))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        self.check()?;
        let inner = self.inner.lock().await;

        let (ready, delayed) = inner
            .queues
            .get(queue)
            .map(|q| (q.ready.len(), q.delayed.len()))
            .unwrap_or_default();
        let leased = inner.leases.values().filter(|s| s.queue == queue).count();

        Ok(QueueStats {
            queue: queue.to_string(),
            ready,
            delayed,
            leased,
        })
    }

    async fn queues(&self) -> Result<Vec<String>, BrokerError> {
        self.check()?;
        Ok(self.inner.lock().await.queue_order.clone())
    }

    async fn record_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), BrokerError> {
        self.check()?;
        self.inner
            .lock()
            .await
            .workers
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<WorkerHeartbeat>, BrokerError> {
        self.check()?;
        let mut workers: Vec<_> = self.inner.lock().await.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queues() -> Vec<String> {
        vec!["default".to_string()]
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = MemoryBroker::new();
        let a = Task::new("a", json!([]));
        let b = Task::new("b", json!([]));
        broker.push(&a).await.expect("push a");
        broker.push(&b).await.expect("push b");

        let first = broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        assert_eq!(first.task.id, a.id);

        let second = broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        assert_eq!(second.task.id, b.id);

        assert!(broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .is_none());
    }

    #[tokio::test]
    async fn test_leased_task_is_invisible_until_timeout() {
        let broker = MemoryBroker::new();
        let task = Task::new("t", json!([]));
        broker.push(&task).await.expect("push");

        let lease = broker
            .lease(&queues(), "w1", Duration::from_millis(50))
            .await
            .expect("lease")
            .expect("task");
        assert!(broker
            .lease(&queues(), "w2", Duration::from_millis(50))
            .await
            .expect("lease")
            .is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let again = broker
            .lease(&queues(), "w2", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("redelivered");
        assert_eq!(again.task.id, task.id);
        assert_ne!(again.token, lease.token);

        let err = broker.ack(&lease).await.expect_err("stale token");
        assert!(matches!(err, BrokerError::StaleLease(id) if id == task.id));
        broker.ack(&again).await.expect("current token acks");
    }

    #[tokio::test]
    async fn test_push_of_queued_or_leased_task_is_ignored() {
        let broker = MemoryBroker::new();
        let task = Task::new("t", json!([]));
        broker.push(&task).await.expect("push");
        broker.push(&task).await.expect("second push");
        assert_eq!(broker.stats("default").await.expect("stats").ready, 1);

        let lease = broker
            .lease(&queues(), "w1", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        broker.push(&task).await.expect("push while leased");
        assert!(broker
            .lease(&queues(), "w2", Duration::from_secs(30))
            .await
            .expect("lease")
            .is_none());

        let stats = broker.stats("default").await.expect("stats");
        assert_eq!((stats.ready, stats.leased), (0, 1));
        broker.ack(&lease).await.expect("ack");
    }

    #[tokio::test]
    async fn test_renew_extends_deadline() {
        let broker = MemoryBroker::new();
        let task = Task::new("t", json!([]));
        broker.push(&task).await.expect("push");

        let lease = broker
            .lease(&queues(), "w1", Duration::from_millis(60))
            .await
            .expect("lease")
            .expect("task");
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker
            .renew(&lease, Duration::from_millis(150))
            .await
            .expect("renew");

        // Past the original deadline, inside the renewed one.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(broker
            .lease(&queues(), "w2", Duration::from_secs(30))
            .await
            .expect("lease")
            .is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        let again = broker
            .lease(&queues(), "w2", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("reclaimed after renewed deadline");
        assert_eq!(again.task.id, task.id);

        let err = broker
            .renew(&lease, Duration::from_secs(30))
            .await
            .expect_err("stale token");
        assert!(matches!(err, BrokerError::StaleLease(id) if id == task.id));
        broker
            .renew(&again, Duration::from_secs(30))
            .await
            .expect("current token renews");
    }

    #[tokio::test]
    async fn test_delayed_task_waits_for_eta() {
        let broker = MemoryBroker::new();
        let task = Task::new("t", json!([]))
            .with_eta(Utc::now() + chrono::Duration::milliseconds(60));
        broker.push(&task).await.expect("push");

        let stats = broker.stats("default").await.expect("stats");
        assert_eq!(stats.delayed, 1);
        assert!(broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .is_none());

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .is_some());
    }

    #[tokio::test]
    async fn test_nack_keeps_updated_payload() {
        let broker = MemoryBroker::new();
        broker.push(&Task::new("t", json!([]))).await.expect("push");

        let mut lease = broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        lease.task.retry_count += 1;
        broker.nack(&lease, Duration::ZERO).await.expect("nack");

        let again = broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        assert_eq!(again.task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_revoke_pending_and_leased() {
        let broker = MemoryBroker::new();
        let pending = Task::new("p", json!([]));
        let running = Task::new("r", json!([]));
        broker.push(&running).await.expect("push");
        broker.push(&pending).await.expect("push");

        let lease = broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        assert_eq!(lease.task.id, running.id);

        assert!(broker.revoke("default", pending.id).await.expect("revoke"));
        assert!(!broker.revoke("default", running.id).await.expect("revoke"));
        assert!(broker.is_revoked(running.id).await.expect("flag"));

        assert!(broker
            .lease(&queues(), "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .is_none());

        broker.ack(&lease).await.expect("ack");
        assert!(!broker.is_revoked(running.id).await.expect("flag cleared"));
    }

    #[tokio::test]
    async fn test_queue_priority_order() {
        let broker = MemoryBroker::new();
        broker
            .push(&Task::new("low", json!([])).with_queue("low"))
            .await
            .expect("push");
        broker
            .push(&Task::new("high", json!([])).with_queue("high"))
            .await
            .expect("push");

        let order = vec!["high".to_string(), "low".to_string()];
        let lease = broker
            .lease(&order, "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        assert_eq!(lease.task.name, "high");
        assert_eq!(
            broker.queues().await.expect("queues"),
            vec!["low".to_string(), "high".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unavailable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let err = broker
            .push(&Task::new("t", json!([])))
            .await
            .expect_err("down");
        assert!(matches!(err, BrokerError::Unavailable));

        broker.set_available(true);
        broker.ping().await.expect("back up");
    }
}
