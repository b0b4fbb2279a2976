//! Read-only view of the engine: queue depth, worker roster and the
//! transition feed.
//!
//! The monitor never writes to the broker or the result store. When a
//! backend is unreachable the last good values are served with `stale` set,
//! and the next successful read resynchronises.

mod feed;

pub use feed::{TransitionFeed, DEFAULT_FEED_BATCH, DEFAULT_FEED_INTERVAL};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::broker::{Broker, BrokerError, QueueStats, WorkerHeartbeat};
use crate::metrics::MetricsCollector;
use crate::store::{ResultStore, StatusCounts, StoreError};
use crate::task::{ResultRecord, TaskId, Transition};

/// Heartbeats older than this mark a worker as gone.
pub const DEFAULT_WORKER_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),
}

/// A worker as seen by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    pub alive: bool,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub queues: Vec<QueueStats>,
    pub workers: Vec<WorkerStatus>,
    pub active_workers: usize,
    pub status_counts: StatusCounts,
    /// Some values come from an earlier snapshot.
    pub stale: bool,
    /// Read errors of this snapshot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl MonitorSnapshot {
    /// Total tasks not yet acknowledged across all queues.
    pub fn total_depth(&self) -> usize {
        self.queues.iter().map(QueueStats::total).sum()
    }
}

/// Read-only subscriber over the broker and the result store.
#[derive(Clone)]
pub struct Monitor {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    worker_max_age: Duration,
    last: Arc<Mutex<MonitorSnapshot>>,
}

impl Monitor {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            broker,
            store,
            worker_max_age: DEFAULT_WORKER_MAX_AGE,
            last: Arc::new(Mutex::new(MonitorSnapshot::default())),
        }
    }

    pub fn with_worker_max_age(mut self, max_age: Duration) -> Self {
        self.worker_max_age = max_age;
        self
    }

    /// Reads queue depth, the worker roster and status counts.
    ///
    /// Never fails. Parts that cannot be read are taken from the previous
    /// snapshot and the result is flagged `stale`.
    pub async fn snapshot(&self) -> MonitorSnapshot {
        let now = Utc::now();
        let mut last = self.last.lock().await;
        let mut snapshot = MonitorSnapshot {
            taken_at: now,
            ..Default::default()
        };

        match self.read_queues().await {
            Ok(queues) => snapshot.queues = queues,
            Err(e) => {
                warn!(error = %e, "Monitor failed to read queues, serving stale view");
                snapshot.queues = last.queues.clone();
                snapshot.stale = true;
                snapshot.errors.push(e.to_string());
            }
        }

        match self.broker.workers().await {
            Ok(heartbeats) => {
                snapshot.workers = heartbeats
                    .into_iter()
                    .map(|heartbeat| WorkerStatus {
                        alive: heartbeat.is_alive(now, self.worker_max_age),
                        heartbeat,
                    })
                    .collect();
            }
            Err(e) => {
                warn!(error = %e, "Monitor failed to read workers, serving stale view");
                snapshot.workers = last.workers.clone();
                snapshot.stale = true;
                snapshot.errors.push(e.to_string());
            }
        }
        snapshot.active_workers = snapshot.workers.iter().filter(|w| w.alive).count();

        match self.store.status_counts().await {
            Ok(counts) => snapshot.status_counts = counts,
            Err(e) => {
                warn!(error = %e, "Monitor failed to read status counts, serving stale view");
                snapshot.status_counts = last.status_counts.clone();
                snapshot.stale = true;
                snapshot.errors.push(e.to_string());
            }
        }

        *last = snapshot.clone();
        snapshot
    }

    async fn read_queues(&self) -> Result<Vec<QueueStats>, BrokerError> {
        let mut stats = Vec::new();
        for queue in self.broker.queues().await? {
            stats.push(self.broker.stats(&queue).await?);
        }
        Ok(stats)
    }

    /// Takes a snapshot and pushes it into the Prometheus gauges.
    pub async fn refresh_metrics(&self) -> MonitorSnapshot {
        let snapshot = self.snapshot().await;
        let metrics = MetricsCollector::new();
        for queue in &snapshot.queues {
            metrics.update_queue_depth(queue);
        }
        metrics.update_workers(snapshot.active_workers);
        snapshot
    }

    /// Current record of a task.
    pub async fn status(&self, task_id: TaskId) -> Result<Option<ResultRecord>, MonitorError> {
        Ok(self.store.get(task_id).await?)
    }

    /// Full status history of a task.
    pub async fn history(&self, task_id: TaskId) -> Result<Vec<Transition>, MonitorError> {
        Ok(self.store.history(task_id).await?)
    }

    /// Transitions after `cursor`, oldest first.
    pub async fn transitions_since(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<Transition>, MonitorError> {
        Ok(self.store.transitions_since(cursor, limit).await?)
    }

    /// Live feed of transitions after `cursor` (0 replays everything).
    pub fn feed(&self, cursor: i64) -> TransitionFeed {
        TransitionFeed::new(Arc::clone(&self.store), cursor)
    }
}
