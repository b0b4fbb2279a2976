//! Pool of concurrent executors sharing one broker and result store.
//!
//! # Features
//!
//! - Configurable concurrency and subscribed queues
//! - Graceful shutdown with broadcast channel
//! - Retry with exponential backoff through `nack`
//! - Heartbeats published to the broker's worker roster
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, WorkerHeartbeat};
use crate::registry::TaskRegistry;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::ResultStore;
use crate::task::DEFAULT_QUEUE;

use super::executor::Executor;
use super::PoolError;

/// Default lease visibility timeout.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Identity reported in heartbeats; executors append their index.
    pub worker_id: String,
    /// Number of executors to spawn.
    pub concurrency: usize,
    /// Queues to lease from, highest priority first.
    pub queues: Vec<String>,
    /// How long a lease stays exclusive without renewal.
    pub visibility_timeout: Duration,
    /// How long to wait when every queue is empty.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// How often the pool publishes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Delay schedule between attempts of a failing task.
    pub retry_policy: RetryPolicy,
    /// Attempts for broker and store calls before a lease is abandoned.
    pub infra_attempts: u32,
    /// Backoff between those attempts.
    pub infra_backoff: Backoff,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            concurrency: 4,
            queues: vec![DEFAULT_QUEUE.to_string()],
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            infra_attempts: 5,
            infra_backoff: Backoff::default(),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the given concurrency.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_infra_retry(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.infra_attempts = attempts;
        self.infra_backoff = backoff;
        self
    }

    /// Interval at which running tasks renew their lease.
    pub fn renew_interval(&self) -> Duration {
        (self.visibility_timeout / 3).max(Duration::from_millis(10))
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.concurrency == 0 {
            return Err(PoolError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.queues.is_empty() {
            return Err(PoolError::InvalidConfig(
                "at least one queue is required".to_string(),
            ));
        }
        if self.visibility_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "visibility timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_worker_id() -> String {
    let host = hostname();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..6])
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of executors in the pool.
    pub concurrency: usize,
    /// Executors currently running a task.
    pub active: usize,
    /// Attempts that ended in SUCCESS.
    pub succeeded: u64,
    /// Attempts that ended in FAILURE.
    pub failed: u64,
    /// Attempts that ended in RETRY.
    pub retried: u64,
    /// Deliveries that ended in REVOKED.
    pub revoked: u64,
    /// Leases given up because the result could not be recorded.
    pub abandoned: u64,
    /// Average duration of executed attempts.
    pub average_duration: Duration,
}

impl PoolStats {
    /// Returns the number of attempts that reached an outcome.
    pub fn total_processed(&self) -> u64 {
        self.succeeded + self.failed + self.retried + self.revoked
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub(super) struct SharedPoolStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    revoked: AtomicU64,
    abandoned: AtomicU64,
    executed: AtomicU64,
    total_duration_ms: AtomicU64,
    active: AtomicU64,
}

/// Outcome of one delivery, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    Succeeded,
    Failed,
    Retried,
    Revoked,
    Abandoned,
}

impl SharedPoolStats {
    pub(super) fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Failed => &self.failed,
            Outcome::Retried => &self.retried,
            Outcome::Revoked => &self.revoked,
            Outcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn record_duration(&self, duration: Duration) {
        self.executed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub(super) fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(super) fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, concurrency: usize) -> PoolStats {
        let executed = self.executed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if executed > 0 {
            Duration::from_millis(total_duration_ms / executed)
        } else {
            Duration::ZERO
        };

        PoolStats {
            concurrency,
            active: self.active.load(Ordering::SeqCst) as usize,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            revoked: self.revoked.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
            average_duration,
        }
    }
}

/// Worker pool that manages multiple executors leasing from the broker.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    registry: TaskRegistry,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    started_at: DateTime<Utc>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over shared backends.
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        registry: TaskRegistry,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            broker,
            store,
            registry,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::default()),
            started_at: Utc::now(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all executors and the heartbeat loop.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// `PoolError::InvalidConfig` for an unusable configuration.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        if let Err(e) = self.broker.ping().await {
            warn!(error = %e, "Broker not reachable at worker start, executors will keep polling");
        }

        self.started_at = Utc::now();

        for i in 0..self.config.concurrency {
            let executor = Executor {
                id: format!("{}-{}", self.config.worker_id, i),
                config: self.config.clone(),
                broker: Arc::clone(&self.broker),
                store: Arc::clone(&self.store),
                registry: self.registry.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: Arc::clone(&self.stats),
            };

            self.handles.push(tokio::spawn(executor.run()));
        }

        self.handles.push(tokio::spawn(heartbeat_loop(
            self.config.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.stats),
            self.started_at,
            self.shutdown_tx.subscribe(),
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all executors.
    ///
    /// Running tasks finish their current attempt before the executor stops.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if executors don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(worker_id = %self.config.worker_id, "Initiating worker pool shutdown");

        // Ignore send error - executors may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut self.handles);
        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Executor panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, drain).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!(worker_id = %self.config.worker_id, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.concurrency)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

async fn heartbeat_loop(
    config: WorkerPoolConfig,
    broker: Arc<dyn Broker>,
    stats: Arc<SharedPoolStats>,
    started_at: DateTime<Utc>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let hostname = hostname();
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let snapshot = stats.to_pool_stats(config.concurrency);
                let heartbeat = WorkerHeartbeat {
                    worker_id: config.worker_id.clone(),
                    hostname: hostname.clone(),
                    queues: config.queues.clone(),
                    concurrency: config.concurrency,
                    active: snapshot.active,
                    processed: snapshot.total_processed(),
                    failed: snapshot.failed,
                    started_at,
                    last_seen: Utc::now(),
                };

                match broker.record_heartbeat(&heartbeat).await {
                    Ok(()) => debug!(worker_id = %config.worker_id, "Heartbeat published"),
                    Err(e) => warn!(worker_id = %config.worker_id, error = %e, "Failed to publish heartbeat"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.visibility_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_worker_id("w1")
            .with_queues(["high", "default"])
            .with_visibility_timeout(Duration::from_secs(90))
            .with_poll_interval(Duration::from_millis(200))
            .with_shutdown_timeout(Duration::from_secs(60));

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.queues, vec!["high".to_string(), "default".to_string()]);
        assert_eq!(config.renew_interval(), Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkerPoolConfig::new(0).validate().is_err());
        assert!(WorkerPoolConfig::new(1)
            .with_queues(Vec::<String>::new())
            .validate()
            .is_err());
        assert!(WorkerPoolConfig::new(1).validate().is_ok());
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            concurrency: 4,
            active: 2,
            succeeded: 80,
            failed: 10,
            retried: 10,
            revoked: 0,
            abandoned: 1,
            average_duration: Duration::from_secs(5),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < 0.01);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::default();

        stats.record(Outcome::Succeeded);
        stats.record_duration(Duration::from_millis(100));
        stats.record(Outcome::Retried);
        stats.record_duration(Duration::from_millis(200));
        stats.record(Outcome::Abandoned);
        stats.increment_active();

        let snapshot = stats.to_pool_stats(4);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.abandoned, 1);
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.average_duration, Duration::from_millis(150));

        stats.decrement_active();
        assert_eq!(stats.to_pool_stats(4).active, 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let config = WorkerPoolConfig::new(2)
            .with_worker_id("pool-test")
            .with_poll_interval(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(5));

        let mut pool = WorkerPool::new(config, broker.clone(), store, TaskRegistry::new());
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));

        pool.start().await.unwrap();
        assert!(pool.is_running());
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let workers = broker.workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "pool-test");
        assert_eq!(workers[0].concurrency, 2);

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert_eq!(err.to_string(), "Pool is already running");

        let err = PoolError::ShutdownTimeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }
}
