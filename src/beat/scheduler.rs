//! The beat loop: leadership, firing and state persistence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Transient;
use crate::lock::{LeaseLock, DEFAULT_LOCK_TTL};
use crate::metrics::MetricsCollector;
use crate::retry::Backoff;
use crate::store::ScheduleStateStore;
use crate::task::TaskId;

use super::schedule::ScheduleTable;

/// Default interval between evaluations of the schedule table.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Lock key shared by every beat instance of a deployment.
pub const DEFAULT_LEADER_KEY: &str = "beat-leader";

/// Beat scheduler configuration.
#[derive(Debug, Clone)]
pub struct BeatConfig {
    /// Identity written into the leader lock.
    pub holder_id: String,
    pub tick_interval: Duration,
    pub lock_key: String,
    /// Must exceed `tick_interval`, the lock is renewed once per tick.
    pub lock_ttl: Duration,
    /// Delay schedule while due entries cannot be enqueued.
    pub enqueue_backoff: Backoff,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            holder_id: format!("beat-{}", uuid::Uuid::new_v4().simple()),
            tick_interval: DEFAULT_TICK_INTERVAL,
            lock_key: DEFAULT_LEADER_KEY.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            enqueue_backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }
}

impl BeatConfig {
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_enqueue_backoff(mut self, backoff: Backoff) -> Self {
        self.enqueue_backoff = backoff;
        self
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Whether this instance held leadership during the tick.
    pub leader: bool,
    /// Entries fired, with the task each produced.
    pub fired: Vec<(String, TaskId)>,
    /// Due entries left for a later tick.
    pub deferred: Vec<String>,
}

/// Cluster-wide singleton that turns schedule entries into tasks.
pub struct BeatScheduler {
    config: BeatConfig,
    table: ScheduleTable,
    dispatcher: Arc<Dispatcher>,
    lock: Arc<dyn LeaseLock>,
    state_store: Arc<dyn ScheduleStateStore>,
    is_leader: bool,
    backoff: Backoff,
    resume_at: Option<DateTime<Utc>>,
}

impl BeatScheduler {
    pub fn new(
        config: BeatConfig,
        table: ScheduleTable,
        dispatcher: Arc<Dispatcher>,
        lock: Arc<dyn LeaseLock>,
        state_store: Arc<dyn ScheduleStateStore>,
    ) -> Self {
        let backoff = config.enqueue_backoff.clone();
        Self {
            config,
            table,
            dispatcher,
            lock,
            state_store,
            is_leader: false,
            backoff,
            resume_at: None,
        }
    }

    /// The schedule table.
    pub fn table(&self) -> &ScheduleTable {
        &self.table
    }

    /// Mutable access for table management between ticks.
    pub fn table_mut(&mut self) -> &mut ScheduleTable {
        &mut self.table
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Evaluates the table once.
    ///
    /// Never fails: lock and enqueue errors are logged, and the affected
    /// work is retried on a later tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if !self.ensure_leadership().await {
            return report;
        }
        report.leader = true;

        let due = self.table.due(now);
        if let Some(resume_at) = self.resume_at {
            if now < resume_at {
                debug!(resume_at = %resume_at, due = due.len(), "Enqueue backing off");
                report.deferred = due;
                return report;
            }
        }

        let metrics = MetricsCollector::new();
        let mut pending = due.into_iter();
        while let Some(name) = pending.next() {
            let Some(entry) = self.table.get(&name).cloned() else {
                continue;
            };
            let Some(scheduled_for) = entry.next_run_at else {
                continue;
            };

            let submitted = self
                .dispatcher
                .submit(
                    &entry.task_name,
                    entry.render_args(scheduled_for),
                    entry.task_options(scheduled_for),
                )
                .await;

            match submitted {
                Ok(task_id) => {
                    self.backoff.reset();
                    self.resume_at = None;
                    self.advance(&name, scheduled_for, now).await;
                    metrics.record_beat_firing(&name);
                    info!(
                        entry = %name,
                        task = %entry.task_name,
                        task_id = %task_id,
                        scheduled_for = %scheduled_for,
                        "Beat entry fired"
                    );
                    report.fired.push((name, task_id));
                }
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.next_delay();
                    self.resume_at = Some(
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    );
                    warn!(
                        entry = %name,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to enqueue due entry, keeping slot"
                    );
                    report.deferred.push(name);
                    report.deferred.extend(pending);
                    break;
                }
                Err(e) => {
                    // Permanent rejection; retrying the slot cannot succeed.
                    error!(entry = %name, error = %e, "Beat entry rejected, skipping slot");
                    self.advance(&name, scheduled_for, now).await;
                }
            }
        }

        report
    }

    /// Runs ticks until a shutdown signal, then releases leadership.
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            holder_id = %self.config.holder_id,
            tick_ms = self.config.tick_interval.as_millis() as u64,
            entries = self.table.len(),
            "Beat scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        self.resign().await;
        info!(holder_id = %self.config.holder_id, "Beat scheduler stopped");
    }

    /// Gives up leadership if held.
    pub async fn resign(&mut self) {
        if !self.is_leader {
            return;
        }
        self.is_leader = false;
        if let Err(e) = self
            .lock
            .release(&self.config.lock_key, &self.config.holder_id)
            .await
        {
            warn!(error = %e, "Failed to release beat leadership, it expires with its TTL");
        }
    }

    async fn ensure_leadership(&mut self) -> bool {
        let key = &self.config.lock_key;
        let holder = &self.config.holder_id;

        if self.is_leader {
            match self.lock.renew(key, holder, self.config.lock_ttl).await {
                Ok(true) => return true,
                Ok(false) => {
                    warn!(holder_id = %holder, "Beat leadership lost");
                }
                Err(e) => {
                    warn!(holder_id = %holder, error = %e, "Failed to renew beat leadership, yielding");
                    MetricsCollector::new().record_infra_error("lock");
                }
            }
            self.is_leader = false;
            return false;
        }

        match self.lock.try_acquire(key, holder, self.config.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(holder_id = %holder, "Another beat instance is leader");
                return false;
            }
            Err(e) => {
                warn!(holder_id = %holder, error = %e, "Failed to acquire beat leadership");
                MetricsCollector::new().record_infra_error("lock");
                return false;
            }
        }

        // Firing without the persisted slots could repeat a slot on a
        // different grid, so leadership is only kept once they are loaded.
        match self.state_store.load_schedule_state().await {
            Ok(states) => {
                let restored = self.table.restore(&states);
                self.is_leader = true;
                info!(holder_id = %holder, restored = restored, "Acquired beat leadership");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to load schedule state, giving up leadership");
                MetricsCollector::new().record_infra_error("store");
                if let Err(e) = self.lock.release(key, holder).await {
                    warn!(error = %e, "Failed to release beat leadership");
                }
                false
            }
        }
    }

    async fn advance(&mut self, name: &str, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) {
        let Some(entry) = self.table.get_mut(name) else {
            return;
        };
        entry.advance(scheduled_for, now);

        let Some(state) = entry.state() else {
            info!(entry = %name, "Beat entry has no further occurrences");
            return;
        };

        // The firing key deduplicates the slot if this write is lost.
        if let Err(e) = self.state_store.save_schedule_state(&state).await {
            warn!(entry = %name, error = %e, "Failed to persist schedule state");
            MetricsCollector::new().record_infra_error("store");
        }
    }
}
