//! A single executor: one lease at a time, from lease to ack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Lease};
use crate::metrics::MetricsCollector;
use crate::registry::{TaskContext, TaskError, TaskRegistry};
use crate::retry::retry_transient;
use crate::store::{ResultStore, StoreError};
use crate::task::{TaskId, TaskState, TransitionUpdate};

use super::pool::{Outcome, SharedPoolStats, WorkerPoolConfig};

/// How a status write ended.
enum Recorded {
    Applied,
    /// The record is already terminal; this delivery is a duplicate.
    AlreadyFinished(TaskState),
    /// The write kept failing; the lease is left to expire.
    Abandoned,
}

pub(super) struct Executor {
    pub(super) id: String,
    pub(super) config: WorkerPoolConfig,
    pub(super) broker: Arc<dyn Broker>,
    pub(super) store: Arc<dyn ResultStore>,
    pub(super) registry: TaskRegistry,
    pub(super) shutdown_rx: broadcast::Receiver<()>,
    pub(super) stats: Arc<SharedPoolStats>,
}

impl Executor {
    /// Main executor loop.
    ///
    /// Leases and processes tasks until a shutdown signal is received. A task
    /// already running when the signal arrives finishes first.
    pub(super) async fn run(mut self) {
        info!(worker_id = %self.id, "Executor started");
        let mut backoff = self.config.infra_backoff.clone();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Executor received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let leased = self
                .broker
                .lease(&self.config.queues, &self.id, self.config.visibility_timeout)
                .await;

            match leased {
                Ok(Some(lease)) => {
                    backoff.reset();
                    self.process(lease).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tasks available");
                    if self.idle(self.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        worker_id = %self.id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to lease task"
                    );
                    MetricsCollector::new().record_infra_error("broker");
                    if self.idle(delay).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Executor stopped");
    }

    /// Waits for `delay`. Returns true if shutdown was signalled meanwhile.
    async fn idle(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Drives one delivery to an ack, a nack, or an abandoned lease.
    pub(super) async fn process(&self, lease: Lease) {
        let task_id = lease.task.id;

        match self.broker.is_revoked(task_id).await {
            Ok(true) => {
                info!(worker_id = %self.id, task_id = %task_id, "Task revoked before start");
                let update = TransitionUpdate::revoked("revoked before start");
                self.settle(&lease, update, Outcome::Revoked, None).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to read revoke flag, running task");
            }
        }

        if !self.registry.contains(&lease.task.name) {
            let err = TaskError::UnknownTask(lease.task.name.clone());
            error!(worker_id = %self.id, task_id = %task_id, error = %err, "Cannot run task");
            let update = TransitionUpdate::failure(Some(self.id.clone()), err.to_string());
            self.settle(&lease, update, Outcome::Failed, None).await;
            return;
        }

        match self
            .record(task_id, TransitionUpdate::started(&self.id))
            .await
        {
            Recorded::Applied => {}
            Recorded::AlreadyFinished(state) => {
                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    status = %state,
                    "Task already finished, dropping duplicate delivery"
                );
                self.ack(&lease).await;
                return;
            }
            Recorded::Abandoned => {
                self.stats.record(Outcome::Abandoned);
                return;
            }
        }

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            task = %lease.task.name,
            attempt = lease.task.attempt(),
            "Processing task"
        );

        let (result, duration) = self.execute(&lease).await;

        match result {
            Ok(value) => {
                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    duration_ms = duration.as_millis() as u64,
                    "Task completed successfully"
                );
                let update = TransitionUpdate::success(&self.id, value);
                self.settle(&lease, update, Outcome::Succeeded, Some(duration))
                    .await;
            }
            Err(TaskError::Cancelled) => {
                info!(worker_id = %self.id, task_id = %task_id, "Task stopped after revoke");
                let update = TransitionUpdate::revoked("cancelled while running");
                self.settle(&lease, update, Outcome::Revoked, Some(duration))
                    .await;
            }
            Err(err) if err.is_retryable() && lease.task.can_retry() => {
                self.schedule_retry(lease, err, duration).await;
            }
            Err(err) => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    attempt = lease.task.attempt(),
                    error = %err,
                    "Task failed"
                );
                let update = TransitionUpdate::failure(Some(self.id.clone()), err.to_string());
                self.settle(&lease, update, Outcome::Failed, Some(duration))
                    .await;
            }
        }
    }

    /// Runs the handler while renewing the lease.
    async fn execute(&self, lease: &Lease) -> (Result<serde_json::Value, TaskError>, Duration) {
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new(lease.task.clone(), self.id.clone(), Arc::clone(&cancel));
        let metrics = MetricsCollector::new();

        self.stats.increment_active();
        metrics.inc_jobs_in_progress();
        let start = Instant::now();

        let execution = self.registry.execute(ctx);
        tokio::pin!(execution);

        let mut renew = tokio::time::interval(self.config.renew_interval());
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        renew.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                _ = renew.tick() => self.keep_alive(lease, &cancel).await,
            }
        };

        let duration = start.elapsed();
        self.stats.decrement_active();
        self.stats.record_duration(duration);
        metrics.dec_jobs_in_progress();

        (result, duration)
    }

    /// Extends the lease and forwards a revoke request to the handler.
    async fn keep_alive(&self, lease: &Lease, cancel: &AtomicBool) {
        match self
            .broker
            .renew(lease, self.config.visibility_timeout)
            .await
        {
            Ok(()) => debug!(worker_id = %self.id, task_id = %lease.task.id, "Lease renewed"),
            Err(BrokerError::StaleLease(_)) => warn!(
                worker_id = %self.id,
                task_id = %lease.task.id,
                "Lease lost while running, task may be redelivered"
            ),
            Err(e) => {
                warn!(worker_id = %self.id, task_id = %lease.task.id, error = %e, "Failed to renew lease");
                MetricsCollector::new().record_infra_error("broker");
            }
        }

        if cancel.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(true) = self.broker.is_revoked(lease.task.id).await {
            info!(worker_id = %self.id, task_id = %lease.task.id, "Revoke requested for running task");
            cancel.store(true, Ordering::SeqCst);
        }
    }

    async fn schedule_retry(&self, lease: Lease, err: TaskError, duration: Duration) {
        let task_id = lease.task.id;
        let delay = self.config.retry_policy.delay_for(lease.task.retry_count);

        let mut retry_lease = lease;
        retry_lease.task.retry_count += 1;
        let retries = retry_lease.task.retry_count;

        let update = TransitionUpdate::retry(&self.id, err.to_string(), retries);
        match self.record(task_id, update).await {
            Recorded::Applied => {}
            Recorded::AlreadyFinished(_) => {
                self.ack(&retry_lease).await;
                return;
            }
            Recorded::Abandoned => {
                self.stats.record(Outcome::Abandoned);
                return;
            }
        }

        warn!(
            worker_id = %self.id,
            task_id = %task_id,
            error = %err,
            retry = retries,
            max_retries = retry_lease.task.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Task failed, retry scheduled"
        );

        let nacked = retry_transient(
            "broker.nack",
            self.config.infra_attempts,
            self.config.infra_backoff.clone(),
            || self.broker.nack(&retry_lease, delay),
        )
        .await;
        if let Err(e) = nacked {
            error!(
                worker_id = %self.id,
                task_id = %task_id,
                error = %e,
                "Failed to requeue task, it is redelivered after the visibility timeout"
            );
        }

        self.stats.record(Outcome::Retried);
        let metrics = MetricsCollector::new();
        metrics.record_retry(&retry_lease.task.name);
        metrics.record_task(&retry_lease.task.name, TaskState::Retry, duration);
    }

    /// Writes a final status and acknowledges the lease.
    async fn settle(
        &self,
        lease: &Lease,
        update: TransitionUpdate,
        outcome: Outcome,
        duration: Option<Duration>,
    ) {
        let status = update.to;
        match self.record(lease.task.id, update).await {
            Recorded::Applied => {
                self.ack(lease).await;
                self.stats.record(outcome);
                MetricsCollector::new().record_task(
                    &lease.task.name,
                    status,
                    duration.unwrap_or_default(),
                );
            }
            Recorded::AlreadyFinished(_) => self.ack(lease).await,
            Recorded::Abandoned => self.stats.record(Outcome::Abandoned),
        }
    }

    async fn record(&self, task_id: TaskId, update: TransitionUpdate) -> Recorded {
        let written = retry_transient(
            "store.transition",
            self.config.infra_attempts,
            self.config.infra_backoff.clone(),
            || self.store.transition(task_id, update.clone()),
        )
        .await;

        match written {
            Ok(_) => Recorded::Applied,
            Err(StoreError::InvalidTransition(rejected)) if rejected.from.is_terminal() => {
                Recorded::AlreadyFinished(rejected.from)
            }
            Err(StoreError::NotFound(_)) => {
                // Nothing to record against; keep the task from cycling.
                error!(worker_id = %self.id, task_id = %task_id, "No result record for task");
                Recorded::AlreadyFinished(TaskState::Failure)
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    status = %update.to,
                    error = %e,
                    "Failed to record task status, abandoning lease"
                );
                MetricsCollector::new().record_infra_error("store");
                Recorded::Abandoned
            }
        }
    }

    async fn ack(&self, lease: &Lease) {
        let acked = retry_transient(
            "broker.ack",
            self.config.infra_attempts,
            self.config.infra_backoff.clone(),
            || self.broker.ack(lease),
        )
        .await;

        if let Err(e) = acked {
            // The record is final, so a redelivery is dropped as a duplicate.
            warn!(worker_id = %self.id, task_id = %lease.task.id, error = %e, "Failed to ack task");
        }
    }
}
