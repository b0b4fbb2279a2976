//! Dispatcher: the producer-facing entry point.
//!
//! `submit` assigns a task id, writes the PENDING record and hands the task
//! to the broker. The record is written first so a task visible to workers
//! always has a record to transition.
//!
//! # Idempotency
//!
//! Producers may attach an idempotency key. Keys are stored as SHA-256 hex
//! digests; a repeated key returns the id of the first task and writes
//! nothing.
//!
//! A repeated key whose task never reached the broker is pushed again, but
//! only when this dispatcher gave up on that push itself or the record is
//! older than the stranded grace. A younger record may belong to a submit
//! that is still between its broker push and `mark_enqueued`.
//!
//! # Broker outages
//!
//! The push is retried with exponential backoff. If the broker stays down,
//! `submit` fails with a transient error and the record stays PENDING but
//! un-enqueued; [`Dispatcher::redrive_unenqueued`] pushes such tasks once the
//! broker is back.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::broker::{Broker, BrokerError};
use crate::error::{ErrorKind, Transient, ValidationError};
use crate::retry::{retry_transient, Backoff};
use crate::store::{CreateOutcome, ResultStore, StoreError};
use crate::task::{
    ResultRecord, Task, TaskId, TaskOptions, TaskState, TransitionUpdate, DEFAULT_QUEUE,
    MAX_RETRIES_LIMIT,
};

/// Largest accepted serialized argument payload.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Records younger than this are left alone by the redrive, the submit that
/// created them may still be pushing.
pub const DEFAULT_REDRIVE_GRACE: Duration = Duration::from_secs(60);

const REDRIVE_BATCH: usize = 100;

/// Errors returned to producers.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("No task with id {0}")]
    NotFound(TaskId),
}

impl DispatchError {
    /// Classifies the error into the engine taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) | DispatchError::NotFound(_) => ErrorKind::Validation,
            DispatchError::Store(e) if e.is_transient() => ErrorKind::TransientInfra,
            DispatchError::Broker(e) if e.is_transient() => ErrorKind::TransientInfra,
            DispatchError::Store(_) | DispatchError::Broker(_) => ErrorKind::TaskExecution,
        }
    }
}

impl Transient for DispatchError {
    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientInfra
    }
}

/// What a revoke request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// The task was marked REVOKED and will never start.
    Revoked,
    /// The task is running; its worker was asked to stop.
    SignalledRunning,
    /// The task had already finished.
    AlreadyFinished(TaskState),
}

/// Producer API over a broker and a result store.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    known_tasks: Option<HashSet<String>>,
    push_attempts: u32,
    push_backoff: Backoff,
    stranded_grace: Duration,
    /// Tasks whose push this dispatcher gave up on.
    abandoned: Mutex<HashSet<TaskId>>,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            broker,
            store,
            known_tasks: None,
            push_attempts: 5,
            push_backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
            stranded_grace: DEFAULT_REDRIVE_GRACE,
            abandoned: Mutex::new(HashSet::new()),
        }
    }

    /// Rejects submissions of names outside `names`.
    pub fn with_known_tasks<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_tasks = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Overrides how hard broker and store writes are retried.
    pub fn with_push_retry(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.push_attempts = attempts.max(1);
        self.push_backoff = backoff;
        self
    }

    /// Age after which a keyed, un-enqueued record is re-pushed by any
    /// dispatcher that sees its key again.
    pub fn with_stranded_grace(mut self, grace: Duration) -> Self {
        self.stranded_grace = grace;
        self
    }

    /// Submits a task and returns its id.
    ///
    /// # Errors
    ///
    /// - `Validation` for malformed input, nothing is written
    /// - `Store` / `Broker` when infrastructure stays unreachable
    pub async fn submit(
        &self,
        name: &str,
        args: Value,
        options: TaskOptions,
    ) -> Result<TaskId, DispatchError> {
        let task = self.build_task(name, args, &options)?;
        let key_hash = options.idempotency_key.as_deref().map(hash_idempotency_key);

        let outcome = retry_transient(
            "store.create_pending",
            self.push_attempts,
            self.push_backoff.clone(),
            || self.store.create_pending(&task, key_hash.as_deref()),
        )
        .await?;

        match outcome {
            CreateOutcome::Created(_) => {}
            CreateOutcome::Duplicate(existing) => {
                tracing::info!(
                    task_id = %existing,
                    task = %name,
                    "Idempotency key already used, returning existing task"
                );
                return Ok(existing);
            }
            CreateOutcome::Stranded(existing) => {
                if !self.is_stranded(&existing).await {
                    tracing::info!(
                        task_id = %existing.id,
                        task = %name,
                        "Idempotency key in use by a submit still enqueueing"
                    );
                    return Ok(existing.id);
                }
                tracing::info!(task_id = %existing.id, task = %name, "Re-enqueueing stranded task");
                self.enqueue(&existing).await?;
                return Ok(existing.id);
            }
        }

        self.enqueue(&task).await?;

        tracing::info!(
            task_id = %task.id,
            task = %task.name,
            queue = %task.queue,
            eta = ?task.eta,
            "Task submitted"
        );
        Ok(task.id)
    }

    /// Revokes a task.
    ///
    /// PENDING and RETRY tasks become REVOKED and are dropped from the
    /// broker. Running tasks get the cooperative revoke flag. Finished tasks
    /// are left untouched.
    pub async fn revoke(&self, task_id: TaskId) -> Result<RevokeOutcome, DispatchError> {
        let record = self
            .store
            .get(task_id)
            .await?
            .ok_or(DispatchError::NotFound(task_id))?;

        if record.status.is_terminal() {
            return Ok(RevokeOutcome::AlreadyFinished(record.status));
        }

        if record.status.is_revocable() {
            match self
                .store
                .transition(task_id, TransitionUpdate::revoked("revoked by producer"))
                .await
            {
                Ok(_) => {
                    // The record is final; a copy left in the broker is
                    // skipped by the worker that leases it.
                    if let Err(e) = self.broker.revoke(&record.queue, task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "Failed to drop revoked task from broker");
                    }
                    tracing::info!(task_id = %task_id, "Task revoked");
                    return Ok(RevokeOutcome::Revoked);
                }
                Err(StoreError::InvalidTransition(rejected)) => {
                    // A worker started it in the meantime.
                    if rejected.from.is_terminal() {
                        return Ok(RevokeOutcome::AlreadyFinished(rejected.from));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.broker.revoke(&record.queue, task_id).await?;
        tracing::info!(task_id = %task_id, "Revoke signalled to running task");
        Ok(RevokeOutcome::SignalledRunning)
    }

    /// Returns the current record of a task.
    pub async fn get_status(&self, task_id: TaskId) -> Result<ResultRecord, DispatchError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(DispatchError::NotFound(task_id))
    }

    /// Pushes PENDING tasks whose submit failed to reach the broker.
    ///
    /// Returns the number of tasks pushed.
    pub async fn redrive_unenqueued(&self, grace: Duration) -> Result<usize, DispatchError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stranded = self.store.unenqueued(cutoff, REDRIVE_BATCH).await?;

        let mut pushed = 0;
        for task in stranded {
            self.enqueue(&task).await?;
            tracing::info!(task_id = %task.id, queue = %task.queue, "Redrove un-enqueued task");
            pushed += 1;
        }
        Ok(pushed)
    }

    async fn is_stranded(&self, task: &Task) -> bool {
        if self.abandoned.lock().await.contains(&task.id) {
            return true;
        }
        let grace = chrono::Duration::from_std(self.stranded_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Utc::now() - task.enqueued_at >= grace
    }

    async fn enqueue(&self, task: &Task) -> Result<(), DispatchError> {
        let pushed = retry_transient(
            "broker.push",
            self.push_attempts,
            self.push_backoff.clone(),
            || self.broker.push(task),
        )
        .await;

        if let Err(e) = pushed {
            tracing::warn!(
                task_id = %task.id,
                error = %e,
                "Broker push failed, task left un-enqueued"
            );
            self.abandoned.lock().await.insert(task.id);
            return Err(e.into());
        }
        self.abandoned.lock().await.remove(&task.id);

        if let Err(e) = self.store.mark_enqueued(task.id).await {
            // The task is in the broker; a later redrive push is ignored
            // while it stays queued or leased.
            tracing::warn!(task_id = %task.id, error = %e, "Failed to mark task enqueued");
        }
        Ok(())
    }

    fn build_task(
        &self,
        name: &str,
        args: Value,
        options: &TaskOptions,
    ) -> Result<Task, ValidationError> {
        validate_name("task name", name)?;
        if let Some(known) = &self.known_tasks {
            if !known.contains(name) {
                return Err(ValidationError::UnknownTask(name.to_string()));
            }
        }

        let queue = options.queue.as_deref().unwrap_or(DEFAULT_QUEUE);
        validate_name("queue", queue)?;

        if !(args.is_array() || args.is_object()) {
            return Err(ValidationError::InvalidArguments(
                "arguments must be a JSON array or object".to_string(),
            ));
        }
        let size = serde_json::to_vec(&args)
            .map_err(|e| ValidationError::InvalidArguments(e.to_string()))?
            .len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge {
                size,
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let mut task = Task::new(name, args).with_queue(queue);

        if let Some(max_retries) = options.max_retries {
            if max_retries > MAX_RETRIES_LIMIT {
                return Err(ValidationError::TooManyRetries {
                    value: max_retries,
                    limit: MAX_RETRIES_LIMIT,
                });
            }
            task = task.with_max_retries(max_retries);
        }

        match (options.eta, options.countdown) {
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingEta),
            (Some(eta), None) => task = task.with_eta(eta),
            (None, Some(countdown)) => {
                let countdown = chrono::Duration::from_std(countdown).map_err(|_| {
                    ValidationError::InvalidArguments("countdown out of range".to_string())
                })?;
                let eta = task.enqueued_at + countdown;
                task = task.with_eta(eta);
            }
            (None, None) => {}
        }

        Ok(task)
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("Invalid regex for names"))
}

/// Checks a task or queue name.
pub fn validate_name(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if !name_pattern().is_match(value) {
        return Err(ValidationError::InvalidName {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Returns the stored form of an idempotency key.
pub fn hash_idempotency_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(2))
    }

    fn setup() -> (Arc<MemoryBroker>, Arc<MemoryStore>, Dispatcher) {
        let broker = Arc::new(MemoryBroker::new());
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(broker.clone(), store.clone())
            .with_push_retry(3, fast_backoff());
        (broker, store, dispatcher)
    }

    #[tokio::test]
    async fn test_submit_writes_pending_and_enqueues() {
        let (broker, _store, dispatcher) = setup();

        let id = dispatcher
            .submit("sync_region", json!({"region": "A"}), TaskOptions::new())
            .await
            .expect("submit");

        let record = dispatcher.get_status(id).await.expect("status");
        assert_eq!(record.status, TaskState::Pending);
        assert_eq!(record.queue, DEFAULT_QUEUE);
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 1);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (_broker, _store, dispatcher) = setup();

        let cases: Vec<(&str, Value, TaskOptions)> = vec![
            ("", json!([]), TaskOptions::new()),
            ("bad name", json!([]), TaskOptions::new()),
            ("ok", json!("scalar"), TaskOptions::new()),
            ("ok", json!([]), TaskOptions::new().with_queue("no spaces")),
            ("ok", json!([]), TaskOptions::new().with_max_retries(101)),
            (
                "ok",
                json!([]),
                TaskOptions::new()
                    .with_eta(Utc::now())
                    .with_countdown(Duration::from_secs(1)),
            ),
        ];

        for (name, args, options) in cases {
            let err = dispatcher
                .submit(name, args, options)
                .await
                .expect_err("invalid submission");
            assert!(matches!(err, DispatchError::Validation(_)), "{:?}", err);
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn test_payload_limit() {
        let (_broker, _store, dispatcher) = setup();
        let big = "x".repeat(MAX_PAYLOAD_BYTES);

        let err = dispatcher
            .submit("t", json!([big]), TaskOptions::new())
            .await
            .expect_err("too large");
        assert!(matches!(
            err,
            DispatchError::Validation(ValidationError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_known_tasks() {
        let (broker, store, _) = setup();
        let dispatcher = Dispatcher::new(broker, store).with_known_tasks(["sync_region"]);

        let err = dispatcher
            .submit("other", json!([]), TaskOptions::new())
            .await
            .expect_err("unknown");
        assert!(matches!(
            err,
            DispatchError::Validation(ValidationError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_idempotent_submit() {
        let (broker, _store, dispatcher) = setup();
        let options = TaskOptions::new().with_idempotency_key("order-42");

        let first = dispatcher
            .submit("t", json!([]), options.clone())
            .await
            .expect("first");
        let second = dispatcher
            .submit("t", json!([]), options)
            .await
            .expect("second");

        assert_eq!(first, second);
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 1);
    }

    #[tokio::test]
    async fn test_countdown_sets_eta() {
        let (broker, _store, dispatcher) = setup();

        dispatcher
            .submit(
                "t",
                json!([]),
                TaskOptions::new().with_countdown(Duration::from_secs(60)),
            )
            .await
            .expect("submit");

        let stats = broker.stats(DEFAULT_QUEUE).await.expect("stats");
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_broker_outage_then_redrive() {
        let (broker, store, dispatcher) = setup();
        broker.set_available(false);

        let err = dispatcher
            .submit("t", json!([]), TaskOptions::new())
            .await
            .expect_err("broker down");
        assert_eq!(err.kind(), ErrorKind::TransientInfra);

        let stranded = store.unenqueued(Utc::now(), 10).await.expect("query");
        assert_eq!(stranded.len(), 1);

        broker.set_available(true);
        let pushed = dispatcher
            .redrive_unenqueued(Duration::ZERO)
            .await
            .expect("redrive");
        assert_eq!(pushed, 1);
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 1);
        assert!(store.unenqueued(Utc::now(), 10).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_resubmit_with_key_pushes_stranded_task() {
        let (broker, _store, dispatcher) = setup();
        let options = TaskOptions::new().with_idempotency_key("beat:nightly:1700000000000");

        broker.set_available(false);
        dispatcher
            .submit("t", json!([]), options.clone())
            .await
            .expect_err("broker down");

        broker.set_available(true);
        let id = dispatcher
            .submit("t", json!([]), options.clone())
            .await
            .expect("resubmit");
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 1);

        let again = dispatcher
            .submit("t", json!([]), options)
            .await
            .expect("third submit");
        assert_eq!(again, id);
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 1);
    }

    #[tokio::test]
    async fn test_key_reused_while_first_submit_is_enqueueing() {
        let (broker, store, dispatcher) = setup();
        let key = "report-2024-03-01";

        // Another producer wrote the record and pushed, but has not marked
        // the task enqueued yet.
        let task = Task::new("t", json!([]));
        store
            .create_pending(&task, Some(hash_idempotency_key(key).as_str()))
            .await
            .expect("create");
        broker.push(&task).await.expect("push");

        let id = dispatcher
            .submit("t", json!([]), TaskOptions::new().with_idempotency_key(key))
            .await
            .expect("submit");
        assert_eq!(id, task.id);
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 1);

        let queues = vec![DEFAULT_QUEUE.to_string()];
        let lease = broker
            .lease(&queues, "w1", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        assert_eq!(lease.task.id, task.id);
        assert!(broker
            .lease(&queues, "w2", Duration::from_secs(30))
            .await
            .expect("lease")
            .is_none());
    }

    #[tokio::test]
    async fn test_old_stranded_record_from_another_producer_is_pushed() {
        let (broker, store, _) = setup();
        let dispatcher = Dispatcher::new(broker.clone(), store.clone())
            .with_push_retry(3, fast_backoff())
            .with_stranded_grace(Duration::ZERO);
        let key = "report-2024-03-02";

        let task = Task::new("t", json!([]));
        store
            .create_pending(&task, Some(hash_idempotency_key(key).as_str()))
            .await
            .expect("create");

        let id = dispatcher
            .submit("t", json!([]), TaskOptions::new().with_idempotency_key(key))
            .await
            .expect("submit");
        assert_eq!(id, task.id);
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 1);
        assert!(store.unenqueued(Utc::now(), 10).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_revoke_pending() {
        let (broker, _store, dispatcher) = setup();
        let id = dispatcher
            .submit("t", json!([]), TaskOptions::new())
            .await
            .expect("submit");

        let outcome = dispatcher.revoke(id).await.expect("revoke");
        assert_eq!(outcome, RevokeOutcome::Revoked);
        assert_eq!(
            dispatcher.get_status(id).await.expect("status").status,
            TaskState::Revoked
        );
        assert_eq!(broker.stats(DEFAULT_QUEUE).await.expect("stats").ready, 0);

        let again = dispatcher.revoke(id).await.expect("revoke twice");
        assert_eq!(again, RevokeOutcome::AlreadyFinished(TaskState::Revoked));
    }

    #[tokio::test]
    async fn test_revoke_running_raises_flag() {
        let (broker, store, dispatcher) = setup();
        let id = dispatcher
            .submit("t", json!([]), TaskOptions::new())
            .await
            .expect("submit");
        broker
            .lease(&[DEFAULT_QUEUE.to_string()], "w", Duration::from_secs(30))
            .await
            .expect("lease")
            .expect("task");
        store
            .transition(id, TransitionUpdate::started("w"))
            .await
            .expect("start");

        let outcome = dispatcher.revoke(id).await.expect("revoke");
        assert_eq!(outcome, RevokeOutcome::SignalledRunning);
        assert!(broker.is_revoked(id).await.expect("flag"));
    }

    #[tokio::test]
    async fn test_revoke_unknown() {
        let (_broker, _store, dispatcher) = setup();
        let err = dispatcher.revoke(TaskId::new()).await.expect_err("missing");
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[test]
    fn test_hash_idempotency_key() {
        let hash = hash_idempotency_key("order-42");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_idempotency_key("order-42"));
        assert_ne!(hash, hash_idempotency_key("order-43"));
    }
}
