//! Task definitions.
//!
//! - `TaskId`: globally unique task identifier, generated at dispatch
//! - `Task`: a unit of work as it travels through the broker
//! - `TaskOptions`: producer-supplied submission options

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue used when the producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// Unique identifier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A unit of work to be executed by a worker.
///
/// Tasks are serialized as JSON onto the broker. Everything except
/// `retry_count` is fixed at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Registered handler name (e.g., "sync.reservations").
    pub name: String,
    /// Opaque argument payload: a JSON array (positional) or object (named).
    pub args: serde_json::Value,
    /// Queue the task is routed to.
    pub queue: String,
    /// When the task was handed to the broker.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest execution time, if delayed.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    /// Retries already consumed.
    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    /// Creates a task on the default queue with the default retry budget.
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            args,
            queue: DEFAULT_QUEUE.to_string(),
            enqueued_at: Utc::now(),
            eta: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
        }
    }

    /// Sets the queue name.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Sets the earliest execution time.
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns the 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Returns whether the task may be handed to a worker at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta.map_or(true, |eta| eta <= now)
    }
}

/// Submission options supplied by a producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Absolute earliest execution time.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    /// Relative delay before the task becomes visible.
    #[serde(default, with = "duration_secs_opt")]
    pub countdown: Option<Duration>,
    /// Caller-supplied deduplication token.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Retry budget override.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Queue override.
    #[serde(default)]
    pub queue: Option<String>,
}

impl TaskOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the absolute eta.
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Sets a relative countdown.
    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = Some(countdown);
        self
    }

    /// Sets the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the target queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

mod duration_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        secs.map(|s| {
            Duration::try_from_secs_f64(s).map_err(|e| serde::de::Error::custom(e.to_string()))
        })
        .transpose()
    }
}
