//! Engine configuration.
//!
//! Values come from `TASKBEAT_*` environment variables on top of defaults
//! suitable for a local Redis and Postgres. The CLI layers its own flags on
//! top of the result through the builder methods.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

use crate::lock::DEFAULT_LOCK_TTL;
use crate::retry::RetryPolicy;

/// First day synchronised when the sync log is empty.
pub const DEFAULT_SYNC_START: (i32, u32, u32) = (2022, 1, 29);

/// Snapshot replayed by `sync.events`, relative to the working directory.
pub const DEFAULT_EVENTS_SNAPSHOT: &str = "snapshot_data.csv";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings shared by every engine role.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    // Backends
    pub broker_url: String,
    pub result_store_url: String,
    /// Prefix of every Redis key.
    pub namespace: String,

    // Workers
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub visibility_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,

    // Beat
    pub beat_tick: Duration,
    pub lock_ttl: Duration,

    // Sync tasks
    pub datasource_url: Option<String>,
    pub destination_url: Option<String>,
    pub sync_start: NaiveDate,
    pub http_timeout: Duration,
    pub events_snapshot: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let (y, m, d) = DEFAULT_SYNC_START;
        Self {
            broker_url: "redis://localhost:6379".to_string(),
            result_store_url: "postgres://localhost/taskbeat".to_string(),
            namespace: "taskbeat".to_string(),
            concurrency: 4,
            queues: vec!["default".to_string()],
            visibility_timeout: Duration::from_secs(30),
            retry_base: Duration::from_millis(1000),
            retry_max: Duration::from_millis(300_000),
            beat_tick: Duration::from_secs(5),
            lock_ttl: DEFAULT_LOCK_TTL,
            datasource_url: None,
            destination_url: None,
            sync_start: NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default(),
            http_timeout: Duration::from_secs(30),
            events_snapshot: PathBuf::from(DEFAULT_EVENTS_SNAPSHOT),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment.
    ///
    /// Recognised variables:
    /// - `TASKBEAT_BROKER_URL` (default: redis://localhost:6379)
    /// - `TASKBEAT_RESULT_STORE_URL`, falling back to `DATABASE_URL`
    /// - `TASKBEAT_NAMESPACE` (default: taskbeat)
    /// - `TASKBEAT_CONCURRENCY` (default: 4)
    /// - `TASKBEAT_QUEUES`: comma-separated (default: default)
    /// - `TASKBEAT_VISIBILITY_TIMEOUT_SECS` (default: 30)
    /// - `TASKBEAT_RETRY_BASE_MS`, `TASKBEAT_RETRY_MAX_MS` (default: 1000 / 300000)
    /// - `TASKBEAT_BEAT_TICK_SECS` (default: 5)
    /// - `TASKBEAT_LOCK_TTL_SECS` (default: 30)
    /// - `TASKBEAT_DATASOURCE_URL`, `TASKBEAT_DESTINATION_URL`
    /// - `TASKBEAT_SYNC_START_DATE`: YYYY-MM-DD (default: 2022-01-29)
    /// - `TASKBEAT_HTTP_TIMEOUT_SECS` (default: 30)
    /// - `TASKBEAT_EVENTS_SNAPSHOT` (default: snapshot_data.csv)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("TASKBEAT_BROKER_URL") {
            config.broker_url = val;
        }
        if let Some(val) = lookup("TASKBEAT_RESULT_STORE_URL").or_else(|| lookup("DATABASE_URL")) {
            config.result_store_url = val;
        }
        if let Some(val) = lookup("TASKBEAT_NAMESPACE") {
            config.namespace = val;
        }

        if let Some(val) = lookup("TASKBEAT_CONCURRENCY") {
            config.concurrency = parse_env_value(&val, "TASKBEAT_CONCURRENCY")?;
        }
        if let Some(val) = lookup("TASKBEAT_QUEUES") {
            config.queues = parse_list(&val);
        }
        if let Some(val) = lookup("TASKBEAT_VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKBEAT_VISIBILITY_TIMEOUT_SECS")?;
            config.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("TASKBEAT_RETRY_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "TASKBEAT_RETRY_BASE_MS")?;
            config.retry_base = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("TASKBEAT_RETRY_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "TASKBEAT_RETRY_MAX_MS")?;
            config.retry_max = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("TASKBEAT_BEAT_TICK_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKBEAT_BEAT_TICK_SECS")?;
            config.beat_tick = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("TASKBEAT_LOCK_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKBEAT_LOCK_TTL_SECS")?;
            config.lock_ttl = Duration::from_secs(secs);
        }

        config.datasource_url = lookup("TASKBEAT_DATASOURCE_URL").filter(|v| !v.is_empty());
        config.destination_url = lookup("TASKBEAT_DESTINATION_URL").filter(|v| !v.is_empty());
        if let Some(val) = lookup("TASKBEAT_SYNC_START_DATE") {
            config.sync_start = parse_env_value(&val, "TASKBEAT_SYNC_START_DATE")?;
        }
        if let Some(val) = lookup("TASKBEAT_HTTP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKBEAT_HTTP_TIMEOUT_SECS")?;
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("TASKBEAT_EVENTS_SNAPSHOT").filter(|v| !v.is_empty()) {
            config.events_snapshot = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "broker_url cannot be empty".to_string(),
            ));
        }
        if self.result_store_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "result_store_url cannot be empty".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one queue is required".to_string(),
            ));
        }
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "visibility_timeout must be greater than 0".to_string(),
            ));
        }
        if self.retry_base > self.retry_max {
            return Err(ConfigError::ValidationFailed(format!(
                "retry_base ({:?}) cannot exceed retry_max ({:?})",
                self.retry_base, self.retry_max
            )));
        }
        if self.beat_tick.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "beat_tick must be greater than 0".to_string(),
            ));
        }
        // The leader renews once per tick.
        if self.lock_ttl <= self.beat_tick {
            return Err(ConfigError::ValidationFailed(format!(
                "lock_ttl ({:?}) must be longer than beat_tick ({:?})",
                self.lock_ttl, self.beat_tick
            )));
        }
        Ok(())
    }

    /// Retry policy for failed task attempts.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base, self.retry_max)
    }

    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    pub fn with_result_store_url(mut self, url: impl Into<String>) -> Self {
        self.result_store_url = url.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
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

    pub fn with_beat_tick(mut self, tick: Duration) -> Self {
        self.beat_tick = tick;
        self
    }
}

/// Parse an environment variable value into a type.
pub fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
