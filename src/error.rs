//! Error taxonomy for taskbeat operations.
//!
//! Each subsystem defines its own error enum next to the code that raises it
//! (`BrokerError`, `StoreError`, `LockError`, ...). This module holds the
//! cross-cutting pieces:
//!
//! - `ValidationError`: malformed producer input, rejected before a task exists
//! - `ErrorKind`: the four engine-level failure classes
//! - `Transient`: classification used by the retry helpers
//! - `EngineError`: startup and wiring failures surfaced by the binary

use thiserror::Error;

/// Engine-level failure classes.
///
/// Infrastructure errors are retried where they occur and never become task
/// failures. Task execution errors are recorded on the result record.
/// Scheduling conflicts make the beat scheduler yield leadership. Validation
/// errors are returned synchronously to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientInfra,
    TaskExecution,
    SchedulingConflict,
    Validation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::TransientInfra => write!(f, "transient_infra"),
            ErrorKind::TaskExecution => write!(f, "task_execution"),
            ErrorKind::SchedulingConflict => write!(f, "scheduling_conflict"),
            ErrorKind::Validation => write!(f, "validation"),
        }
    }
}

/// Errors that may succeed when retried (broker or store unreachable).
pub trait Transient {
    /// Returns whether retrying the failed operation can succeed.
    fn is_transient(&self) -> bool;
}

/// Errors raised while validating a submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("Invalid {field} '{value}': only letters, digits, '_', '.', ':' and '-' are allowed")]
    InvalidName { field: &'static str, value: String },

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("eta and countdown are mutually exclusive")]
    ConflictingEta,

    #[error("max_retries {value} exceeds the limit of {limit}")]
    TooManyRetries { value: u32, limit: u32 },

    #[error("Task '{0}' is not registered")]
    UnknownTask(String),

    #[error("Invalid task id '{0}'")]
    InvalidTaskId(String),
}

/// Errors that abort engine startup or wiring.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Unsupported {component} URL '{url}'")]
    UnsupportedUrl { component: &'static str, url: String },

    #[error("Broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    #[error("Result store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] crate::beat::ScheduleError),
}

impl EngineError {
    /// Classifies the error into the engine taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Broker(e) if e.is_transient() => ErrorKind::TransientInfra,
            EngineError::Store(e) if e.is_transient() => ErrorKind::TransientInfra,
            EngineError::Lock(e) if e.is_transient() => ErrorKind::TransientInfra,
            _ => ErrorKind::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::Empty { field: "task name" };
        assert_eq!(err.to_string(), "task name must not be empty");

        let err = ValidationError::PayloadTooLarge {
            size: 2048,
            limit: 1024,
        };
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("1024"));

        let err = ValidationError::InvalidName {
            field: "queue",
            value: "bad queue".to_string(),
        };
        assert!(err.to_string().contains("bad queue"));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::TransientInfra.to_string(), "transient_infra");
        assert_eq!(ErrorKind::SchedulingConflict.to_string(), "scheduling_conflict");
    }

    #[test]
    fn test_engine_error_kind() {
        let err = EngineError::Broker(crate::broker::BrokerError::Unavailable);
        assert_eq!(err.kind(), ErrorKind::TransientInfra);

        let err = EngineError::UnsupportedUrl {
            component: "broker",
            url: "ftp://nope".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
