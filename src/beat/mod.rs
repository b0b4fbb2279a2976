//! Beat scheduler: fires recurring tasks from an owned schedule table.
//!
//! Only the holder of the leader lock enqueues. Each firing is submitted
//! through the [`Dispatcher`](crate::dispatcher::Dispatcher) with an
//! idempotency key derived from the entry and the slot, and the entry only
//! advances once the submit succeeded.
//!
//! ```text
//!  tick ──► leader? ──no──► try_acquire ──fail──► idle
//!             │ yes             │ ok
//!             ▼                 ▼
//!           renew          reload state
//!             │                 │
//!             └───────┬─────────┘
//!                     ▼
//!           for each due entry: submit ──ok──► advance + persist
//!                                   └─transient──► back off, keep slot
//! ```

pub mod schedule;
pub mod scheduler;

use thiserror::Error;

use crate::error::ValidationError;

pub use self::schedule::{
    firing_key, CronTrigger, EntrySpec, ScheduleEntry, ScheduleFile, ScheduleTable, Trigger,
};
pub use self::scheduler::{BeatConfig, BeatScheduler, TickReport};

/// Errors raised while building or editing a schedule table.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}' for entry '{entry}': {reason}")]
    InvalidCron {
        entry: String,
        expression: String,
        reason: String,
    },

    #[error("Interval of entry '{0}' must be positive")]
    InvalidInterval(String),

    #[error("Entry '{0}' must set exactly one of 'cron' and 'interval_secs'")]
    AmbiguousTrigger(String),

    #[error("Duplicate schedule entry '{0}'")]
    DuplicateEntry(String),

    #[error("No schedule entry named '{0}'")]
    UnknownEntry(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to read schedule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid schedule file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
