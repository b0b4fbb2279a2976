//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use taskbeat::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_retry("sync.reservations");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, BEAT_FIRINGS, INFRA_ERRORS, JOBS_IN_PROGRESS, QUEUE_DEPTH, REGISTRY,
    TASKS_TOTAL, TASK_DURATION, TASK_RETRIES,
};
