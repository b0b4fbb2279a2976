//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by taskbeat and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all taskbeat metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks that reached a recorded state, labeled by task name and status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by task name.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Tasks per queue, labeled by queue name and state (ready/delayed/leased).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently executing in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of workers with a recent heartbeat.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Retries scheduled, labeled by task name.
pub static TASK_RETRIES: OnceLock<CounterVec> = OnceLock::new();

/// Beat firings, labeled by schedule entry.
pub static BEAT_FIRINGS: OnceLock<CounterVec> = OnceLock::new();

/// Transient infrastructure errors, labeled by component.
pub static INFRA_ERRORS: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls return an error from the registry and
/// leave the first set of metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let tasks_total = CounterVec::new(
        Opts::new("taskbeat_tasks_total", "Tasks that reached a recorded state"),
        &["task", "status"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "taskbeat_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0, 1800.0]),
        &["task"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("taskbeat_queue_depth", "Number of tasks per queue and state"),
        &["queue", "state"],
    )?;

    let jobs_in_progress = Gauge::new(
        "taskbeat_jobs_in_progress",
        "Number of tasks currently executing",
    )?;

    let active_workers = Gauge::new("taskbeat_active_workers", "Number of live workers")?;

    let task_retries = CounterVec::new(
        Opts::new("taskbeat_task_retries_total", "Retries scheduled"),
        &["task"],
    )?;

    let beat_firings = CounterVec::new(
        Opts::new("taskbeat_beat_firings_total", "Tasks enqueued by the beat scheduler"),
        &["entry"],
    )?;

    let infra_errors = CounterVec::new(
        Opts::new(
            "taskbeat_infra_errors_total",
            "Transient infrastructure errors",
        ),
        &["component"],
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(task_retries.clone()))?;
    registry.register(Box::new(beat_firings.clone()))?;
    registry.register(Box::new(infra_errors.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = TASK_RETRIES.set(task_retries);
    let _ = BEAT_FIRINGS.set(beat_firings);
    let _ = INFRA_ERRORS.set(infra_errors);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
