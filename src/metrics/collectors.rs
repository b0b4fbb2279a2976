//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library users that never export metrics pay nothing.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, BEAT_FIRINGS, INFRA_ERRORS, JOBS_IN_PROGRESS, QUEUE_DEPTH, TASKS_TOTAL,
    TASK_DURATION, TASK_RETRIES,
};
use crate::broker::QueueStats;
use crate::task::TaskState;

/// Metrics collector for recording taskbeat operational metrics.
///
/// # Example
///
/// ```ignore
/// use taskbeat::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_task("sync.reservations", TaskState::Success, Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a task reaching `status`.
    ///
    /// Durations are observed for executed attempts only (everything except
    /// PENDING and REVOKED).
    pub fn record_task(&self, task: &str, status: TaskState, duration: Duration) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[task, status.as_str()])
                .inc();
        }

        if !matches!(status, TaskState::Pending | TaskState::Revoked) {
            if let Some(task_duration) = TASK_DURATION.get() {
                task_duration
                    .with_label_values(&[task])
                    .observe(duration.as_secs_f64());
            }
        }

        tracing::trace!(
            task = task,
            status = %status,
            duration_secs = duration.as_secs_f64(),
            "Recorded task metric"
        );
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self, task: &str) {
        if let Some(retries) = TASK_RETRIES.get() {
            retries.with_label_values(&[task]).inc();
        }
    }

    /// Record a beat firing.
    pub fn record_beat_firing(&self, entry: &str) {
        if let Some(firings) = BEAT_FIRINGS.get() {
            firings.with_label_values(&[entry]).inc();
        }
    }

    /// Record a transient infrastructure error.
    ///
    /// # Arguments
    ///
    /// * `component` - "broker", "store" or "lock"
    pub fn record_infra_error(&self, component: &str) {
        if let Some(errors) = INFRA_ERRORS.get() {
            errors.with_label_values(&[component]).inc();
        }
    }

    /// Update the depth gauges of one queue.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            for (state, depth) in [
                ("ready", stats.ready),
                ("delayed", stats.delayed),
                ("leased", stats.leased),
            ] {
                queue_depth
                    .with_label_values(&[stats.queue.as_str(), state])
                    .set(depth as f64);
            }
        }
    }

    /// Update the live worker gauge.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }

    /// Increment the in-progress gauge when a task starts executing.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs) = JOBS_IN_PROGRESS.get() {
            jobs.inc();
        }
    }

    /// Decrement the in-progress gauge when a task stops executing.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs) = JOBS_IN_PROGRESS.get() {
            jobs.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_record_task() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_task("collector_test", TaskState::Success, Duration::from_millis(20));
        collector.record_task("collector_test", TaskState::Revoked, Duration::ZERO);

        if let Some(tasks_total) = TASKS_TOTAL.get() {
            let success = tasks_total
                .with_label_values(&["collector_test", "SUCCESS"])
                .get();
            assert!(success >= 1.0);
        }
    }

    #[test]
    fn test_update_queue_depth() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth(&QueueStats {
            queue: "collector_queue".to_string(),
            ready: 7,
            delayed: 2,
            leased: 1,
        });

        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            let ready = queue_depth
                .with_label_values(&["collector_queue", "ready"])
                .get();
            assert!((ready - 7.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_counters_do_not_panic() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_retry("collector_test");
        collector.record_beat_firing("collector_entry");
        collector.record_infra_error("broker");
        collector.update_workers(3);
        collector.inc_jobs_in_progress();
        collector.dec_jobs_in_progress();
    }
}
