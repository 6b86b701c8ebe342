//! High-level metric recording for the worker pool.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so the coordinator
//! records pool activity with consistent labels. Every method is a no-op
//! until `init_metrics()` has been called.

use std::time::Duration;

use super::prometheus::{
    BACKLOG_DEPTH, STRATEGY_SELECTIONS_TOTAL, STRATEGY_SWITCHES_TOTAL, TASKS_IN_FLIGHT,
    TASKS_TOTAL, TASK_DURATION, WORKERS, WORKER_RESTARTS_TOTAL,
};
use crate::scheduler::{TaskStatus, WorkerState};

/// Per-state worker counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    pub initializing: usize,
    pub available: usize,
    pub busy: usize,
    pub stopping: usize,
}

impl WorkerCounts {
    /// Counts workers by state.
    pub fn tally<'a>(states: impl IntoIterator<Item = &'a WorkerState>) -> Self {
        let mut counts = Self::default();
        for state in states {
            match state {
                WorkerState::Initializing => counts.initializing += 1,
                WorkerState::Available => counts.available += 1,
                WorkerState::Busy => counts.busy += 1,
                WorkerState::Stopping => counts.stopping += 1,
            }
        }
        counts
    }

    /// Total number of workers.
    pub fn total(&self) -> usize {
        self.initializing + self.available + self.busy + self.stopping
    }
}

/// Metrics collector for recording pool operational metrics.
///
/// # Example
///
/// ```ignore
/// use task_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_task(TaskStatus::Completed, Duration::from_millis(120));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a task reaching a terminal state.
    pub fn record_task(&self, status: TaskStatus, duration: Duration) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[status.as_str()]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration.observe(duration.as_secs_f64());
        }

        tracing::trace!(
            status = status.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Recorded task metric"
        );
    }

    /// Update the number of tasks assigned to workers.
    pub fn set_in_flight(&self, count: usize) {
        if let Some(gauge) = TASKS_IN_FLIGHT.get() {
            gauge.set(count as f64);
        }
    }

    /// Update the backlog depth.
    pub fn set_backlog(&self, depth: usize) {
        if let Some(gauge) = BACKLOG_DEPTH.get() {
            gauge.set(depth as f64);
        }
    }

    /// Update the worker gauges.
    pub fn set_workers(&self, counts: WorkerCounts) {
        if let Some(workers) = WORKERS.get() {
            for (state, value) in [
                (WorkerState::Initializing, counts.initializing),
                (WorkerState::Available, counts.available),
                (WorkerState::Busy, counts.busy),
                (WorkerState::Stopping, counts.stopping),
            ] {
                workers.with_label_values(&[state.as_str()]).set(value as f64);
            }
        }
    }

    /// Record a worker teardown.
    pub fn record_worker_restart(&self, reason: &str) {
        if let Some(restarts) = WORKER_RESTARTS_TOTAL.get() {
            restarts.with_label_values(&[reason]).inc();
        }

        tracing::trace!(reason = reason, "Recorded worker restart metric");
    }

    /// Record a strategy selection attempt.
    pub fn record_selection(&self, strategy: &str, selected: bool) {
        let outcome = if selected { "selected" } else { "none" };
        if let Some(selections) = STRATEGY_SELECTIONS_TOTAL.get() {
            selections.with_label_values(&[strategy, outcome]).inc();
        }
    }

    /// Record an automatic strategy switch.
    pub fn record_strategy_switch(&self) {
        if let Some(switches) = STRATEGY_SWITCHES_TOTAL.get() {
            switches.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_worker_counts_tally() {
        let states = [
            WorkerState::Available,
            WorkerState::Busy,
            WorkerState::Available,
            WorkerState::Stopping,
        ];
        let counts = WorkerCounts::tally(states.iter());
        assert_eq!(counts.available, 2);
        assert_eq!(counts.busy, 1);
        assert_eq!(counts.stopping, 1);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_collector_without_init_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_task(TaskStatus::Failed, Duration::from_millis(3));
        collector.set_backlog(2);
        collector.record_worker_restart("crash");
    }

    #[test]
    fn test_collector_records_labels() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        collector.record_task(TaskStatus::TimedOut, Duration::from_secs(1));
        collector.record_selection("round-robin", true);
        collector.set_workers(WorkerCounts {
            available: 2,
            ..WorkerCounts::default()
        });

        let output = export_metrics();
        assert!(output.contains("status=\"timed-out\""));
        assert!(output.contains("strategy=\"round-robin\""));
        assert!(output.contains("task_forge_workers"));
    }
}
