//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by task_forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all task_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Tasks reaching a terminal state, labeled by status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds.
pub static TASK_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Tasks currently assigned to a worker.
pub static TASKS_IN_FLIGHT: OnceLock<Gauge> = OnceLock::new();

/// Tasks waiting in the pool backlog.
pub static BACKLOG_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Live workers, labeled by state.
pub static WORKERS: OnceLock<GaugeVec> = OnceLock::new();

/// Workers torn down, labeled by reason.
pub static WORKER_RESTARTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Strategy selection attempts, labeled by strategy and outcome.
pub static STRATEGY_SELECTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Automatic strategy switches.
pub static STRATEGY_SWITCHES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Serialises concurrent `init_metrics` calls.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls keep the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("task_forge_tasks_total", "Tasks reaching a terminal state"),
        &["status"],
    )?;

    let task_duration = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "task_forge_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0]),
    )?;

    let tasks_in_flight = Gauge::new(
        "task_forge_tasks_in_flight",
        "Tasks currently assigned to a worker",
    )?;

    let backlog_depth = Gauge::new("task_forge_backlog_depth", "Tasks waiting for a worker")?;

    // Worker metrics
    let workers = GaugeVec::new(
        Opts::new("task_forge_workers", "Live workers by state"),
        &["state"],
    )?;

    let worker_restarts = CounterVec::new(
        Opts::new("task_forge_worker_restarts_total", "Workers torn down by reason"),
        &["reason"],
    )?;

    // Strategy metrics
    let strategy_selections = CounterVec::new(
        Opts::new(
            "task_forge_strategy_selections_total",
            "Strategy selection attempts",
        ),
        &["strategy", "outcome"],
    )?;

    let strategy_switches = Counter::new(
        "task_forge_strategy_switches_total",
        "Automatic strategy switches",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(tasks_in_flight.clone()))?;
    registry.register(Box::new(backlog_depth.clone()))?;
    registry.register(Box::new(workers.clone()))?;
    registry.register(Box::new(worker_restarts.clone()))?;
    registry.register(Box::new(strategy_selections.clone()))?;
    registry.register(Box::new(strategy_switches.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = TASKS_IN_FLIGHT.set(tasks_in_flight);
    let _ = BACKLOG_DEPTH.set(backlog_depth);
    let _ = WORKERS.set(workers);
    let _ = WORKER_RESTARTS_TOTAL.set(worker_restarts);
    let _ = STRATEGY_SELECTIONS_TOTAL.set(strategy_selections);
    let _ = STRATEGY_SWITCHES_TOTAL.set(strategy_switches);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics();
        let second = init_metrics();
        assert!(first.is_ok() || REGISTRY.get().is_some());
        assert!(second.is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_recording() {
        let _ = init_metrics();
        if let Some(tasks) = TASKS_TOTAL.get() {
            tasks.with_label_values(&["completed"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("task_forge_tasks_total"));
    }
}
