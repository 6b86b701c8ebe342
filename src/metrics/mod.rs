//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for the worker pool:
//! task outcomes and durations, backlog depth, worker counts and restarts,
//! and strategy selections.
//!
//! # Example
//!
//! ```ignore
//! use task_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use collectors::{MetricsCollector, WorkerCounts};
pub use prometheus::{export_metrics, init_metrics};

// Re-export metric constants for direct access when needed
pub use prometheus::{
    BACKLOG_DEPTH, REGISTRY, STRATEGY_SELECTIONS_TOTAL, STRATEGY_SWITCHES_TOTAL, TASKS_IN_FLIGHT,
    TASKS_TOTAL, TASK_DURATION, WORKERS, WORKER_RESTARTS_TOTAL,
};
