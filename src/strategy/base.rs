//! Shared strategy machinery.
//!
//! - `ScoreWeights` / `health_score`: the fallback fairness/health signal
//!   several strategies use
//! - `linear_slope`, `pick_highest`, `pick_lowest`, `pick_least_busy`:
//!   selection helpers
//! - `SelectionStats`: attempt/success/failure/latency accumulator
//! - `StrategyHandle`: wraps a strategy with timing, failure counting and
//!   `worker-selected` / `selection-error` / `assignment-failed` events

use std::collections::HashSet;
use std::time::{Duration, Instant};

use ordered_float::OrderedFloat;
use tracing::{debug, warn};

use crate::events::{EventBus, PoolEvent};
use crate::scheduler::{Task, TaskOutcome, WorkerDirectory, WorkerId, WorkerInfo};

use super::{StrategyMetrics, WorkerStrategy};

/// Uptime beyond this contributes no extra score.
const UPTIME_CAP_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Task counts beyond this contribute no extra score.
const TASK_COUNT_CAP: u64 = 100;

/// Weights of the shared health score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub memory: f64,
    pub uptime: f64,
    pub task_count: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: -0.5,
            memory: -0.3,
            uptime: 0.1,
            task_count: 0.1,
        }
    }
}

/// Normalised uptime in `[0, 1]`, capped at 24 hours.
pub fn normalize_uptime(uptime: Duration) -> f64 {
    (uptime.as_secs_f64() / UPTIME_CAP_SECS).min(1.0)
}

/// Logarithmic task-count normalisation in `[0, 1]`, capped at 100 tasks.
pub fn normalize_task_count(tasks: u64) -> f64 {
    let capped = tasks.min(TASK_COUNT_CAP) as f64;
    (1.0 + capped).ln() / (1.0 + TASK_COUNT_CAP as f64).ln()
}

/// Weighted health score of a worker. Higher is better.
pub fn health_score(info: &WorkerInfo, weights: &ScoreWeights, now: Instant) -> f64 {
    weights.cpu * (info.cpu / 100.0).clamp(0.0, 1.0)
        + weights.memory * info.memory.fraction()
        + weights.uptime * normalize_uptime(info.uptime(now))
        + weights.task_count * normalize_task_count(info.tasks_processed)
}

/// Least-squares slope of `values` against their index.
pub fn linear_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    let denominator = n_f * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (n_f * sum_xy - sum_x * sum_y) / denominator
}

/// Highest-scoring candidate; the first one wins ties.
pub fn pick_highest<I>(candidates: I) -> Option<(WorkerId, f64)>
where
    I: IntoIterator<Item = (WorkerId, f64)>,
{
    let mut best: Option<(WorkerId, f64)> = None;
    for (id, score) in candidates {
        match &best {
            Some((_, best_score)) if OrderedFloat(score) <= OrderedFloat(*best_score) => {}
            _ => best = Some((id, score)),
        }
    }
    best
}

/// Lowest-scoring candidate; the first one wins ties.
pub fn pick_lowest<I>(candidates: I) -> Option<(WorkerId, f64)>
where
    I: IntoIterator<Item = (WorkerId, f64)>,
{
    pick_highest(candidates.into_iter().map(|(id, score)| (id, -score)))
        .map(|(id, score)| (id, -score))
}

/// Least busy candidate by raw cpu. Equal readings go to the healthier
/// worker; the first one wins remaining ties.
pub fn pick_least_busy<'a, I>(candidates: I, now: Instant) -> Option<WorkerId>
where
    I: IntoIterator<Item = &'a WorkerInfo>,
{
    let weights = ScoreWeights::default();
    candidates
        .into_iter()
        .min_by(|a, b| {
            OrderedFloat(a.cpu).cmp(&OrderedFloat(b.cpu)).then_with(|| {
                OrderedFloat(health_score(b, &weights, now))
                    .cmp(&OrderedFloat(health_score(a, &weights, now)))
            })
        })
        .map(|info| info.id.clone())
}

/// Accumulates selection attempts for one strategy instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_time: Duration,
}

impl SelectionStats {
    /// Records a selection that produced a worker.
    pub fn record_success(&mut self, elapsed: Duration) {
        self.total += 1;
        self.successful += 1;
        self.total_time += elapsed;
    }

    /// Records a selection that produced nothing or failed.
    pub fn record_failure(&mut self, elapsed: Duration) {
        self.total += 1;
        self.failed += 1;
        self.total_time += elapsed;
    }

    /// Mean selection time in microseconds.
    pub fn average_time_us(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.total_time.as_secs_f64() * 1_000_000.0 / self.total as f64
    }
}

/// A strategy instance plus its shared bookkeeping.
pub struct StrategyHandle {
    strategy: Box<dyn WorkerStrategy>,
    stats: SelectionStats,
    events: EventBus,
}

impl StrategyHandle {
    /// Wraps a strategy.
    pub fn new(strategy: Box<dyn WorkerStrategy>, events: EventBus) -> Self {
        Self {
            strategy,
            stats: SelectionStats::default(),
            events,
        }
    }

    /// Name of the wrapped strategy.
    pub fn name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Passes the worker table to the strategy.
    pub fn initialize(&mut self, workers: &WorkerDirectory) {
        self.strategy.initialize(workers);
    }

    /// Asks the strategy for a worker.
    ///
    /// Never fails: strategy errors and empty answers are counted, turned
    /// into events, and reported as `None`.
    pub fn select_worker(
        &mut self,
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Option<WorkerId> {
        let strategy = self.strategy.name();
        let task_label = task.id_label();

        if available.is_empty() {
            self.stats.record_failure(Duration::ZERO);
            self.events.emit(PoolEvent::AssignmentFailed {
                strategy: strategy.to_string(),
                task_id: task_label,
                reason: "no available workers".to_string(),
            });
            return None;
        }

        let start = Instant::now();
        let result = self.strategy.select(task, available, workers);
        let elapsed = start.elapsed();

        match result {
            Ok(Some(selection)) => {
                let available_set: HashSet<&WorkerId> = available.iter().collect();
                if !available_set.contains(&selection.worker_id) {
                    self.stats.record_failure(elapsed);
                    warn!(
                        strategy = strategy,
                        task_id = %task_label,
                        worker_id = %selection.worker_id,
                        "Strategy selected a worker that is not available"
                    );
                    self.events.emit(PoolEvent::AssignmentFailed {
                        strategy: strategy.to_string(),
                        task_id: task_label,
                        reason: format!("worker {} is not available", selection.worker_id),
                    });
                    return None;
                }

                self.stats.record_success(elapsed);
                debug!(
                    strategy = strategy,
                    task_id = %task_label,
                    worker_id = %selection.worker_id,
                    fallback = selection.fallback,
                    "Worker selected"
                );
                self.events.emit(PoolEvent::WorkerSelected {
                    strategy: strategy.to_string(),
                    task_id: task_label,
                    worker_id: selection.worker_id.clone(),
                    duration_us: elapsed.as_micros() as u64,
                    fallback: selection.fallback,
                });
                Some(selection.worker_id)
            }
            Ok(None) => {
                self.stats.record_failure(elapsed);
                debug!(strategy = strategy, task_id = %task_label, "No suitable worker");
                self.events.emit(PoolEvent::AssignmentFailed {
                    strategy: strategy.to_string(),
                    task_id: task_label,
                    reason: "no suitable worker".to_string(),
                });
                None
            }
            Err(e) => {
                self.stats.record_failure(elapsed);
                warn!(strategy = strategy, task_id = %task_label, error = %e, "Worker selection failed");
                self.events.emit(PoolEvent::SelectionError {
                    strategy: strategy.to_string(),
                    task_id: task_label,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    pub fn on_task_completed(&mut self, worker_id: &WorkerId, task: &Task, outcome: &TaskOutcome) {
        self.strategy.on_task_completed(worker_id, task, outcome);
    }

    pub fn on_worker_added(&mut self, worker_id: &WorkerId, info: &WorkerInfo) {
        self.strategy.on_worker_added(worker_id, info);
    }

    pub fn on_worker_removed(&mut self, worker_id: &WorkerId) {
        self.strategy.on_worker_removed(worker_id);
    }

    pub fn on_worker_metrics(&mut self, worker_id: &WorkerId, info: &WorkerInfo) {
        self.strategy.on_worker_metrics(worker_id, info);
    }

    pub fn maintenance(&mut self, now: Instant) {
        self.strategy.maintenance(now);
    }

    /// Current metrics of the strategy.
    pub fn metrics(&self) -> StrategyMetrics {
        StrategyMetrics {
            name: self.strategy.name().to_string(),
            total_assignments: self.stats.total,
            successful_assignments: self.stats.successful,
            failed_assignments: self.stats.failed,
            average_assignment_time_us: self.stats.average_time_us(),
            details: self.strategy.details(),
        }
    }

    /// Clears counters and learned state.
    pub fn reset(&mut self) {
        self.stats = SelectionStats::default();
        self.strategy.reset();
    }
}
