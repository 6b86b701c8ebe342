//! Round-robin assignment.
//!
//! Keeps a sorted, deterministic cyclic order of known workers and a
//! cursor. Each selection scans forward from the cursor (wrapping),
//! skipping unavailable and optionally busy workers, and leaves the cursor
//! one past the chosen worker.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::error::StrategyError;
use crate::scheduler::{Task, TaskOutcome, WorkerDirectory, WorkerId};

use super::{Selection, StrategyDetails, WorkerStrategy};

/// Configuration for [`RoundRobinStrategy`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoundRobinConfig {
    /// Skip workers that already run a task.
    pub skip_busy_workers: bool,
    /// Maximum positions scanned per selection.
    pub max_skip_attempts: usize,
    /// Rebuild the order whenever worker membership changes, not only the count.
    pub reset_on_worker_change: bool,
}

impl Default for RoundRobinConfig {
    fn default() -> Self {
        Self {
            skip_busy_workers: true,
            max_skip_attempts: 10,
            reset_on_worker_change: true,
        }
    }
}

/// Cyclic, fairness-preserving worker selection.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    config: RoundRobinConfig,
    order: Vec<WorkerId>,
    cursor: usize,
    completed: HashMap<WorkerId, u64>,
    skipped: u64,
}

impl RoundRobinStrategy {
    pub const NAME: &'static str = "round-robin";

    /// Creates the strategy.
    pub fn new(config: RoundRobinConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Current cyclic order.
    pub fn order(&self) -> &[WorkerId] {
        &self.order
    }

    /// Rebuilds the order if the worker set changed.
    fn sync_order(&mut self, workers: &WorkerDirectory) {
        let count_changed = workers.len() != self.order.len();
        let membership_changed = self.config.reset_on_worker_change
            && !self.order.iter().all(|id| workers.contains_key(id));

        if count_changed || membership_changed {
            // BTreeMap keys are already in sorted order
            self.order = workers.keys().cloned().collect();
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
        }
    }

    /// 1 minus the normalised variance of completed-task counts.
    pub fn fairness_index(&self) -> f64 {
        if self.order.is_empty() {
            return 1.0;
        }
        let counts: Vec<f64> = self
            .order
            .iter()
            .map(|id| self.completed.get(id).copied().unwrap_or(0) as f64)
            .collect();
        let n = counts.len() as f64;
        let mean = counts.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return 1.0;
        }
        let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
        (1.0 - variance / (mean * mean)).clamp(0.0, 1.0)
    }
}

impl WorkerStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initialize(&mut self, workers: &WorkerDirectory) {
        self.sync_order(workers);
    }

    fn select(
        &mut self,
        _task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Result<Option<Selection>, StrategyError> {
        self.sync_order(workers);
        if self.order.is_empty() {
            return Ok(None);
        }

        let available: HashSet<&WorkerId> = available.iter().collect();
        let len = self.order.len();
        let start = self.cursor % len;
        let attempts = self.config.max_skip_attempts.max(1).min(len);

        for step in 0..attempts {
            let index = (start + step) % len;
            let candidate = &self.order[index];

            let busy = self.config.skip_busy_workers
                && workers.get(candidate).map(|w| w.has_task()).unwrap_or(true);
            if !available.contains(candidate) || busy {
                self.skipped += 1;
                continue;
            }

            self.cursor = (index + 1) % len;
            return Ok(Some(Selection::preferred(candidate.clone())));
        }

        if attempts == len {
            // Full traversal without a match
            self.cursor = 0;
        } else {
            self.cursor = (start + attempts) % len;
        }
        Ok(None)
    }

    fn on_task_completed(&mut self, worker_id: &WorkerId, _task: &Task, _outcome: &TaskOutcome) {
        *self.completed.entry(worker_id.clone()).or_insert(0) += 1;
    }

    fn on_worker_removed(&mut self, worker_id: &WorkerId) {
        self.completed.remove(worker_id);
    }

    fn details(&self) -> StrategyDetails {
        StrategyDetails::RoundRobin {
            cursor: self.cursor,
            known_workers: self.order.len(),
            skipped_workers: self.skipped,
            fairness_index: self.fairness_index(),
        }
    }

    fn reset(&mut self) {
        self.order.clear();
        self.cursor = 0;
        self.completed.clear();
        self.skipped = 0;
    }
}
