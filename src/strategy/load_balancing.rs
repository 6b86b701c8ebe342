//! Least-loaded assignment.
//!
//! Each candidate gets a composite load score from cpu, memory and
//! whether it holds a task, plus a penalty when its recent load is
//! trending upwards. The lowest score wins.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::StrategyError;
use crate::scheduler::{Task, WorkerDirectory, WorkerId, WorkerInfo};

use super::base::{linear_slope, pick_lowest};
use super::{Selection, StrategyDetails, WorkerStrategy};

/// Configuration for [`LoadBalancingStrategy`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancingConfig {
    /// Workers above this cpu percent are never selected.
    pub max_cpu_threshold: f64,
    /// Workers above this memory fraction are never selected.
    pub max_memory_threshold: f64,
    pub cpu_weight: f64,
    pub memory_weight: f64,
    pub task_weight: f64,
    /// Multiplier applied to a rising load trend.
    pub trend_weight: f64,
    /// Samples kept per worker for trend estimation.
    pub load_history_size: usize,
    /// Samples older than this are purged during maintenance.
    #[serde(with = "crate::scheduler::config::duration_ms")]
    pub history_retention: Duration,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            max_cpu_threshold: 80.0,
            max_memory_threshold: 0.8,
            cpu_weight: 0.4,
            memory_weight: 0.3,
            task_weight: 0.3,
            trend_weight: 0.1,
            load_history_size: 10,
            history_retention: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadSample {
    at: Instant,
    score: f64,
}

/// Picks the worker with the lowest composite load.
#[derive(Debug, Default)]
pub struct LoadBalancingStrategy {
    config: LoadBalancingConfig,
    history: HashMap<WorkerId, VecDeque<LoadSample>>,
    selected_load_total: f64,
    selections: u64,
    overloaded_rejections: u64,
}

impl LoadBalancingStrategy {
    pub const NAME: &'static str = "load-balancing";

    /// Creates the strategy.
    pub fn new(config: LoadBalancingConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Load score without the trend adjustment.
    pub fn base_load(&self, info: &WorkerInfo) -> f64 {
        let busy = if info.has_task() { 1.0 } else { 0.0 };
        self.config.cpu_weight * (info.cpu / 100.0).clamp(0.0, 1.0)
            + self.config.memory_weight * info.memory.fraction()
            + self.config.task_weight * busy
    }

    /// Load score including the rising-trend penalty.
    pub fn load_score(&self, info: &WorkerInfo) -> f64 {
        let base = self.base_load(info);
        let slope = self.trend(&info.id);
        if slope > 0.0 {
            base + self.config.trend_weight * slope
        } else {
            base
        }
    }

    /// Least-squares slope of the worker's recorded load scores.
    pub fn trend(&self, worker_id: &WorkerId) -> f64 {
        match self.history.get(worker_id) {
            Some(samples) => {
                let values: Vec<f64> = samples.iter().map(|s| s.score).collect();
                linear_slope(&values)
            }
            None => 0.0,
        }
    }

    fn is_overloaded(&self, info: &WorkerInfo) -> bool {
        info.cpu > self.config.max_cpu_threshold
            || info.memory.fraction() > self.config.max_memory_threshold
    }

    fn record(&mut self, worker_id: &WorkerId, score: f64, at: Instant) {
        let limit = self.config.load_history_size.max(1);
        let samples = self.history.entry(worker_id.clone()).or_default();
        samples.push_back(LoadSample { at, score });
        while samples.len() > limit {
            samples.pop_front();
        }
    }

    /// Mean load score of selected workers; 0.0 before the first selection.
    pub fn average_selected_load(&self) -> f64 {
        if self.selections == 0 {
            return 0.0;
        }
        self.selected_load_total / self.selections as f64
    }
}

impl WorkerStrategy for LoadBalancingStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(
        &mut self,
        _task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Result<Option<Selection>, StrategyError> {
        let mut candidates = Vec::with_capacity(available.len());
        for id in available {
            let Some(info) = workers.get(id) else {
                continue;
            };
            if self.is_overloaded(info) {
                self.overloaded_rejections += 1;
                continue;
            }
            candidates.push((id.clone(), self.load_score(info)));
        }

        match pick_lowest(candidates) {
            Some((worker_id, score)) => {
                self.selected_load_total += score;
                self.selections += 1;
                Ok(Some(Selection::preferred(worker_id)))
            }
            None => Ok(None),
        }
    }

    fn on_worker_metrics(&mut self, worker_id: &WorkerId, info: &WorkerInfo) {
        let score = self.base_load(info);
        self.record(worker_id, score, Instant::now());
    }

    fn on_worker_removed(&mut self, worker_id: &WorkerId) {
        self.history.remove(worker_id);
    }

    fn maintenance(&mut self, now: Instant) {
        let retention = self.config.history_retention;
        for samples in self.history.values_mut() {
            samples.retain(|s| now.saturating_duration_since(s.at) <= retention);
        }
        self.history.retain(|_, samples| !samples.is_empty());
    }

    fn initialize(&mut self, workers: &WorkerDirectory) {
        let known: HashSet<&WorkerId> = workers.keys().collect();
        self.history.retain(|id, _| known.contains(id));
    }

    fn details(&self) -> StrategyDetails {
        StrategyDetails::LoadBalancing {
            average_selected_load: self.average_selected_load(),
            overloaded_rejections: self.overloaded_rejections,
            tracked_workers: self.history.len(),
        }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.selected_load_total = 0.0;
        self.selections = 0;
        self.overloaded_rejections = 0;
    }
}
