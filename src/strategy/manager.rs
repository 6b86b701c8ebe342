//! Strategy manager.
//!
//! Owns every instantiated strategy, routes selections to the active one
//! (or to a weighted composite), fans lifecycle hooks out to all
//! instances, tracks per-strategy success rates, and switches the active
//! strategy when its recent performance degrades.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StrategyError;
use crate::events::{EventBus, PoolEvent};
use crate::scheduler::{Task, TaskId, TaskOutcome, WorkerDirectory, WorkerId, WorkerInfo};

use super::base::{pick_highest, StrategyHandle};
use super::registry::{parse_options, StrategyContext, StrategyRegistry};
use super::StrategyMetrics;

/// Name under which the weighted ensemble is configured.
pub const COMPOSITE_STRATEGY: &str = "composite";

/// Manager settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Allow the manager to change the active strategy on its own.
    pub enable_dynamic_switching: bool,
    /// How often performance is evaluated.
    pub evaluation_window: Duration,
    /// Recent success rate below which the active strategy may be replaced.
    pub switching_threshold: f64,
    /// How much better a candidate must be than the active lifetime rate.
    pub improvement_margin: f64,
    /// Outcomes kept per strategy for the recent success rate.
    pub performance_window: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enable_dynamic_switching: false,
            evaluation_window: Duration::from_secs(5 * 60),
            switching_threshold: 0.7,
            improvement_margin: 0.1,
            performance_window: 100,
        }
    }
}

/// One constituent of a composite strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeMember {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Value,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Options of the `composite` strategy. Constituent order breaks ties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeOptions {
    pub strategies: Vec<CompositeMember>,
}

#[derive(Debug, Clone, Default)]
struct PerformanceRecord {
    selections: u64,
    successes: u64,
    failures: u64,
    total_latency: Duration,
    recent: VecDeque<bool>,
}

impl PerformanceRecord {
    fn record_selection(&mut self, latency: Duration) {
        self.selections += 1;
        self.total_latency += latency;
    }

    fn record_outcome(&mut self, success: bool, window: usize) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.recent.push_back(success);
        while self.recent.len() > window.max(1) {
            self.recent.pop_front();
        }
    }

    fn lifetime_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.successes as f64 / total as f64
    }

    fn recent_rate(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        Some(self.recent.iter().filter(|ok| **ok).count() as f64 / self.recent.len() as f64)
    }

    fn snapshot(&self, name: &str) -> PerformanceSnapshot {
        let average_latency_us = if self.selections == 0 {
            0.0
        } else {
            self.total_latency.as_secs_f64() * 1_000_000.0 / self.selections as f64
        };
        PerformanceSnapshot {
            name: name.to_string(),
            selections: self.selections,
            successes: self.successes,
            failures: self.failures,
            average_latency_us,
            success_rate: self.lifetime_rate(),
            recent_success_rate: self.recent_rate(),
        }
    }
}

/// Per-strategy performance as seen by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub name: String,
    pub selections: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_us: f64,
    pub success_rate: f64,
    pub recent_success_rate: Option<f64>,
}

/// Snapshot returned by [`StrategyManager::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerMetrics {
    /// Active strategy name, `composite`, or `None` before configuration.
    pub active: Option<String>,
    /// Normalised constituent weights when the composite is active.
    pub composite_weights: Vec<(String, f64)>,
    pub switches: u64,
    pub strategies: Vec<StrategyMetrics>,
    pub performance: Vec<PerformanceSnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
enum ActiveStrategy {
    Unset,
    Single(String),
    Composite(Vec<(String, f64)>),
}

impl ActiveStrategy {
    fn label(&self) -> Option<String> {
        match self {
            ActiveStrategy::Unset => None,
            ActiveStrategy::Single(name) => Some(name.clone()),
            ActiveStrategy::Composite(_) => Some(COMPOSITE_STRATEGY.to_string()),
        }
    }
}

/// Owns and drives the strategy instances of one pool.
pub struct StrategyManager {
    registry: StrategyRegistry,
    ctx: StrategyContext,
    config: ManagerConfig,
    events: EventBus,
    instances: BTreeMap<String, StrategyHandle>,
    active: ActiveStrategy,
    performance: BTreeMap<String, PerformanceRecord>,
    /// Strategies credited with each in-flight task.
    assignments: HashMap<TaskId, Vec<String>>,
    switches: u64,
}

impl StrategyManager {
    /// Creates a manager with no active strategy.
    pub fn new(
        registry: StrategyRegistry,
        ctx: StrategyContext,
        config: ManagerConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            ctx,
            config,
            events,
            instances: BTreeMap::new(),
            active: ActiveStrategy::Unset,
            performance: BTreeMap::new(),
            assignments: HashMap::new(),
            switches: 0,
        }
    }

    /// Manager settings.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Name of the active strategy (`composite` for the ensemble).
    pub fn active_name(&self) -> Option<String> {
        self.active.label()
    }

    /// Names of all instantiated strategies.
    pub fn instantiated(&self) -> Vec<&str> {
        self.instances.keys().map(|k| k.as_str()).collect()
    }

    /// Creates the named instance if needed. Non-null options replace an
    /// existing instance's configuration.
    fn ensure_instance(
        &mut self,
        name: &str,
        options: &serde_json::Value,
        workers: &WorkerDirectory,
    ) -> Result<(), StrategyError> {
        if self.instances.contains_key(name) && options.is_null() {
            return Ok(());
        }
        let strategy = self.registry.create(name, options, &self.ctx)?;
        let mut handle = StrategyHandle::new(strategy, self.events.clone());
        handle.initialize(workers);
        debug!(strategy = name, "Instantiated strategy");
        self.instances.insert(name.to_string(), handle);
        Ok(())
    }

    /// Activates a strategy, or the weighted ensemble for `composite`.
    ///
    /// Unknown names and invalid options are errors; the previous
    /// strategy stays active in that case. Passing non-null options for a
    /// strategy that is already instantiated rebuilds it, discarding what
    /// it has learned; null options reuse the existing instance. A
    /// composite may list each constituent only once.
    pub fn set_strategy(
        &mut self,
        name: &str,
        options: &serde_json::Value,
        workers: &WorkerDirectory,
    ) -> Result<(), StrategyError> {
        let next = if name == COMPOSITE_STRATEGY {
            let composite: CompositeOptions = parse_options(COMPOSITE_STRATEGY, options)?;
            if composite.strategies.is_empty() {
                return Err(StrategyError::EmptyComposite);
            }
            if composite
                .strategies
                .iter()
                .any(|member| member.name == COMPOSITE_STRATEGY)
            {
                return Err(StrategyError::NestedComposite);
            }
            let mut seen = HashSet::new();
            for member in &composite.strategies {
                if !self.registry.contains(&member.name) {
                    return Err(StrategyError::UnknownStrategy(member.name.clone()));
                }
                if !seen.insert(member.name.as_str()) {
                    return Err(StrategyError::DuplicateCompositeMember(member.name.clone()));
                }
            }
            for member in &composite.strategies {
                self.ensure_instance(&member.name, &member.options, workers)?;
            }
            ActiveStrategy::Composite(normalize_weights(&composite.strategies))
        } else {
            self.ensure_instance(name, options, workers)?;
            ActiveStrategy::Single(name.to_string())
        };

        let from = self.active.label();
        self.active = next;
        let to = self.active.label().unwrap_or_default();
        info!(from = ?from, to = %to, "Strategy changed");
        self.events.emit(PoolEvent::StrategyChanged { from, to });
        Ok(())
    }

    /// Picks a worker for `task`, or `None` when no strategy found one.
    pub fn select_worker(
        &mut self,
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Option<WorkerId> {
        match self.active.clone() {
            ActiveStrategy::Unset => {
                warn!(task_id = %task.id_label(), "No strategy configured");
                None
            }
            ActiveStrategy::Single(name) => {
                let (picked, latency) = self.run(&name, task, available, workers);
                self.performance
                    .entry(name.clone())
                    .or_default()
                    .record_selection(latency);
                if let (Some(_), Some(task_id)) = (&picked, &task.id) {
                    self.assignments.insert(task_id.clone(), vec![name]);
                }
                picked
            }
            ActiveStrategy::Composite(members) => {
                self.select_composite(&members, task, available, workers)
            }
        }
    }

    fn run(
        &mut self,
        name: &str,
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> (Option<WorkerId>, Duration) {
        let start = Instant::now();
        let picked = self
            .instances
            .get_mut(name)
            .and_then(|handle| handle.select_worker(task, available, workers));
        (picked, start.elapsed())
    }

    /// Sums constituent weights per voted worker; the strictly highest
    /// total wins and ties go to the worker voted for first.
    fn select_composite(
        &mut self,
        members: &[(String, f64)],
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Option<WorkerId> {
        let mut tally: Vec<(WorkerId, f64)> = Vec::new();
        let mut voters: Vec<(String, WorkerId)> = Vec::new();

        for (name, weight) in members {
            let (picked, latency) = self.run(name, task, available, workers);
            self.performance
                .entry(name.clone())
                .or_default()
                .record_selection(latency);
            let Some(worker_id) = picked else {
                continue;
            };
            match tally.iter_mut().find(|(id, _)| *id == worker_id) {
                Some((_, total)) => *total += weight,
                None => tally.push((worker_id.clone(), *weight)),
            }
            voters.push((name.clone(), worker_id));
        }

        let (winner, score) = pick_highest(tally)?;
        debug!(task_id = %task.id_label(), worker_id = %winner, score, "Composite selection");
        if let Some(task_id) = &task.id {
            let credited = voters
                .into_iter()
                .filter(|(_, id)| *id == winner)
                .map(|(name, _)| name)
                .collect();
            self.assignments.insert(task_id.clone(), credited);
        }
        Some(winner)
    }

    /// Forwards a task outcome to every strategy and credits the
    /// strategies that chose the worker.
    pub fn on_task_completed(&mut self, worker_id: &WorkerId, task: &Task, outcome: &TaskOutcome) {
        for handle in self.instances.values_mut() {
            handle.on_task_completed(worker_id, task, outcome);
        }

        let credited = task
            .id
            .as_ref()
            .and_then(|id| self.assignments.remove(id))
            .unwrap_or_default();
        let window = self.config.performance_window;
        for name in credited {
            self.performance
                .entry(name)
                .or_default()
                .record_outcome(outcome.is_success(), window);
        }
    }

    pub fn on_worker_added(&mut self, worker_id: &WorkerId, info: &WorkerInfo) {
        for handle in self.instances.values_mut() {
            handle.on_worker_added(worker_id, info);
        }
    }

    pub fn on_worker_removed(&mut self, worker_id: &WorkerId) {
        for handle in self.instances.values_mut() {
            handle.on_worker_removed(worker_id);
        }
    }

    pub fn on_worker_metrics(&mut self, worker_id: &WorkerId, info: &WorkerInfo) {
        for handle in self.instances.values_mut() {
            handle.on_worker_metrics(worker_id, info);
        }
    }

    /// Runs periodic housekeeping on every strategy.
    pub fn maintenance(&mut self, now: Instant) {
        for handle in self.instances.values_mut() {
            handle.maintenance(now);
        }
    }

    /// Compares the active strategy against the others and switches when
    /// it is underperforming. Returns `(from, to)` when a switch happened.
    pub fn evaluate(&mut self) -> Option<(String, String)> {
        if !self.config.enable_dynamic_switching {
            return None;
        }
        let ActiveStrategy::Single(active) = &self.active else {
            return None;
        };
        let active = active.clone();

        let record = self.performance.get(&active)?;
        let active_recent = record.recent_rate()?;
        if active_recent >= self.config.switching_threshold {
            return None;
        }
        let bar = record.lifetime_rate() + self.config.improvement_margin;

        let mut best: Option<(String, f64)> = None;
        for name in self.instances.keys().filter(|name| **name != active) {
            let Some(rate) = self.performance.get(name).and_then(|r| r.recent_rate()) else {
                continue;
            };
            if rate <= bar {
                continue;
            }
            match &best {
                Some((_, best_rate)) if OrderedFloat(rate) <= OrderedFloat(*best_rate) => {}
                _ => best = Some((name.clone(), rate)),
            }
        }

        let (to, to_rate) = best?;
        info!(
            from = %active,
            to = %to,
            from_rate = active_recent,
            to_rate,
            "Switching strategy on performance"
        );
        self.events.emit(PoolEvent::AutoSwitching {
            from: active.clone(),
            to: to.clone(),
            from_rate: active_recent,
            to_rate,
        });
        self.events.emit(PoolEvent::StrategyChanged {
            from: Some(active.clone()),
            to: to.clone(),
        });
        self.active = ActiveStrategy::Single(to.clone());
        self.switches += 1;
        Some((active, to))
    }

    /// Metrics of every instantiated strategy plus manager bookkeeping.
    pub fn metrics(&self) -> ManagerMetrics {
        let composite_weights = match &self.active {
            ActiveStrategy::Composite(members) => members.clone(),
            _ => Vec::new(),
        };
        ManagerMetrics {
            active: self.active.label(),
            composite_weights,
            switches: self.switches,
            strategies: self.instances.values().map(|h| h.metrics()).collect(),
            performance: self
                .performance
                .iter()
                .map(|(name, record)| record.snapshot(name))
                .collect(),
        }
    }

    /// Clears learned state and counters of every strategy.
    pub fn reset(&mut self) {
        for handle in self.instances.values_mut() {
            handle.reset();
        }
        self.performance.clear();
        self.assignments.clear();
        self.switches = 0;
    }
}

/// Normalises weights to sum to 1, keeping constituent order.
fn normalize_weights(members: &[CompositeMember]) -> Vec<(String, f64)> {
    let total: f64 = members.iter().map(|m| m.weight.max(0.0)).sum();
    members
        .iter()
        .map(|m| {
            let weight = if total > 0.0 {
                m.weight.max(0.0) / total
            } else {
                1.0 / members.len() as f64
            };
            (m.name.clone(), weight)
        })
        .collect()
}
