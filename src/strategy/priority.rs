//! Priority-tiered assignment.
//!
//! Workers are classified once into a capability tier. A task's priority
//! restricts which tiers may serve it; among eligible workers the best
//! score wins. When no eligible worker is free the least-busy available
//! worker is used and the selection is flagged as a fallback.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::scheduler::{
    HostCapabilities, PriorityLevel, Task, TaskOutcome, WorkerDirectory, WorkerId, WorkerInfo,
};

use super::base::{pick_highest, pick_least_busy};
use super::{Selection, StrategyDetails, WorkerStrategy};

/// Capability bucket of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTier {
    Premium,
    Standard,
    Basic,
}

impl WorkerTier {
    /// Returns the lowercase tier name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerTier::Premium => "premium",
            WorkerTier::Standard => "standard",
            WorkerTier::Basic => "basic",
        }
    }

    /// Base score contributed by the tier.
    pub fn base_score(&self) -> f64 {
        match self {
            WorkerTier::Premium => 30.0,
            WorkerTier::Standard => 20.0,
            WorkerTier::Basic => 10.0,
        }
    }
}

impl fmt::Display for WorkerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum capabilities for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRequirement {
    pub min_cpu_cores: usize,
    pub min_memory_mb: u64,
}

impl TierRequirement {
    fn is_met_by(&self, capabilities: &HostCapabilities) -> bool {
        capabilities.cpu_cores >= self.min_cpu_cores
            && capabilities.total_memory_mb >= self.min_memory_mb
    }
}

/// Configuration for [`PriorityBasedStrategy`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PriorityConfig {
    pub premium: TierRequirement,
    pub standard: TierRequirement,
    /// Tiers allowed to serve each priority level.
    pub allowed_tiers: BTreeMap<PriorityLevel, Vec<WorkerTier>>,
    /// Window over which per-worker success rates are computed.
    #[serde(with = "crate::scheduler::config::duration_ms")]
    pub performance_window: Duration,
    /// Cpu percent above which the overload penalty applies.
    pub high_load_threshold: f64,
    /// Bonus for an idle premium worker on an urgent or high task.
    pub premium_idle_bonus: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        let mut allowed_tiers = BTreeMap::new();
        let fast = vec![WorkerTier::Premium, WorkerTier::Standard];
        allowed_tiers.insert(PriorityLevel::Urgent, fast.clone());
        allowed_tiers.insert(PriorityLevel::High, fast);
        allowed_tiers.insert(
            PriorityLevel::Normal,
            vec![WorkerTier::Standard, WorkerTier::Basic],
        );
        allowed_tiers.insert(PriorityLevel::Low, vec![WorkerTier::Basic]);
        allowed_tiers.insert(PriorityLevel::Background, vec![WorkerTier::Basic]);

        Self {
            premium: TierRequirement {
                min_cpu_cores: 8,
                min_memory_mb: 16 * 1024,
            },
            standard: TierRequirement {
                min_cpu_cores: 4,
                min_memory_mb: 8 * 1024,
            },
            allowed_tiers,
            performance_window: Duration::from_secs(60 * 60),
            high_load_threshold: 70.0,
            premium_idle_bonus: 30.0,
        }
    }
}

/// Success rate assumed for workers without history.
const NEUTRAL_SUCCESS_RATE: f64 = 0.5;

/// Tier-restricted, score-ranked selection.
#[derive(Debug)]
pub struct PriorityBasedStrategy {
    config: PriorityConfig,
    host: HostCapabilities,
    tiers: HashMap<WorkerId, WorkerTier>,
    outcomes: HashMap<WorkerId, VecDeque<(Instant, bool)>>,
    by_priority: BTreeMap<String, u64>,
    by_tier: BTreeMap<String, u64>,
    fallback_selections: u64,
}

impl PriorityBasedStrategy {
    pub const NAME: &'static str = "priority-based";

    /// Creates the strategy. `host` classifies workers that carry no
    /// capabilities of their own.
    pub fn new(config: PriorityConfig, host: HostCapabilities) -> Self {
        Self {
            config,
            host,
            tiers: HashMap::new(),
            outcomes: HashMap::new(),
            by_priority: BTreeMap::new(),
            by_tier: BTreeMap::new(),
            fallback_selections: 0,
        }
    }

    /// Tier for the given capabilities, checked premium first.
    pub fn classify(&self, capabilities: &HostCapabilities) -> WorkerTier {
        if self.config.premium.is_met_by(capabilities) {
            WorkerTier::Premium
        } else if self.config.standard.is_met_by(capabilities) {
            WorkerTier::Standard
        } else {
            WorkerTier::Basic
        }
    }

    /// Cached tier of a worker, classifying it on first sight.
    fn tier_of(&mut self, info: &WorkerInfo) -> WorkerTier {
        if let Some(tier) = self.tiers.get(&info.id) {
            return *tier;
        }
        let capabilities = info.capabilities.unwrap_or(self.host);
        let tier = self.classify(&capabilities);
        self.tiers.insert(info.id.clone(), tier);
        tier
    }

    fn allowed(&self, priority: PriorityLevel) -> &[WorkerTier] {
        self.config
            .allowed_tiers
            .get(&priority)
            .map(|tiers| tiers.as_slice())
            .unwrap_or(&[])
    }

    /// Fraction of successful outcomes within the performance window.
    pub fn success_rate(&self, worker_id: &WorkerId, now: Instant) -> f64 {
        let window = self.config.performance_window;
        let Some(outcomes) = self.outcomes.get(worker_id) else {
            return NEUTRAL_SUCCESS_RATE;
        };
        let recent: Vec<bool> = outcomes
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= window)
            .map(|(_, ok)| *ok)
            .collect();
        if recent.is_empty() {
            return NEUTRAL_SUCCESS_RATE;
        }
        recent.iter().filter(|ok| **ok).count() as f64 / recent.len() as f64
    }

    fn score(
        &self,
        info: &WorkerInfo,
        tier: WorkerTier,
        priority: PriorityLevel,
        now: Instant,
    ) -> f64 {
        let mut score = tier.base_score()
            + (100.0 - info.cpu) * 0.5
            + self.success_rate(&info.id, now) * 20.0;

        let pressing = matches!(priority, PriorityLevel::Urgent | PriorityLevel::High);
        if pressing && tier == WorkerTier::Premium && !info.has_task() {
            score += self.config.premium_idle_bonus;
        }
        if info.cpu > self.config.high_load_threshold {
            score -= (info.cpu - self.config.high_load_threshold) * 2.0;
        }
        score
    }

    fn count(&mut self, priority: PriorityLevel, tier: WorkerTier) {
        *self.by_priority.entry(priority.to_string()).or_insert(0) += 1;
        *self.by_tier.entry(tier.to_string()).or_insert(0) += 1;
    }
}

impl WorkerStrategy for PriorityBasedStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initialize(&mut self, workers: &WorkerDirectory) {
        for info in workers.values() {
            self.tier_of(info);
        }
    }

    fn select(
        &mut self,
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Result<Option<Selection>, StrategyError> {
        let now = Instant::now();
        let priority = task.priority_level();
        let allowed: HashSet<WorkerTier> = self.allowed(priority).iter().copied().collect();

        let mut eligible = Vec::new();
        let mut candidates = Vec::new();
        for id in available {
            let Some(info) = workers.get(id) else {
                continue;
            };
            candidates.push(info);
            let tier = self.tier_of(info);
            if allowed.contains(&tier) {
                eligible.push((info, tier));
            }
        }

        let scored = eligible
            .iter()
            .map(|(info, tier)| (info.id.clone(), self.score(info, *tier, priority, now)));
        if let Some((worker_id, _)) = pick_highest(scored.collect::<Vec<_>>()) {
            let tier = self.tiers.get(&worker_id).copied().unwrap_or(WorkerTier::Basic);
            self.count(priority, tier);
            return Ok(Some(Selection::preferred(worker_id)));
        }

        // No allowed tier has a free worker: take the least busy one.
        match pick_least_busy(candidates.iter().copied(), now) {
            Some(worker_id) => {
                let tier = self.tiers.get(&worker_id).copied().unwrap_or(WorkerTier::Basic);
                self.count(priority, tier);
                self.fallback_selections += 1;
                Ok(Some(Selection::fallback(worker_id)))
            }
            None => Ok(None),
        }
    }

    fn on_task_completed(&mut self, worker_id: &WorkerId, _task: &Task, outcome: &TaskOutcome) {
        let now = Instant::now();
        let window = self.config.performance_window;
        let outcomes = self.outcomes.entry(worker_id.clone()).or_default();
        outcomes.push_back((now, outcome.is_success()));
        while let Some((at, _)) = outcomes.front() {
            if now.saturating_duration_since(*at) > window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn on_worker_added(&mut self, _worker_id: &WorkerId, info: &WorkerInfo) {
        self.tier_of(info);
    }

    fn on_worker_removed(&mut self, worker_id: &WorkerId) {
        self.tiers.remove(worker_id);
        self.outcomes.remove(worker_id);
    }

    fn maintenance(&mut self, now: Instant) {
        let window = self.config.performance_window;
        for outcomes in self.outcomes.values_mut() {
            outcomes.retain(|(at, _)| now.saturating_duration_since(*at) <= window);
        }
        self.outcomes.retain(|_, outcomes| !outcomes.is_empty());
    }

    fn details(&self) -> StrategyDetails {
        StrategyDetails::PriorityBased {
            by_priority: self.by_priority.clone(),
            by_tier: self.by_tier.clone(),
            fallback_selections: self.fallback_selections,
        }
    }

    fn reset(&mut self) {
        self.tiers.clear();
        self.outcomes.clear();
        self.by_priority.clear();
        self.by_tier.clear();
        self.fallback_selections = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::base::test_support::*;

    fn basic_host() -> HostCapabilities {
        HostCapabilities::new(2, 4096)
    }

    /// "p" is premium, "s" standard, "b" basic (host default).
    fn tiered_directory() -> WorkerDirectory {
        let mut workers = directory(&[("b", 10.0), ("p", 10.0), ("s", 10.0)]);
        workers.get_mut(&WorkerId::from("p")).unwrap().capabilities =
            Some(HostCapabilities::new(16, 32 * 1024));
        workers.get_mut(&WorkerId::from("s")).unwrap().capabilities =
            Some(HostCapabilities::new(4, 8 * 1024));
        workers
    }

    fn select(
        strategy: &mut PriorityBasedStrategy,
        task: &Task,
        workers: &WorkerDirectory,
    ) -> Option<Selection> {
        strategy.select(task, &available(workers), workers).unwrap()
    }

    #[test]
    fn test_classification_thresholds() {
        let strategy = PriorityBasedStrategy::new(PriorityConfig::default(), basic_host());
        assert_eq!(
            strategy.classify(&HostCapabilities::new(8, 16384)),
            WorkerTier::Premium
        );
        assert_eq!(
            strategy.classify(&HostCapabilities::new(16, 8192)),
            WorkerTier::Standard
        );
        assert_eq!(strategy.classify(&basic_host()), WorkerTier::Basic);
    }

    #[test]
    fn test_priority_tiers_contain_selection() {
        let workers = tiered_directory();
        let mut strategy = PriorityBasedStrategy::new(PriorityConfig::default(), basic_host());

        let urgent = Task::new().with_priority(PriorityLevel::Urgent);
        let picked = select(&mut strategy, &urgent, &workers).unwrap();
        assert_eq!(picked.worker_id, WorkerId::from("p"));
        assert!(!picked.fallback);

        let normal = Task::new();
        let picked = select(&mut strategy, &normal, &workers).unwrap();
        assert_eq!(picked.worker_id, WorkerId::from("s"));

        let background = Task::new().with_type("background-cleanup");
        let picked = select(&mut strategy, &background, &workers).unwrap();
        assert_eq!(picked.worker_id, WorkerId::from("b"));
    }

    #[test]
    fn test_fallback_is_flagged() {
        let mut workers = tiered_directory();
        occupy(&mut workers, "b");
        workers
            .get_mut(&WorkerId::from("s"))
            .unwrap()
            .record_metrics(60.0, Default::default());
        let mut strategy = PriorityBasedStrategy::new(PriorityConfig::default(), basic_host());

        let low = Task::new().with_numeric_priority(30);
        let picked = select(&mut strategy, &low, &workers).unwrap();
        assert!(picked.fallback);
        assert_eq!(picked.worker_id, WorkerId::from("p"));

        match strategy.details() {
            StrategyDetails::PriorityBased {
                fallback_selections,
                by_priority,
                ..
            } => {
                assert_eq!(fallback_selections, 1);
                assert_eq!(by_priority.get("low"), Some(&1));
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_fallback_prefers_healthier_worker_on_equal_load() {
        let mut workers = tiered_directory();
        occupy(&mut workers, "b");
        workers.get_mut(&WorkerId::from("s")).unwrap().tasks_processed = 40;
        let mut strategy = PriorityBasedStrategy::new(PriorityConfig::default(), basic_host());

        // "p" and "s" report the same cpu; "s" has the better track record.
        let background = Task::new().with_priority(PriorityLevel::Background);
        let picked = select(&mut strategy, &background, &workers).unwrap();
        assert!(picked.fallback);
        assert_eq!(picked.worker_id, WorkerId::from("s"));
    }

    #[test]
    fn test_success_rate_influences_choice() {
        let workers = directory(&[("a", 10.0), ("b", 10.0)]);
        let mut strategy = PriorityBasedStrategy::new(PriorityConfig::default(), basic_host());
        let failed = TaskOutcome::Failed {
            error: "boom".to_string(),
            duration: Duration::from_millis(5),
        };
        strategy.on_task_completed(&WorkerId::from("a"), &Task::new(), &failed);

        let now = Instant::now();
        assert_eq!(strategy.success_rate(&WorkerId::from("a"), now), 0.0);
        assert_eq!(strategy.success_rate(&WorkerId::from("b"), now), NEUTRAL_SUCCESS_RATE);

        let picked = select(&mut strategy, &Task::new(), &workers).unwrap();
        assert_eq!(picked.worker_id, WorkerId::from("b"));
    }

    #[test]
    fn test_high_cpu_penalised() {
        let workers = directory(&[("a", 90.0), ("b", 40.0)]);
        let strategy = PriorityBasedStrategy::new(PriorityConfig::default(), basic_host());
        let now = Instant::now();
        let hot = strategy.score(
            &workers[&WorkerId::from("a")],
            WorkerTier::Basic,
            PriorityLevel::Normal,
            now,
        );
        // 10 + 5 + 10 - 40
        assert!((hot - (-15.0)).abs() < 1e-9);
    }

    #[test]
    fn test_allowed_tiers_from_options() {
        let config: PriorityConfig = serde_json::from_value(serde_json::json!({
            "allowedTiers": {"normal": ["premium"]}
        }))
        .unwrap();
        assert_eq!(
            config.allowed_tiers.get(&PriorityLevel::Normal),
            Some(&vec![WorkerTier::Premium])
        );
        assert_eq!(config.high_load_threshold, 70.0);
    }
}
