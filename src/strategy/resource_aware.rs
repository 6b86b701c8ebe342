//! Resource-aware assignment.
//!
//! Resolves what a task needs (explicit requirements, a per-type profile,
//! a learned 90th percentile, or a default) and matches it against each
//! worker's predicted headroom. Workers with just enough room are
//! preferred over heavily over-provisioned ones. When nobody fits, a
//! bounded overcommit is allowed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::scheduler::{
    HostCapabilities, ResourceUsage, Task, TaskOutcome, WorkerDirectory, WorkerId, WorkerInfo,
};

use super::base::{linear_slope, pick_highest, pick_lowest};
use super::{Selection, StrategyDetails, WorkerStrategy};

/// Resource needs of a task type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProfile {
    /// Cpu percent.
    pub cpu: f64,
    /// Memory in megabytes.
    pub memory: f64,
    /// Expected runtime in milliseconds.
    pub timeout: u64,
}

impl ResourceProfile {
    pub const fn new(cpu: f64, memory: f64, timeout: u64) -> Self {
        Self {
            cpu,
            memory,
            timeout,
        }
    }
}

fn builtin_profiles() -> BTreeMap<String, ResourceProfile> {
    [
        ("compile", ResourceProfile::new(80.0, 2048.0, 10 * 60 * 1000)),
        ("build", ResourceProfile::new(70.0, 2048.0, 10 * 60 * 1000)),
        ("test", ResourceProfile::new(60.0, 1024.0, 5 * 60 * 1000)),
        ("analyze", ResourceProfile::new(40.0, 1024.0, 5 * 60 * 1000)),
        ("lint", ResourceProfile::new(30.0, 512.0, 2 * 60 * 1000)),
        ("format", ResourceProfile::new(20.0, 256.0, 60 * 1000)),
    ]
    .into_iter()
    .map(|(name, profile)| (name.to_string(), profile))
    .collect()
}

/// Configuration for [`ResourceAwareStrategy`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceAwareConfig {
    /// Cpu percent held back on every worker.
    pub cpu_safety_margin: f64,
    /// Memory (MB) held back on every worker.
    pub memory_safety_margin: f64,
    pub enable_prediction: bool,
    /// Only samples younger than this feed the prediction.
    #[serde(with = "crate::scheduler::config::duration_ms")]
    pub prediction_window: Duration,
    /// Samples kept per worker for prediction.
    pub prediction_samples: usize,
    pub allow_overcommit: bool,
    /// Largest requirement/headroom ratio accepted when overcommitting.
    pub max_overcommit: f64,
    /// Used when nothing else resolves a requirement.
    pub default_requirements: ResourceProfile,
    /// Per task type profiles. Replaces the built-in table when given.
    pub profiles: BTreeMap<String, ResourceProfile>,
    /// Usage samples required before a learned estimate is trusted.
    pub min_learning_samples: usize,
    /// Usage samples kept per task type.
    pub max_learning_samples: usize,
}

impl Default for ResourceAwareConfig {
    fn default() -> Self {
        Self {
            cpu_safety_margin: 10.0,
            memory_safety_margin: 256.0,
            enable_prediction: true,
            prediction_window: Duration::from_secs(5 * 60),
            prediction_samples: 10,
            allow_overcommit: true,
            max_overcommit: 1.2,
            default_requirements: ResourceProfile::new(20.0, 512.0, 5 * 60 * 1000),
            profiles: builtin_profiles(),
            min_learning_samples: 5,
            max_learning_samples: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageSample {
    at: Instant,
    cpu: f64,
    memory_mb: f64,
}

/// Headroom of one worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Headroom {
    pub cpu: f64,
    pub memory: f64,
}

/// Matches task requirements against predicted worker headroom.
#[derive(Debug)]
pub struct ResourceAwareStrategy {
    config: ResourceAwareConfig,
    host: HostCapabilities,
    samples: HashMap<WorkerId, VecDeque<UsageSample>>,
    learned: HashMap<String, VecDeque<ResourceUsage>>,
    capable_selections: u64,
    overcommit_selections: u64,
    rejections: u64,
}

impl ResourceAwareStrategy {
    pub const NAME: &'static str = "resource-aware";

    /// Creates the strategy. `host` supplies the memory total for workers
    /// that report no memory limit.
    pub fn new(config: ResourceAwareConfig, host: HostCapabilities) -> Self {
        Self {
            config,
            host,
            samples: HashMap::new(),
            learned: HashMap::new(),
            capable_selections: 0,
            overcommit_selections: 0,
            rejections: 0,
        }
    }

    /// Resolved requirements of a task.
    pub fn requirements_for(&self, task: &Task) -> ResourceProfile {
        let base = task
            .task_type
            .as_deref()
            .and_then(|t| {
                self.config
                    .profiles
                    .get(t)
                    .copied()
                    .or_else(|| self.learned_estimate(t))
            })
            .unwrap_or(self.config.default_requirements);

        match task.requirements {
            Some(explicit) => ResourceProfile {
                cpu: explicit.cpu.unwrap_or(base.cpu),
                memory: explicit.memory.unwrap_or(base.memory),
                timeout: explicit.timeout.unwrap_or(base.timeout),
            },
            None => base,
        }
    }

    /// 90th percentile of observed usage for a task type.
    pub fn learned_estimate(&self, task_type: &str) -> Option<ResourceProfile> {
        let history = self.learned.get(task_type)?;
        if history.len() < self.config.min_learning_samples.max(1) {
            return None;
        }
        let cpu: Vec<f64> = history.iter().map(|u| u.cpu).collect();
        let memory: Vec<f64> = history.iter().map(|u| u.memory).collect();
        Some(ResourceProfile {
            cpu: percentile(cpu, 0.9),
            memory: percentile(memory, 0.9),
            timeout: self.config.default_requirements.timeout,
        })
    }

    fn memory_limit(&self, info: &WorkerInfo) -> f64 {
        if info.memory.limit_mb > 0.0 {
            return info.memory.limit_mb;
        }
        info.capabilities.unwrap_or(self.host).total_memory_mb as f64
    }

    /// Blends the current reading with a short linear forecast.
    fn predict(&self, current: f64, series: &[f64]) -> f64 {
        if !self.config.enable_prediction || series.len() < 2 {
            return current;
        }
        let mean = series.iter().sum::<f64>() / series.len() as f64;
        let forecast = mean + linear_slope(series);
        ((current + forecast) / 2.0).max(0.0)
    }

    /// Predicted cpu and memory headroom of a worker.
    pub fn headroom(&self, info: &WorkerInfo, now: Instant) -> Headroom {
        let window = self.config.prediction_window;
        let recent: Vec<UsageSample> = self
            .samples
            .get(&info.id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| now.saturating_duration_since(s.at) <= window)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        let cpu_series: Vec<f64> = recent.iter().map(|s| s.cpu).collect();
        let memory_series: Vec<f64> = recent.iter().map(|s| s.memory_mb).collect();
        let predicted_cpu = self.predict(info.cpu, &cpu_series);
        let predicted_memory = self.predict(info.memory.used_mb, &memory_series);

        Headroom {
            cpu: (100.0 - predicted_cpu - self.config.cpu_safety_margin).max(0.0),
            memory: (self.memory_limit(info) - predicted_memory - self.config.memory_safety_margin)
                .max(0.0),
        }
    }

    fn fit_score(required: &ResourceProfile, headroom: &Headroom) -> f64 {
        let mut score = 100.0;
        for (need, have, penalty) in [
            (required.cpu, headroom.cpu, 5.0),
            (required.memory, headroom.memory, 3.0),
        ] {
            if need <= 0.0 {
                continue;
            }
            let ratio = have / need;
            if ratio > 2.0 {
                score -= (ratio - 2.0) * penalty;
            }
            if (1.0..=1.5).contains(&ratio) {
                score += 10.0;
            }
        }
        score
    }

    fn overcommit_ratio(required: &ResourceProfile, headroom: &Headroom) -> f64 {
        let ratio = |need: f64, have: f64| {
            if need <= 0.0 {
                0.0
            } else if have <= 0.0 {
                f64::INFINITY
            } else {
                need / have
            }
        };
        ratio(required.cpu, headroom.cpu).max(ratio(required.memory, headroom.memory))
    }

    fn learn(&mut self, task_type: &str, usage: ResourceUsage) {
        let limit = self.config.max_learning_samples.max(1);
        let history = self.learned.entry(task_type.to_string()).or_default();
        history.push_back(usage);
        while history.len() > limit {
            history.pop_front();
        }
    }
}

/// Nearest-rank percentile of `values`.
fn percentile(mut values: Vec<f64>, p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = (p * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

impl WorkerStrategy for ResourceAwareStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn select(
        &mut self,
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Result<Option<Selection>, StrategyError> {
        let now = Instant::now();
        let required = self.requirements_for(task);

        let headrooms: Vec<(WorkerId, Headroom)> = available
            .iter()
            .filter_map(|id| workers.get(id))
            .map(|info| (info.id.clone(), self.headroom(info, now)))
            .collect();

        let capable = headrooms
            .iter()
            .filter(|(_, h)| h.cpu >= required.cpu && h.memory >= required.memory)
            .map(|(id, h)| (id.clone(), Self::fit_score(&required, h)))
            .collect::<Vec<_>>();
        if let Some((worker_id, _)) = pick_highest(capable) {
            self.capable_selections += 1;
            return Ok(Some(Selection::preferred(worker_id)));
        }

        if self.config.allow_overcommit {
            let ratios = headrooms
                .iter()
                .map(|(id, h)| (id.clone(), Self::overcommit_ratio(&required, h)))
                .collect::<Vec<_>>();
            if let Some((worker_id, ratio)) = pick_lowest(ratios) {
                if ratio <= self.config.max_overcommit {
                    self.overcommit_selections += 1;
                    return Ok(Some(Selection::fallback(worker_id)));
                }
            }
        }

        self.rejections += 1;
        Ok(None)
    }

    fn on_task_completed(&mut self, _worker_id: &WorkerId, task: &Task, outcome: &TaskOutcome) {
        if let (Some(task_type), Some(usage)) = (task.task_type.as_deref(), outcome.usage()) {
            self.learn(task_type, usage);
        }
    }

    fn on_worker_metrics(&mut self, worker_id: &WorkerId, info: &WorkerInfo) {
        let limit = self.config.prediction_samples.max(1);
        let samples = self.samples.entry(worker_id.clone()).or_default();
        samples.push_back(UsageSample {
            at: Instant::now(),
            cpu: info.cpu,
            memory_mb: info.memory.used_mb,
        });
        while samples.len() > limit {
            samples.pop_front();
        }
    }

    fn on_worker_removed(&mut self, worker_id: &WorkerId) {
        self.samples.remove(worker_id);
    }

    fn maintenance(&mut self, now: Instant) {
        let window = self.config.prediction_window;
        for samples in self.samples.values_mut() {
            samples.retain(|s| now.saturating_duration_since(s.at) <= window);
        }
        self.samples.retain(|_, samples| !samples.is_empty());
    }

    fn details(&self) -> StrategyDetails {
        StrategyDetails::ResourceAware {
            capable_selections: self.capable_selections,
            overcommit_selections: self.overcommit_selections,
            rejections: self.rejections,
            learned_task_types: self.learned.len(),
        }
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.learned.clear();
        self.capable_selections = 0;
        self.overcommit_selections = 0;
        self.rejections = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{MemorySample, ResourceRequirements};
    use crate::strategy::base::test_support::*;

    fn host() -> HostCapabilities {
        HostCapabilities::new(4, 8192)
    }

    fn strategy(config: ResourceAwareConfig) -> ResourceAwareStrategy {
        ResourceAwareStrategy::new(config, host())
    }

    fn completed_with(cpu: f64, memory: f64) -> TaskOutcome {
        TaskOutcome::Completed {
            result: serde_json::Value::Null,
            duration: Duration::from_millis(10),
            usage: Some(ResourceUsage { cpu, memory }),
        }
    }

    #[test]
    fn test_requirement_resolution_order() {
        let mut s = strategy(ResourceAwareConfig::default());

        let compile = Task::new().with_type("compile");
        assert_eq!(
            s.requirements_for(&compile),
            ResourceProfile::new(80.0, 2048.0, 600_000)
        );

        let explicit = Task::new().with_type("compile").with_requirements(ResourceRequirements {
            cpu: Some(10.0),
            memory: None,
            timeout: None,
        });
        assert_eq!(s.requirements_for(&explicit).cpu, 10.0);
        assert_eq!(s.requirements_for(&explicit).memory, 2048.0);

        let unknown = Task::new().with_type("render");
        assert_eq!(s.requirements_for(&unknown), s.config.default_requirements);

        for i in 1..=10 {
            s.on_task_completed(
                &WorkerId::from("w"),
                &unknown,
                &completed_with(i as f64 * 10.0, i as f64 * 100.0),
            );
        }
        let learned = s.requirements_for(&unknown);
        assert_eq!(learned.cpu, 90.0);
        assert_eq!(learned.memory, 900.0);
    }

    #[test]
    fn test_learning_needs_minimum_samples_and_is_bounded() {
        let mut s = strategy(ResourceAwareConfig::default());
        let task = Task::new().with_type("render");
        for _ in 0..4 {
            s.on_task_completed(&WorkerId::from("w"), &task, &completed_with(50.0, 100.0));
        }
        assert!(s.learned_estimate("render").is_none());

        for _ in 0..200 {
            s.on_task_completed(&WorkerId::from("w"), &task, &completed_with(50.0, 100.0));
        }
        assert_eq!(s.learned["render"].len(), 100);
        assert!(s.learned_estimate("render").is_some());
    }

    #[test]
    fn test_prefers_snug_fit_over_oversized_worker() {
        let mut workers = directory(&[("big", 0.0), ("snug", 50.0)]);
        workers
            .get_mut(&WorkerId::from("big"))
            .unwrap()
            .record_metrics(0.0, MemorySample::new(0.0, 64.0 * 1024.0));
        workers
            .get_mut(&WorkerId::from("snug"))
            .unwrap()
            .record_metrics(50.0, MemorySample::new(256.0, 1536.0));
        let mut s = strategy(ResourceAwareConfig::default());

        // lint: 30% / 512MB. snug has 40% / 1024MB, big has 90% / ~65GB.
        let task = Task::new().with_type("lint");
        let picked = s
            .select(&task, &available(&workers), &workers)
            .unwrap()
            .unwrap();
        assert_eq!(picked.worker_id, WorkerId::from("snug"));
        assert!(!picked.fallback);
    }

    #[test]
    fn test_rejects_impossible_task_without_overcommit() {
        let workers = directory(&[("a", 10.0), ("b", 20.0)]);
        let mut s = strategy(ResourceAwareConfig {
            allow_overcommit: false,
            ..ResourceAwareConfig::default()
        });
        let task = Task::new().with_requirements(ResourceRequirements {
            cpu: Some(99.0),
            memory: Some(1_000_000.0),
            timeout: None,
        });
        assert!(s
            .select(&task, &available(&workers), &workers)
            .unwrap()
            .is_none());
        assert!(matches!(
            s.details(),
            StrategyDetails::ResourceAware { rejections: 1, .. }
        ));
    }

    #[test]
    fn test_bounded_overcommit() {
        // headroom: 100 - 20 - 10 = 70% cpu, 2048 - 256 - 256 = 1536MB
        let workers = directory(&[("a", 20.0)]);
        let mut s = strategy(ResourceAwareConfig::default());

        let slightly_over = Task::new().with_requirements(ResourceRequirements {
            cpu: Some(80.0),
            memory: Some(512.0),
            timeout: None,
        });
        let picked = s
            .select(&slightly_over, &available(&workers), &workers)
            .unwrap()
            .unwrap();
        assert!(picked.fallback);

        let far_over = Task::new().with_requirements(ResourceRequirements {
            cpu: Some(95.0),
            memory: Some(512.0),
            timeout: None,
        });
        assert!(s
            .select(&far_over, &available(&workers), &workers)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_prediction_follows_rising_usage() {
        let workers = directory(&[("a", 40.0)]);
        let mut info = workers[&WorkerId::from("a")].clone();
        let mut s = strategy(ResourceAwareConfig::default());
        let flat = s.headroom(&info, Instant::now());

        for cpu in [10.0, 20.0, 30.0, 40.0] {
            info.record_metrics(cpu, info.memory);
            s.on_worker_metrics(&info.id, &info);
        }
        let predicted = s.headroom(&info, Instant::now());
        // mean 25 + slope 10 = 35, blended with 40
        assert!((predicted.cpu - (100.0 - 37.5 - 10.0)).abs() < 1e-9);
        assert!(predicted.cpu > flat.cpu);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        assert_eq!(percentile(vec![], 0.9), 0.0);
        assert_eq!(percentile(vec![5.0], 0.9), 5.0);
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        assert_eq!(percentile(values, 0.9), 9.0);
    }
}
