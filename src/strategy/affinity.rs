//! Affinity-based assignment.
//!
//! Tasks sharing an affinity key (derived from task attributes such as
//! the project) are kept on the same small group of workers so caches and
//! checkouts stay warm. Sticky sessions pin a session id to one worker.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::error::StrategyError;
use crate::scheduler::{Task, WorkerDirectory, WorkerId, WorkerInfo};

use super::base::{health_score, pick_highest, ScoreWeights};
use super::{Selection, StrategyDetails, WorkerStrategy};

/// Key shared by tasks carrying none of the affinity attributes.
pub const DEFAULT_AFFINITY_KEY: &str = "default";

/// Uptime over which the new-worker recency bonus fades out.
const RECENCY_WINDOW: Duration = Duration::from_secs(20 * 60);

/// Configuration for [`AffinityStrategy`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AffinityConfig {
    /// Task attributes combined into the affinity key, in order.
    pub affinity_attributes: Vec<String>,
    pub enable_sticky_sessions: bool,
    /// Bonus for a worker that already served this key.
    pub cache_warmup_bonus: f64,
    /// Group size below which new workers are recruited.
    pub max_workers_per_group: usize,
    /// Workers above this cpu percent are never selected.
    pub load_threshold: f64,
    /// Keys untouched for longer than this are dropped.
    #[serde(with = "crate::scheduler::config::duration_ms")]
    pub affinity_duration: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            affinity_attributes: vec![
                "projectId".to_string(),
                "repository".to_string(),
                "type".to_string(),
            ],
            enable_sticky_sessions: true,
            cache_warmup_bonus: 20.0,
            max_workers_per_group: 3,
            load_threshold: 80.0,
            affinity_duration: Duration::from_secs(60 * 60),
        }
    }
}

/// Keeps related tasks on warm workers.
#[derive(Debug, Default)]
pub struct AffinityStrategy {
    config: AffinityConfig,
    groups: HashMap<String, BTreeSet<WorkerId>>,
    worker_keys: HashMap<WorkerId, BTreeSet<String>>,
    last_used: HashMap<String, Instant>,
    sessions: HashMap<String, WorkerId>,
    known_workers: HashSet<WorkerId>,
    affinity_hits: u64,
    affinity_misses: u64,
    session_hits: u64,
    new_assignments: u64,
}

impl AffinityStrategy {
    pub const NAME: &'static str = "affinity";

    /// Creates the strategy.
    pub fn new(config: AffinityConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Affinity key of a task: `name:value` pairs joined by `|`.
    pub fn affinity_key(&self, task: &Task) -> String {
        let parts: Vec<String> = self
            .config
            .affinity_attributes
            .iter()
            .filter_map(|name| task.attribute(name).map(|value| format!("{}:{}", name, value)))
            .collect();
        if parts.is_empty() {
            DEFAULT_AFFINITY_KEY.to_string()
        } else {
            parts.join("|")
        }
    }

    /// Workers currently associated with a key.
    pub fn group(&self, key: &str) -> Option<&BTreeSet<WorkerId>> {
        self.groups.get(key)
    }

    fn key_count(&self, worker_id: &WorkerId) -> usize {
        self.worker_keys.get(worker_id).map(|k| k.len()).unwrap_or(0)
    }

    fn is_suitable(&self, info: &WorkerInfo) -> bool {
        info.cpu <= self.config.load_threshold
    }

    fn member_score(&self, info: &WorkerInfo, key: &str) -> f64 {
        let has_key = self
            .worker_keys
            .get(&info.id)
            .map(|keys| keys.contains(key))
            .unwrap_or(false);
        let warmup = if has_key { self.config.cache_warmup_bonus } else { 0.0 };
        let spread = (10.0 - self.key_count(&info.id) as f64 * 2.0).max(0.0);

        100.0 + warmup - info.cpu * 0.5 - info.memory.percent() * 0.3 + spread
    }

    fn recruit_score(&self, info: &WorkerInfo, now: Instant) -> f64 {
        let uptime = info.uptime(now).as_secs_f64() / RECENCY_WINDOW.as_secs_f64();
        let recency = 10.0 * (1.0 - uptime).max(0.0);

        50.0 - self.key_count(&info.id) as f64 * 10.0
            - info.cpu * 0.5
            - info.memory.fraction() * 50.0
            + recency
    }

    fn record(&mut self, key: &str, worker_id: &WorkerId, session: Option<&str>, now: Instant) {
        self.groups
            .entry(key.to_string())
            .or_default()
            .insert(worker_id.clone());
        self.worker_keys
            .entry(worker_id.clone())
            .or_default()
            .insert(key.to_string());
        self.touch(key, worker_id, session, now);
    }

    /// Refreshes the key and session without changing group membership.
    fn touch(&mut self, key: &str, worker_id: &WorkerId, session: Option<&str>, now: Instant) {
        self.last_used.insert(key.to_string(), now);
        self.known_workers.insert(worker_id.clone());

        if self.config.enable_sticky_sessions {
            if let Some(session) = session {
                self.sessions.insert(session.to_string(), worker_id.clone());
            }
        }
    }

    fn forget_key(&mut self, key: &str) {
        if let Some(members) = self.groups.remove(key) {
            for worker in members {
                if let Some(keys) = self.worker_keys.get_mut(&worker) {
                    keys.remove(key);
                }
            }
        }
        self.last_used.remove(key);
    }

    /// Fraction of keyed selections served by the existing group.
    pub fn hit_rate(&self) -> f64 {
        let total = self.affinity_hits + self.affinity_misses;
        if total == 0 {
            return 0.0;
        }
        self.affinity_hits as f64 / total as f64
    }
}

impl WorkerStrategy for AffinityStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initialize(&mut self, workers: &WorkerDirectory) {
        self.known_workers = workers.keys().cloned().collect();
    }

    fn select(
        &mut self,
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Result<Option<Selection>, StrategyError> {
        let now = Instant::now();
        let key = self.affinity_key(task);
        let session = task.session_id.as_deref();

        let candidates: Vec<&WorkerInfo> = available
            .iter()
            .filter_map(|id| workers.get(id))
            .filter(|info| self.is_suitable(info))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        // 1. Sticky session
        if self.config.enable_sticky_sessions {
            if let Some(pinned) = session.and_then(|s| self.sessions.get(s)) {
                if candidates.iter().any(|info| &info.id == pinned) {
                    let worker_id = pinned.clone();
                    self.session_hits += 1;
                    self.record(&key, &worker_id, session, now);
                    return Ok(Some(Selection::preferred(worker_id)));
                }
            }
        }

        // 2. Warm group members
        let group: BTreeSet<WorkerId> = self.groups.get(&key).cloned().unwrap_or_default();
        let members = candidates
            .iter()
            .filter(|info| group.contains(&info.id))
            .map(|info| (info.id.clone(), self.member_score(info, &key)))
            .collect::<Vec<_>>();
        if let Some((worker_id, _)) = pick_highest(members) {
            self.affinity_hits += 1;
            self.record(&key, &worker_id, session, now);
            return Ok(Some(Selection::preferred(worker_id)));
        }
        self.affinity_misses += 1;

        // 3. Recruit a new worker while the group has room
        if group.len() < self.config.max_workers_per_group {
            let recruits = candidates
                .iter()
                .filter(|info| !group.contains(&info.id))
                .map(|info| (info.id.clone(), self.recruit_score(info, now)))
                .collect::<Vec<_>>();
            if let Some((worker_id, _)) = pick_highest(recruits) {
                debug!(key = %key, worker_id = %worker_id, "Recruiting worker into affinity group");
                self.new_assignments += 1;
                self.record(&key, &worker_id, session, now);
                return Ok(Some(Selection::preferred(worker_id)));
            }
        }

        // Group is full and none of its members is free. Borrow the
        // healthiest outsider without enrolling it.
        let weights = ScoreWeights::default();
        let outsiders = candidates
            .iter()
            .map(|info| (info.id.clone(), health_score(info, &weights, now)))
            .collect::<Vec<_>>();
        match pick_highest(outsiders) {
            Some((worker_id, _)) => {
                self.touch(&key, &worker_id, session, now);
                Ok(Some(Selection::fallback(worker_id)))
            }
            None => Ok(None),
        }
    }

    fn on_worker_added(&mut self, worker_id: &WorkerId, _info: &WorkerInfo) {
        self.known_workers.insert(worker_id.clone());
    }

    fn on_worker_removed(&mut self, worker_id: &WorkerId) {
        self.known_workers.remove(worker_id);
        if let Some(keys) = self.worker_keys.remove(worker_id) {
            for key in keys {
                if let Some(members) = self.groups.get_mut(&key) {
                    members.remove(worker_id);
                    if members.is_empty() {
                        self.groups.remove(&key);
                    }
                }
            }
        }
        self.sessions.retain(|_, pinned| pinned != worker_id);
    }

    fn maintenance(&mut self, now: Instant) {
        let ttl = self.config.affinity_duration;
        let expired: Vec<String> = self
            .last_used
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.forget_key(key);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "Dropped stale affinity keys");
        }

        let known = &self.known_workers;
        self.sessions.retain(|_, worker| known.contains(worker));
        self.worker_keys.retain(|_, keys| !keys.is_empty());
    }

    fn details(&self) -> StrategyDetails {
        StrategyDetails::Affinity {
            affinity_hits: self.affinity_hits,
            affinity_misses: self.affinity_misses,
            session_hits: self.session_hits,
            new_assignments: self.new_assignments,
            active_keys: self.groups.len(),
            active_sessions: self.sessions.len(),
            hit_rate: self.hit_rate(),
        }
    }

    fn reset(&mut self) {
        self.groups.clear();
        self.worker_keys.clear();
        self.last_used.clear();
        self.sessions.clear();
        self.affinity_hits = 0;
        self.affinity_misses = 0;
        self.session_hits = 0;
        self.new_assignments = 0;
    }
}
