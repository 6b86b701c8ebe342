//! Task assignment strategies.
//!
//! A strategy decides which available worker should run a task. All
//! strategies implement [`WorkerStrategy`]; the [`StrategyManager`] owns the
//! instantiated strategies, picks the active one (or a weighted composite),
//! and fans lifecycle events out to every instance so inactive strategies
//! keep learning.
//!
//! # Built-in strategies
//!
//! | name             | picks                                                   |
//! |------------------|---------------------------------------------------------|
//! | `round-robin`    | next worker in a stable cyclic order                    |
//! | `load-balancing` | lowest composite cpu/memory/busy load with trend penalty |
//! | `priority-based` | best worker of a tier allowed for the task's priority   |
//! | `affinity`       | a worker already warm for the task's affinity key       |
//! | `resource-aware` | a worker whose predicted headroom fits the requirement  |
//!
//! # Example
//!
//! ```rust,ignore
//! use task_forge::strategy::{StrategyManager, ManagerConfig, StrategyRegistry, StrategyContext};
//! use task_forge::events::EventBus;
//!
//! let mut manager = StrategyManager::new(
//!     StrategyRegistry::with_builtin(),
//!     StrategyContext::detect(),
//!     ManagerConfig::default(),
//!     EventBus::default(),
//! );
//! manager.set_strategy("load-balancing", &serde_json::Value::Null, &workers)?;
//! let worker = manager.select_worker(&task, &available, &workers);
//! ```

pub mod affinity;
pub mod base;
pub mod load_balancing;
pub mod manager;
pub mod priority;
pub mod registry;
pub mod resource_aware;
pub mod round_robin;

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use crate::error::StrategyError;
use crate::scheduler::{Task, TaskOutcome, WorkerDirectory, WorkerId, WorkerInfo};

pub use affinity::{AffinityConfig, AffinityStrategy};
pub use base::{ScoreWeights, SelectionStats, StrategyHandle};
pub use load_balancing::{LoadBalancingConfig, LoadBalancingStrategy};
pub use manager::{
    CompositeMember, CompositeOptions, ManagerConfig, ManagerMetrics, PerformanceSnapshot,
    StrategyManager, COMPOSITE_STRATEGY,
};
pub use priority::{PriorityBasedStrategy, PriorityConfig, WorkerTier};
pub use registry::{StrategyContext, StrategyFactory, StrategyRegistry};
pub use resource_aware::{ResourceAwareConfig, ResourceAwareStrategy, ResourceProfile};
pub use round_robin::{RoundRobinConfig, RoundRobinStrategy};

/// A strategy's decision for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub worker_id: WorkerId,
    /// The worker came from a fallback path outside the preferred candidates.
    pub fallback: bool,
}

impl Selection {
    /// A regular selection.
    pub fn preferred(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            fallback: false,
        }
    }

    /// A selection made by a fallback path.
    pub fn fallback(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            fallback: true,
        }
    }
}

/// Contract implemented by every assignment algorithm.
///
/// Strategies are owned by the coordinator and called sequentially; they
/// must not block. Lifecycle hooks default to no-ops.
pub trait WorkerStrategy: Send {
    /// Registered name of the strategy.
    fn name(&self) -> &'static str;

    /// Receives the current worker table when the strategy is instantiated.
    fn initialize(&mut self, _workers: &WorkerDirectory) {}

    /// Picks a worker from `available`, or `None` when nothing fits.
    ///
    /// `workers` holds every worker known to the pool, not only the
    /// available ones.
    fn select(
        &mut self,
        task: &Task,
        available: &[WorkerId],
        workers: &WorkerDirectory,
    ) -> Result<Option<Selection>, StrategyError>;

    /// Called after a task reaches a terminal outcome.
    fn on_task_completed(&mut self, _worker_id: &WorkerId, _task: &Task, _outcome: &TaskOutcome) {
    }

    /// Called when a worker completes its handshake.
    fn on_worker_added(&mut self, _worker_id: &WorkerId, _info: &WorkerInfo) {}

    /// Called when a worker leaves the pool.
    fn on_worker_removed(&mut self, _worker_id: &WorkerId) {}

    /// Called when a worker self-reports cpu/memory.
    fn on_worker_metrics(&mut self, _worker_id: &WorkerId, _info: &WorkerInfo) {}

    /// Periodic housekeeping (history purges, sweeps).
    fn maintenance(&mut self, _now: Instant) {}

    /// Algorithm-specific counters.
    fn details(&self) -> StrategyDetails;

    /// Drops all learned state.
    fn reset(&mut self);
}

/// Observability snapshot of one strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyMetrics {
    pub name: String,
    pub total_assignments: u64,
    pub successful_assignments: u64,
    pub failed_assignments: u64,
    /// Mean time spent inside `select`, in microseconds.
    pub average_assignment_time_us: f64,
    pub details: StrategyDetails,
}

/// Algorithm-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StrategyDetails {
    #[serde(rename_all = "camelCase")]
    RoundRobin {
        cursor: usize,
        known_workers: usize,
        skipped_workers: u64,
        fairness_index: f64,
    },
    #[serde(rename_all = "camelCase")]
    LoadBalancing {
        average_selected_load: f64,
        overloaded_rejections: u64,
        tracked_workers: usize,
    },
    #[serde(rename_all = "camelCase")]
    PriorityBased {
        by_priority: BTreeMap<String, u64>,
        by_tier: BTreeMap<String, u64>,
        fallback_selections: u64,
    },
    #[serde(rename_all = "camelCase")]
    Affinity {
        affinity_hits: u64,
        affinity_misses: u64,
        session_hits: u64,
        new_assignments: u64,
        active_keys: usize,
        active_sessions: usize,
        hit_rate: f64,
    },
    #[serde(rename_all = "camelCase")]
    ResourceAware {
        capable_selections: u64,
        overcommit_selections: u64,
        rejections: u64,
        learned_task_types: usize,
    },
    /// Strategies registered outside this crate.
    Custom { values: serde_json::Value },
}
