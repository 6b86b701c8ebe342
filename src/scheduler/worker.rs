//! Worker records as seen by the coordinator.
//!
//! The pool keeps exactly one `WorkerInfo` per live worker process in a
//! single table keyed by `WorkerId`. The "available" set is a filtered
//! view over that table, never a separate structure.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::System;
use uuid::Uuid;

use super::task::TaskId;

/// Opaque unique identifier of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generates a fresh worker id.
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}", &raw[..12]))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Spawned, waiting for the `ready` handshake.
    Initializing,
    /// Idle and selectable.
    Available,
    /// Running exactly one task.
    Busy,
    /// Draining or being torn down.
    Stopping,
}

impl WorkerState {
    /// Returns the lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Initializing => "initializing",
            WorkerState::Available => "available",
            WorkerState::Busy => "busy",
            WorkerState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory gauge reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    /// Resident memory in megabytes.
    pub used_mb: f64,
    /// Memory budget of the worker in megabytes.
    pub limit_mb: f64,
}

impl MemorySample {
    /// Creates a sample.
    pub fn new(used_mb: f64, limit_mb: f64) -> Self {
        Self { used_mb, limit_mb }
    }

    /// Fraction of the budget in use (0.0-1.0). Zero when no budget is known.
    pub fn fraction(&self) -> f64 {
        if self.limit_mb <= 0.0 {
            return 0.0;
        }
        (self.used_mb / self.limit_mb).clamp(0.0, 1.0)
    }

    /// Percent of the budget in use (0-100).
    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

/// Compute capacity used for tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapabilities {
    pub cpu_cores: usize,
    pub total_memory_mb: u64,
}

impl HostCapabilities {
    /// Creates an explicit capability value.
    pub fn new(cpu_cores: usize, total_memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            total_memory_mb,
        }
    }

    /// Detects the capabilities of the current host.
    pub fn detect() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut system = System::new();
        system.refresh_memory();
        let total_memory_mb = system.total_memory() / (1024 * 1024);

        Self {
            cpu_cores,
            total_memory_mb,
        }
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}

/// Coordinator-side view of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub state: WorkerState,
    /// Set exactly when `state` is `Busy`.
    pub current_task: Option<TaskId>,
    pub tasks_processed: u64,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Latest self-reported CPU percent.
    pub cpu: f64,
    /// Latest self-reported memory.
    pub memory: MemorySample,
    /// Per-worker capabilities; strategies fall back to the host value.
    pub capabilities: Option<HostCapabilities>,
}

impl WorkerInfo {
    /// Creates a record for a freshly spawned worker.
    pub fn new(id: WorkerId, now: Instant) -> Self {
        Self {
            id,
            state: WorkerState::Initializing,
            current_task: None,
            tasks_processed: 0,
            created_at: now,
            last_activity: now,
            cpu: 0.0,
            memory: MemorySample::default(),
            capabilities: None,
        }
    }

    /// Sets per-worker capabilities.
    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Time since the worker was created.
    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since the last state change or report.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Returns true if the worker can take a task.
    pub fn is_available(&self) -> bool {
        self.state == WorkerState::Available
    }

    /// Returns true if a task is assigned.
    pub fn has_task(&self) -> bool {
        self.current_task.is_some()
    }

    /// Marks the handshake complete.
    pub fn mark_ready(&mut self, now: Instant) {
        self.state = WorkerState::Available;
        self.last_activity = now;
    }

    /// Assigns a task. Returns false if the worker is not available.
    pub fn assign(&mut self, task_id: TaskId, now: Instant) -> bool {
        if self.state != WorkerState::Available {
            return false;
        }
        self.state = WorkerState::Busy;
        self.current_task = Some(task_id);
        self.last_activity = now;
        true
    }

    /// Clears the current task and counts it as processed.
    pub fn release(&mut self, now: Instant) -> Option<TaskId> {
        let task = self.current_task.take();
        if task.is_some() {
            self.tasks_processed += 1;
        }
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Available;
        }
        self.last_activity = now;
        task
    }

    /// Moves the worker into teardown.
    pub fn mark_stopping(&mut self) -> Option<TaskId> {
        self.state = WorkerState::Stopping;
        self.current_task.take()
    }

    /// Applies a self-reported metrics sample.
    pub fn record_metrics(&mut self, cpu: f64, memory: MemorySample) {
        self.cpu = cpu.max(0.0);
        self.memory = memory;
    }
}

/// The pool's worker table, ordered by id.
pub type WorkerDirectory = BTreeMap<WorkerId, WorkerInfo>;

/// Ids of all `Available` workers in the directory.
pub fn available_ids(workers: &WorkerDirectory) -> Vec<WorkerId> {
    workers
        .values()
        .filter(|w| w.is_available())
        .map(|w| w.id.clone())
        .collect()
}
