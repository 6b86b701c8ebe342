//! Pool and strategy events.
//!
//! Every observable state change of the pool and the strategy manager is
//! published as a `PoolEvent` on an `EventBus`. Subscribers (dashboards,
//! loggers, tests) receive events through a tokio broadcast channel.
//! Event names on the wire are the kebab-case `type` tags.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::scheduler::{TaskId, WorkerId};

/// Default capacity of the broadcast buffer.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events emitted by the pool and the strategy manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PoolEvent {
    #[serde(rename_all = "camelCase")]
    WorkerCreated { worker_id: WorkerId },

    #[serde(rename_all = "camelCase")]
    WorkerExit {
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
        reason: String,
    },

    #[serde(rename_all = "camelCase")]
    TaskQueued { task_id: TaskId, backlog: usize },

    #[serde(rename_all = "camelCase")]
    TaskStarted { task_id: TaskId, worker_id: WorkerId },

    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        result: serde_json::Value,
        /// Milliseconds.
        duration: u64,
    },

    #[serde(rename_all = "camelCase")]
    TaskError {
        task_id: TaskId,
        worker_id: WorkerId,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    TaskTimeout {
        task_id: TaskId,
        worker_id: WorkerId,
        /// Milliseconds.
        timeout: u64,
    },

    #[serde(rename_all = "camelCase")]
    WorkerRecycling {
        worker_id: WorkerId,
        tasks_processed: u64,
    },

    #[serde(rename_all = "camelCase")]
    StrategyChanged { from: Option<String>, to: String },

    #[serde(rename_all = "camelCase")]
    AutoSwitching {
        from: String,
        to: String,
        from_rate: f64,
        to_rate: f64,
    },

    #[serde(rename_all = "camelCase")]
    WorkerSelected {
        strategy: String,
        task_id: String,
        worker_id: WorkerId,
        duration_us: u64,
        /// True when the strategy fell back outside its preferred candidates.
        fallback: bool,
    },

    #[serde(rename_all = "camelCase")]
    SelectionError {
        strategy: String,
        task_id: String,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    AssignmentFailed {
        strategy: String,
        task_id: String,
        reason: String,
    },
}

impl PoolEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::WorkerCreated { .. } => "worker-created",
            PoolEvent::WorkerExit { .. } => "worker-exit",
            PoolEvent::TaskQueued { .. } => "task-queued",
            PoolEvent::TaskStarted { .. } => "task-started",
            PoolEvent::TaskCompleted { .. } => "task-completed",
            PoolEvent::TaskError { .. } => "task-error",
            PoolEvent::TaskTimeout { .. } => "task-timeout",
            PoolEvent::WorkerRecycling { .. } => "worker-recycling",
            PoolEvent::StrategyChanged { .. } => "strategy-changed",
            PoolEvent::AutoSwitching { .. } => "auto-switching",
            PoolEvent::WorkerSelected { .. } => "worker-selected",
            PoolEvent::SelectionError { .. } => "selection-error",
            PoolEvent::AssignmentFailed { .. } => "assignment-failed",
        }
    }

    /// Task id carried by task lifecycle events.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            PoolEvent::TaskQueued { task_id, .. }
            | PoolEvent::TaskStarted { task_id, .. }
            | PoolEvent::TaskCompleted { task_id, .. }
            | PoolEvent::TaskError { task_id, .. }
            | PoolEvent::TaskTimeout { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Returns true for events that end a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PoolEvent::TaskCompleted { .. }
                | PoolEvent::TaskError { .. }
                | PoolEvent::TaskTimeout { .. }
        )
    }
}

/// Broadcast bus for `PoolEvent`s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Creates a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Events are dropped when nobody listens.
    pub fn emit(&self, event: PoolEvent) {
        tracing::trace!(event = event.name(), "Emitting pool event");
        // Ignore send errors - there may be no subscribers
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    /// Subscribes as a `Stream`. Lagged receivers yield an error item.
    pub fn stream(&self) -> BroadcastStream<PoolEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
