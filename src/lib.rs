//! task_forge: local worker-process pool with pluggable assignment strategies.
//!
//! This library supervises a pool of worker processes, assigns submitted
//! tasks to them through runtime-switchable strategies, and reports every
//! lifecycle change as an event.

// Core modules
pub mod cli;
pub mod error;
pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod strategy;
pub mod worker;

// Re-export commonly used types
pub use error::{ConfigError, PoolError, ProtocolError, StrategyError, WorkerError};
pub use events::{EventBus, PoolEvent};
pub use scheduler::{PoolConfig, PoolStats, Task, TaskId, WorkerId, WorkerPool};
pub use strategy::{StrategyManager, StrategyRegistry, WorkerStrategy};
