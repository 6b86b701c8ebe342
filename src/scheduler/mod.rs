//! Process-based worker pool.
//!
//! This module provides the coordinator side of task execution:
//!
//! - **Task**: unit of work with strategy-visible attributes and an opaque payload
//! - **WorkerInfo**: coordinator view of one worker process
//! - **WorkerPool**: supervises worker processes and assigns tasks through
//!   the strategy manager
//! - **protocol**: newline-delimited JSON messages between coordinator and workers
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Caller    │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ execute_task
//!                      ┌──────▼───────┐
//!                      │ Coordinator  │──── StrategyManager
//!                      │  (backlog)   │
//!                      └──────┬───────┘
//!                             │ stdin/stdout
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use task_forge::scheduler::{PoolConfig, Task, WorkerPool};
//! use serde_json::json;
//!
//! let pool = WorkerPool::new(PoolConfig::default().with_min_workers(2))?;
//! let mut events = pool.subscribe();
//! pool.start().await?;
//!
//! let task = Task::with_payload(json!({"command": "cargo test"}))
//!     .with_type("test")
//!     .with_project("forge");
//! let task_id = pool.execute_task(task)?;
//!
//! pool.shutdown().await?;
//! ```

pub mod config;
pub mod process;
pub mod protocol;
pub mod task;
pub mod worker;
pub mod worker_pool;

pub use config::{PoolConfig, StrategySettings, WorkerCommand};
pub use process::{ProcessEvent, WorkerHandle};
pub use protocol::{decode_line, encode_line, CoordinatorMessage, WorkerMessage};
pub use task::{
    PriorityLevel, ResourceRequirements, ResourceUsage, Task, TaskId, TaskOutcome, TaskPriority,
    TaskStatus,
};
pub use worker::{
    available_ids, HostCapabilities, MemorySample, WorkerDirectory, WorkerId, WorkerInfo,
    WorkerState,
};
pub use worker_pool::{PoolStats, WorkerPool};
