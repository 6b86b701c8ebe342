//! Worker process runtime.
//!
//! A worker is the `task-forge worker` subcommand started by the pool. It
//! announces itself with `ready`, runs one task at a time through a
//! [`TaskHandler`], reports `metrics` periodically, and exits on
//! `shutdown` or when the coordinator closes its stdin.
//!
//! # Example
//!
//! ```rust,ignore
//! use task_forge::worker::{BuiltinHandler, WorkerConfig, WorkerRuntime};
//!
//! let config = WorkerConfig::from_env()?;
//! WorkerRuntime::new(config, BuiltinHandler::new()).run().await?;
//! ```

pub mod handler;
pub mod runtime;
pub mod sampler;

pub use handler::{BuiltinHandler, TaskHandler, TaskReport};
pub use runtime::{WorkerConfig, WorkerRuntime};
pub use sampler::ResourceSampler;
