//! Command-line interface for task-forge.
//!
//! Provides commands for running a worker pool, serving as a worker
//! process, and listing assignment strategies.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
