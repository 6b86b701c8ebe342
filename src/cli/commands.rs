//! CLI command definitions for task-forge.
//!
//! `run` starts a pool, submits tasks and reports how they were assigned;
//! `worker` is the process mode the pool launches; `strategies` lists the
//! registered assignment strategies.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::events::PoolEvent;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{PoolConfig, PoolStats, Task, TaskId, WorkerPool};
use crate::strategy::{ManagerMetrics, StrategyRegistry, COMPOSITE_STRATEGY};
use crate::worker::{BuiltinHandler, WorkerConfig, WorkerRuntime};

/// Task types cycled through by generated demo tasks.
const DEMO_TASK_TYPES: [&str; 4] = ["compile", "test", "lint", "analyze"];

/// Local worker-process pool with pluggable task assignment strategies.
#[derive(Parser)]
#[command(name = "task-forge")]
#[command(about = "Run tasks on a pool of worker processes with pluggable assignment strategies")]
#[command(version)]
#[command(
    long_about = "task-forge supervises a pool of worker processes and assigns tasks to them through a runtime-switchable strategy (round-robin, load-balancing, priority-based, affinity, resource-aware, or a weighted composite).\n\nExample usage:\n  task-forge run --count 20 --strategy affinity --min-workers 2 --max-workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start a pool, submit tasks, and print a summary.
    Run(RunArgs),

    /// Serve the worker protocol on stdin/stdout. Started by the pool.
    Worker,

    /// List the registered assignment strategies.
    Strategies(StrategiesArgs),
}

/// Arguments for `task-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML pool configuration. Without it, TASK_FORGE_* variables apply.
    #[arg(short = 'c', long, env = "TASK_FORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of demo tasks to generate when no task file is given.
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// JSON file with an array of tasks, or one task per line.
    #[arg(short = 't', long)]
    pub tasks: Option<PathBuf>,

    /// Sleep per demo task, in milliseconds.
    #[arg(long, default_value = "100")]
    pub sleep_ms: u64,

    /// Assignment strategy, overriding the configuration.
    #[arg(short = 's', long)]
    pub strategy: Option<String>,

    /// Strategy options as JSON.
    #[arg(long)]
    pub strategy_options: Option<String>,

    /// Minimum number of workers, overriding the configuration.
    #[arg(long)]
    pub min_workers: Option<usize>,

    /// Maximum number of workers, overriding the configuration.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Seconds to wait for all tasks to finish.
    #[arg(long, default_value = "300")]
    pub wait_secs: u64,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `task-forge strategies`.
#[derive(Parser, Debug)]
pub struct StrategiesArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pool_command(args).await,
        Commands::Worker => run_worker_command().await,
        Commands::Strategies(args) => run_strategies_command(args),
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    status: String,
    submitted: usize,
    completed: usize,
    failed: usize,
    timed_out: usize,
    unfinished: usize,
    elapsed_ms: u64,
    /// Tasks started per worker.
    assignments: BTreeMap<String, usize>,
    pool: PoolStats,
    strategies: Option<ManagerMetrics>,
}

fn load_pool_config(args: &RunArgs) -> anyhow::Result<PoolConfig> {
    let mut config = match &args.config {
        Some(path) => PoolConfig::from_yaml_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?,
        None => PoolConfig::from_env()?,
    };

    if let Some(min) = args.min_workers {
        config.min_workers = min;
    }
    if let Some(max) = args.max_workers {
        config.max_workers = max;
    }
    if let Some(name) = &args.strategy {
        config.strategy.name = name.clone();
        config.strategy.options = serde_json::Value::Null;
    }
    if let Some(options) = &args.strategy_options {
        config.strategy.options = serde_json::from_str(options)
            .map_err(|e| anyhow::anyhow!("Invalid --strategy-options JSON: {}", e))?;
    }

    config.validate()?;
    Ok(config)
}

fn load_tasks(path: &Path) -> anyhow::Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    if content.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(&content)?);
    }
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| anyhow::anyhow!("Invalid task on line {}: {}", i + 1, e))
        })
        .collect()
}

fn demo_tasks(count: usize, sleep_ms: u64) -> Vec<Task> {
    (0..count)
        .map(|i| {
            Task::with_payload(json!({ "sleepMs": sleep_ms, "index": i }))
                .with_type(DEMO_TASK_TYPES[i % DEMO_TASK_TYPES.len()])
                .with_project(format!("project-{}", i % 3))
        })
        .collect()
}

async fn run_pool_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_pool_config(&args)?;
    let tasks = match &args.tasks {
        Some(path) => load_tasks(path)?,
        None => demo_tasks(args.count, args.sleep_ms),
    };

    if args.metrics {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    let pool = WorkerPool::new(config)?;
    let mut events = pool.subscribe();
    pool.start().await?;

    let started = Instant::now();
    let mut pending: HashSet<TaskId> = HashSet::new();
    for task in tasks {
        pending.insert(pool.execute_task(task)?);
    }
    let mut summary = RunSummary {
        submitted: pending.len(),
        ..RunSummary::default()
    };
    info!(tasks = summary.submitted, "Tasks submitted");

    let deadline = tokio::time::sleep(Duration::from_secs(args.wait_secs));
    tokio::pin!(deadline);
    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut deadline => {
                warn!(unfinished = pending.len(), "Timed out waiting for tasks");
                break;
            }
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event subscriber lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let tracked = event.task_id().is_some_and(|id| pending.contains(id));
        if !tracked {
            continue;
        }
        match &event {
            PoolEvent::TaskStarted { worker_id, .. } => {
                *summary.assignments.entry(worker_id.to_string()).or_insert(0) += 1;
            }
            PoolEvent::TaskCompleted { .. } => summary.completed += 1,
            PoolEvent::TaskError { .. } => summary.failed += 1,
            PoolEvent::TaskTimeout { .. } => summary.timed_out += 1,
            _ => {}
        }
        if event.is_terminal() {
            if let Some(task_id) = event.task_id() {
                pending.remove(task_id);
            }
        }
    }

    summary.unfinished = pending.len();
    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    summary.pool = pool.stats().await?;
    summary.strategies = Some(pool.strategy_metrics().await?);
    summary.status = if summary.unfinished == 0 && summary.failed == 0 && summary.timed_out == 0 {
        "success".to_string()
    } else {
        "incomplete".to_string()
    };
    pool.shutdown().await?;

    if args.json {
        let json_output = serde_json::to_string_pretty(&summary)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
    } else {
        print_summary(&summary);
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let strategy = summary
        .pool
        .active_strategy
        .clone()
        .unwrap_or_else(|| "none".to_string());
    println!("✓ Run finished ({})", summary.status);
    println!("  Strategy: {}", strategy);
    println!(
        "  Tasks: {} submitted, {} completed, {} failed, {} timed out, {} unfinished",
        summary.submitted, summary.completed, summary.failed, summary.timed_out, summary.unfinished
    );
    println!(
        "  Workers: {} created, {} recycled",
        summary.pool.workers_created, summary.pool.workers_recycled
    );
    println!(
        "  Average task duration: {:.1} ms",
        summary.pool.average_task_duration_ms
    );
    if !summary.assignments.is_empty() {
        println!("  Assignments:");
        for (worker, count) in &summary.assignments {
            println!("    {}: {}", worker, count);
        }
    }
    println!("  Elapsed: {} ms", summary.elapsed_ms);
}

// ============================================================================
// Worker and Strategies Commands
// ============================================================================

async fn run_worker_command() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    WorkerRuntime::new(config, BuiltinHandler::new()).run().await?;
    Ok(())
}

fn strategy_names() -> Vec<String> {
    let mut names: Vec<String> = StrategyRegistry::with_builtin()
        .names()
        .into_iter()
        .map(String::from)
        .collect();
    names.push(COMPOSITE_STRATEGY.to_string());
    names
}

fn run_strategies_command(args: StrategiesArgs) -> anyhow::Result<()> {
    let names = strategy_names();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        for name in names {
            println!("{}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["task-forge", "run"]).expect("should parse");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.count, 10);
                assert_eq!(args.sleep_ms, 100);
                assert_eq!(args.wait_secs, 300);
                assert!(args.strategy.is_none());
                assert!(args.tasks.is_none());
                assert!(!args.json);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "task-forge",
            "run",
            "-n",
            "6",
            "-s",
            "affinity",
            "--strategy-options",
            "{\"maxWorkersPerGroup\": 2}",
            "--min-workers",
            "2",
            "--max-workers",
            "4",
            "-j",
            "--log-level",
            "debug",
        ])
        .expect("should parse");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.count, 6);
                assert_eq!(args.strategy.as_deref(), Some("affinity"));
                assert_eq!(args.min_workers, Some(2));
                assert_eq!(args.max_workers, Some(4));
                assert!(args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_worker_and_strategies_commands_parse() {
        let cli = Cli::try_parse_from(["task-forge", "worker"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Worker));

        let cli = Cli::try_parse_from(["task-forge", "strategies", "--json"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Strategies(StrategiesArgs { json: true })));
    }

    #[test]
    fn test_strategy_names_include_composite() {
        let names = strategy_names();
        assert!(names.contains(&"round-robin".to_string()));
        assert!(names.contains(&"resource-aware".to_string()));
        assert_eq!(names.last().map(String::as_str), Some(COMPOSITE_STRATEGY));
    }

    #[test]
    fn test_demo_tasks_cycle_types_and_projects() {
        let tasks = demo_tasks(5, 10);
        assert_eq!(tasks.len(), 5);
        assert_eq!(tasks[0].task_type.as_deref(), Some("compile"));
        assert_eq!(tasks[4].task_type.as_deref(), Some("compile"));
        assert_eq!(tasks[3].project_id.as_deref(), Some("project-0"));
        assert_eq!(tasks[1].payload["sleepMs"], 10);
    }

    #[test]
    fn test_load_tasks_array_and_lines() {
        let dir = tempfile::tempdir().unwrap();

        let array = dir.path().join("tasks.json");
        std::fs::write(&array, r#"[{"type": "lint"}, {"priority": "urgent"}]"#).unwrap();
        let tasks = load_tasks(&array).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_type.as_deref(), Some("lint"));

        let lines = dir.path().join("tasks.jsonl");
        std::fs::write(&lines, "{\"projectId\": \"a\"}\n\n{\"payload\": {\"fail\": \"x\"}}\n").unwrap();
        let tasks = load_tasks(&lines).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].project_id.as_deref(), Some("a"));
        assert_eq!(tasks[1].payload["fail"], "x");
    }
}
