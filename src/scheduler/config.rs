//! Worker pool configuration.
//!
//! Configuration comes from code (`Default` + `with_*` builders), from
//! `TASK_FORGE_*` environment variables, or from a YAML file. Durations in
//! files are milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

use super::worker::HostCapabilities;

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Program and arguments used to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Creates a command.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }
}

/// Initial strategy and manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategySettings {
    /// Strategy activated at start, or `composite`.
    pub name: String,
    /// Options passed to the strategy factory.
    pub options: serde_json::Value,
    pub enable_dynamic_switching: bool,
    #[serde(with = "duration_ms")]
    pub evaluation_window: Duration,
    pub switching_threshold: f64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            name: "round-robin".to_string(),
            options: serde_json::Value::Null,
            enable_dynamic_switching: false,
            evaluation_window: Duration::from_secs(5 * 60),
            switching_threshold: 0.7,
        }
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Workers kept alive at all times.
    pub min_workers: usize,
    /// Upper bound on live workers.
    pub max_workers: usize,
    /// Idle time after which workers above the minimum are stopped.
    #[serde(with = "duration_ms")]
    pub worker_idle_timeout: Duration,
    /// Completed tasks after which a worker is replaced.
    pub worker_recycle_after: u64,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Timeout for tasks that do not set their own.
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    /// Time allowed for the readiness handshake.
    #[serde(with = "duration_ms")]
    pub ready_timeout: Duration,
    /// Time a worker gets to exit after `shutdown` before it is killed.
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
    /// Interval of strategy housekeeping.
    #[serde(with = "duration_ms")]
    pub maintenance_interval: Duration,
    /// Interval of worker self-reports.
    #[serde(with = "duration_ms")]
    pub metrics_interval: Duration,
    /// Memory budget reported by workers, in megabytes.
    pub worker_memory_limit_mb: Option<u64>,
    /// Worker process command. Defaults to this executable in worker mode.
    pub worker_command: Option<WorkerCommand>,
    /// Host capabilities; detected when absent.
    pub capabilities: Option<HostCapabilities>,
    /// Capacity of the event broadcast buffer.
    pub event_capacity: usize,
    pub strategy: StrategySettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            worker_idle_timeout: Duration::from_secs(60),
            worker_recycle_after: 100,
            health_check_interval: Duration::from_secs(30),
            task_timeout: Duration::from_secs(10 * 60),
            ready_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(5 * 60),
            metrics_interval: Duration::from_secs(5),
            worker_memory_limit_mb: None,
            worker_command: None,
            capabilities: None,
            event_capacity: 1024,
            strategy: StrategySettings::default(),
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// Recognised variables:
    /// - `TASK_FORGE_MIN_WORKERS`, `TASK_FORGE_MAX_WORKERS`
    /// - `TASK_FORGE_WORKER_IDLE_TIMEOUT_MS`, `TASK_FORGE_WORKER_RECYCLE_AFTER`
    /// - `TASK_FORGE_HEALTH_CHECK_INTERVAL_MS`, `TASK_FORGE_TASK_TIMEOUT_MS`
    /// - `TASK_FORGE_READY_TIMEOUT_MS`, `TASK_FORGE_SHUTDOWN_GRACE_MS`
    /// - `TASK_FORGE_METRICS_INTERVAL_MS`, `TASK_FORGE_WORKER_MEMORY_LIMIT_MB`
    /// - `TASK_FORGE_STRATEGY`, `TASK_FORGE_STRATEGY_OPTIONS` (JSON)
    /// - `TASK_FORGE_DYNAMIC_SWITCHING`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed,
    /// or `ConfigError::ValidationFailed` if the result is inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASK_FORGE_MIN_WORKERS") {
            config.min_workers = parse_env_value(&val, "TASK_FORGE_MIN_WORKERS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "TASK_FORGE_MAX_WORKERS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_WORKER_IDLE_TIMEOUT_MS") {
            config.worker_idle_timeout = parse_env_millis(&val, "TASK_FORGE_WORKER_IDLE_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_WORKER_RECYCLE_AFTER") {
            config.worker_recycle_after = parse_env_value(&val, "TASK_FORGE_WORKER_RECYCLE_AFTER")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_HEALTH_CHECK_INTERVAL_MS") {
            config.health_check_interval =
                parse_env_millis(&val, "TASK_FORGE_HEALTH_CHECK_INTERVAL_MS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_TASK_TIMEOUT_MS") {
            config.task_timeout = parse_env_millis(&val, "TASK_FORGE_TASK_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_READY_TIMEOUT_MS") {
            config.ready_timeout = parse_env_millis(&val, "TASK_FORGE_READY_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = parse_env_millis(&val, "TASK_FORGE_SHUTDOWN_GRACE_MS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_METRICS_INTERVAL_MS") {
            config.metrics_interval = parse_env_millis(&val, "TASK_FORGE_METRICS_INTERVAL_MS")?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_WORKER_MEMORY_LIMIT_MB") {
            config.worker_memory_limit_mb =
                Some(parse_env_value(&val, "TASK_FORGE_WORKER_MEMORY_LIMIT_MB")?);
        }
        if let Ok(val) = std::env::var("TASK_FORGE_STRATEGY") {
            config.strategy.name = val;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_STRATEGY_OPTIONS") {
            config.strategy.options =
                serde_json::from_str(&val).map_err(|e| ConfigError::InvalidValue {
                    key: "TASK_FORGE_STRATEGY_OPTIONS".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Ok(val) = std::env::var("TASK_FORGE_DYNAMIC_SWITCHING") {
            config.strategy.enable_dynamic_switching =
                parse_env_bool(&val, "TASK_FORGE_DYNAMIC_SWITCHING")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file. Missing keys take defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(format!(
                "min_workers ({}) cannot exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }

        if self.worker_recycle_after == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_recycle_after must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("health_check_interval", self.health_check_interval),
            ("task_timeout", self.task_timeout),
            ("ready_timeout", self.ready_timeout),
            ("maintenance_interval", self.maintenance_interval),
            ("metrics_interval", self.metrics_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.strategy.name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "strategy name cannot be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.strategy.switching_threshold) {
            return Err(ConfigError::ValidationFailed(
                "switching_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.strategy.evaluation_window.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "evaluation_window must be greater than 0".to_string(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the minimum number of workers.
    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    /// Builder method to set the maximum number of workers.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Builder method to set the idle timeout.
    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    /// Builder method to set the recycle threshold.
    pub fn with_worker_recycle_after(mut self, tasks: u64) -> Self {
        self.worker_recycle_after = tasks;
        self
    }

    /// Builder method to set the health check interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Builder method to set the default task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Builder method to set the readiness handshake timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Builder method to set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Builder method to set the strategy maintenance interval.
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Builder method to set the worker metrics interval.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Builder method to set the worker memory budget.
    pub fn with_worker_memory_limit_mb(mut self, limit: u64) -> Self {
        self.worker_memory_limit_mb = Some(limit);
        self
    }

    /// Builder method to set the worker command.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Builder method to set host capabilities.
    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Builder method to set the initial strategy.
    pub fn with_strategy(mut self, name: impl Into<String>, options: serde_json::Value) -> Self {
        self.strategy.name = name.into();
        self.strategy.options = options;
        self
    }

    /// Builder method to enable performance-based strategy switching.
    pub fn with_dynamic_switching(mut self, enabled: bool) -> Self {
        self.strategy.enable_dynamic_switching = enabled;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding milliseconds.
fn parse_env_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_millis)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
