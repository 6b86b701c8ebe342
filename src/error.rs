//! Error types for task-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Worker pool lifecycle and worker provisioning
//! - Strategy configuration and selection
//! - Pool configuration loading
//! - Coordinator/worker message protocol
//! - Task execution inside a worker process

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running (never started or already shut down).
    #[error("Pool is not running")]
    NotRunning,

    /// A worker process could not be spawned.
    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(String),

    /// A worker did not complete the readiness handshake in time.
    #[error("Worker '{worker_id}' did not become ready within {timeout:?}")]
    ReadyTimeout { worker_id: String, timeout: Duration },

    /// A worker exited before completing the readiness handshake.
    #[error("Worker '{worker_id}' exited during startup: {reason}")]
    StartupExit { worker_id: String, reason: String },

    /// The pool is at `max_workers` and cannot grow.
    #[error("Pool is at capacity ({max} workers)")]
    AtCapacity { max: usize },

    /// The pool is shutting down and rejects new work.
    #[error("Pool is shutting down")]
    ShuttingDown,

    /// Strategy configuration was rejected.
    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// Pool configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised by assignment strategies and the strategy manager.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// No strategy is registered under this name.
    #[error("Unknown strategy '{0}'")]
    UnknownStrategy(String),

    /// Strategy options could not be interpreted.
    #[error("Invalid options for strategy '{strategy}': {message}")]
    InvalidOptions { strategy: String, message: String },

    /// A composite strategy was configured without constituents.
    #[error("Composite strategy requires at least one constituent strategy")]
    EmptyComposite,

    /// A composite strategy cannot contain itself.
    #[error("Composite strategy cannot be nested")]
    NestedComposite,

    /// A composite strategy lists the same constituent twice.
    #[error("Composite strategy lists '{0}' more than once")]
    DuplicateCompositeMember(String),

    /// A strategy with this name is already registered.
    #[error("Strategy '{0}' is already registered")]
    DuplicateStrategy(String),

    /// Internal failure while selecting a worker.
    #[error("Selection failed: {0}")]
    SelectionFailed(String),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors on the coordinator/worker message channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line could not be decoded as a protocol message.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The channel to the peer is closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error on the underlying pipe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised inside a worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The task handler reported a failure; the message is sent verbatim.
    #[error("{0}")]
    TaskFailed(String),

    /// A shell command could not be started.
    #[error("Failed to run command: {0}")]
    CommandFailed(#[source] std::io::Error),

    /// The coordinator channel failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = PoolError::ReadyTimeout {
            worker_id: "worker-1".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("worker-1"));
        assert!(err.to_string().contains("30"));

        let err = PoolError::AtCapacity { max: 4 };
        assert!(err.to_string().contains('4'));
    }

    #[test]
    fn test_strategy_error_converts_into_pool_error() {
        let err: PoolError = StrategyError::UnknownStrategy("fastest".to_string()).into();
        assert!(matches!(err, PoolError::Strategy(_)));
        assert!(err.to_string().contains("fastest"));
    }

    #[test]
    fn test_protocol_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(err.to_string().starts_with("Malformed message"));
    }

    #[test]
    fn test_task_failure_message_is_verbatim() {
        let err = WorkerError::TaskFailed("disk full".to_string());
        assert_eq!(err.to_string(), "disk full");
    }
}
