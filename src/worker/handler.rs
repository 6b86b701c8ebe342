//! Task handlers executed inside a worker process.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::error::WorkerError;
use crate::scheduler::{ResourceUsage, Task};

/// Output of a successful task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub result: Value,
    /// Observed resource use; the runtime fills in a sample when absent.
    pub usage: Option<ResourceUsage>,
}

impl TaskReport {
    /// A report without usage data.
    pub fn new(result: Value) -> Self {
        Self {
            result,
            usage: None,
        }
    }
}

/// Executes tasks received from the coordinator.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one task. An error is reported to the coordinator as `task-error`.
    async fn handle(&self, task: &Task) -> Result<TaskReport, WorkerError>;
}

/// Handler interpreting the task payload.
///
/// - `{"sleepMs": n}` sleeps first
/// - `{"fail": "msg"}` fails with `msg`
/// - `{"command": "..."}` runs the command with `sh -c`
/// - anything else is echoed back
#[derive(Debug, Clone, Default)]
pub struct BuiltinHandler;

impl BuiltinHandler {
    pub fn new() -> Self {
        Self
    }

    async fn run_command(&self, command: &str) -> Result<TaskReport, WorkerError> {
        debug!(command = %command, "Running task command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(WorkerError::CommandFailed)?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(WorkerError::TaskFailed(format!(
                "command exited with {}: {}",
                code, stderr
            )));
        }

        Ok(TaskReport::new(json!({
            "exitCode": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        })))
    }
}

#[async_trait]
impl TaskHandler for BuiltinHandler {
    async fn handle(&self, task: &Task) -> Result<TaskReport, WorkerError> {
        let payload = &task.payload;

        if let Some(ms) = payload.get("sleepMs").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        if let Some(message) = payload.get("fail") {
            let message = match message {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(WorkerError::TaskFailed(message));
        }

        if let Some(command) = payload.get("command").and_then(Value::as_str) {
            return self.run_command(command).await;
        }

        Ok(TaskReport::new(payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_payload() {
        let task = Task::with_payload(json!({"value": 42}));
        let report = BuiltinHandler::new().handle(&task).await.unwrap();
        assert_eq!(report.result, json!({"value": 42}));
        assert!(report.usage.is_none());
    }

    #[tokio::test]
    async fn test_fail_payload_is_verbatim() {
        let task = Task::with_payload(json!({"fail": "boom"}));
        let err = BuiltinHandler::new().handle(&task).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_sleep_then_echo() {
        let task = Task::with_payload(json!({"sleepMs": 20}));
        let started = std::time::Instant::now();
        let report = BuiltinHandler::new().handle(&task).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(report.result["sleepMs"], 20);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output_and_failure() {
        let handler = BuiltinHandler::new();

        let ok = Task::with_payload(json!({"command": "echo hello"}));
        let report = handler.handle(&ok).await.unwrap();
        assert_eq!(report.result["stdout"], "hello");
        assert_eq!(report.result["exitCode"], 0);

        let bad = Task::with_payload(json!({"command": "echo oops >&2; exit 4"}));
        let err = handler.handle(&bad).await.unwrap_err();
        assert_eq!(err.to_string(), "command exited with 4: oops");
    }
}
