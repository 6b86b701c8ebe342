//! Coordinator/worker message protocol.
//!
//! Messages are exchanged as newline-delimited JSON over the worker's
//! stdin (coordinator to worker) and stdout (worker to coordinator).
//! Each message is an object with a kebab-case `type` tag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

use super::task::{ResourceUsage, Task, TaskId};
use super::worker::{MemorySample, WorkerId};

/// Messages sent by a worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// Readiness handshake.
    #[serde(rename_all = "camelCase")]
    Ready { worker_id: WorkerId },

    /// Successful task completion.
    #[serde(rename_all = "camelCase")]
    TaskResult {
        task_id: TaskId,
        result: serde_json::Value,
        /// Execution time in milliseconds.
        duration: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<ResourceUsage>,
    },

    /// Task failed inside the worker.
    #[serde(rename_all = "camelCase")]
    TaskError { task_id: TaskId, error: String },

    /// Periodic self-report.
    #[serde(rename_all = "camelCase")]
    Metrics { cpu: f64, memory: MemorySample },
}

/// Messages sent by the coordinator to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoordinatorMessage {
    /// Run a task.
    ExecuteTask { task: Task },
    /// Liveness probe; no reply expected.
    Ping,
    /// Exit voluntarily.
    Shutdown,
}

/// Encodes a message as one protocol line, including the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decodes one protocol line.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_message_wire_names() {
        let line = encode_line(&WorkerMessage::Ready {
            worker_id: WorkerId::from("worker-1"),
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"ready\",\"workerId\":\"worker-1\"}\n");

        let value: serde_json::Value = serde_json::to_value(WorkerMessage::TaskError {
            task_id: TaskId::from("t-1"),
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(value["type"], "task-error");
        assert_eq!(value["taskId"], "t-1");
    }

    #[test]
    fn test_decode_task_result_without_usage() {
        let msg: WorkerMessage =
            decode_line(r#"{"type":"task-result","taskId":"t-7","result":{"ok":true},"duration":42}"#)
                .unwrap();
        assert_eq!(
            msg,
            WorkerMessage::TaskResult {
                task_id: TaskId::from("t-7"),
                result: json!({"ok": true}),
                duration: 42,
                usage: None,
            }
        );
    }

    #[test]
    fn test_coordinator_message_wire_names() {
        let ping = encode_line(&CoordinatorMessage::Ping).unwrap();
        assert_eq!(ping, "{\"type\":\"ping\"}\n");

        let exec = serde_json::to_value(CoordinatorMessage::ExecuteTask {
            task: Task::new().with_id("t-1"),
        })
        .unwrap();
        assert_eq!(exec["type"], "execute-task");
        assert_eq!(exec["task"]["id"], "t-1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<WorkerMessage, _> = decode_line("hello world");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));

        let result: Result<WorkerMessage, _> = decode_line(r#"{"type":"unknown"}"#);
        assert!(result.is_err());
    }
}
