//! Task definitions for the scheduler.
//!
//! This module defines the unit of work submitted to the pool:
//!
//! - `Task`: caller-defined attributes interpreted by strategies, plus an
//!   opaque payload interpreted by the worker's handler
//! - `TaskPriority` / `PriorityLevel`: explicit or numeric priority
//! - `ResourceRequirements`: declared cpu/memory/timeout needs
//! - `TaskOutcome`: terminal result reported back to strategies

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh random task id.
    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4().simple()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Named priority levels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Urgent,
    High,
    Normal,
    Low,
    Background,
}

impl PriorityLevel {
    /// All levels, highest first.
    pub const ALL: [PriorityLevel; 5] = [
        PriorityLevel::Urgent,
        PriorityLevel::High,
        PriorityLevel::Normal,
        PriorityLevel::Low,
        PriorityLevel::Background,
    ];

    /// Minimum numeric priority for this level.
    pub fn threshold(&self) -> i64 {
        match self {
            PriorityLevel::Urgent => 100,
            PriorityLevel::High => 75,
            PriorityLevel::Normal => 50,
            PriorityLevel::Low => 25,
            PriorityLevel::Background => i64::MIN,
        }
    }

    /// Maps a numeric priority by descending threshold match.
    pub fn from_numeric(value: i64) -> Self {
        Self::ALL
            .into_iter()
            .find(|level| value >= level.threshold())
            .unwrap_or(PriorityLevel::Background)
    }

    /// Infers a level from hints in a task type name.
    pub fn from_type_hint(task_type: &str) -> Option<Self> {
        let lowered = task_type.to_lowercase();
        if lowered.contains("urgent") || lowered.contains("emergency") {
            Some(PriorityLevel::Urgent)
        } else if lowered.contains("high") || lowered.contains("important") {
            Some(PriorityLevel::High)
        } else if lowered.contains("low") || lowered.contains("background") {
            Some(PriorityLevel::Low)
        } else {
            None
        }
    }

    /// Returns the lowercase name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityLevel::Urgent => "urgent",
            PriorityLevel::High => "high",
            PriorityLevel::Normal => "normal",
            PriorityLevel::Low => "low",
            PriorityLevel::Background => "background",
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "urgent" => Ok(PriorityLevel::Urgent),
            "high" => Ok(PriorityLevel::High),
            "normal" => Ok(PriorityLevel::Normal),
            "low" => Ok(PriorityLevel::Low),
            "background" => Ok(PriorityLevel::Background),
            other => Err(format!("unknown priority level '{}'", other)),
        }
    }
}

/// Task priority as supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPriority {
    /// One of the named levels.
    Level(PriorityLevel),
    /// A number resolved by threshold.
    Numeric(i64),
}

impl TaskPriority {
    /// Resolves to a named level.
    pub fn level(&self) -> PriorityLevel {
        match self {
            TaskPriority::Level(level) => *level,
            TaskPriority::Numeric(value) => PriorityLevel::from_numeric(*value),
        }
    }
}

/// Declared resource needs of a task. Any field may be omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// CPU percent (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Memory in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<f64>,
    /// Expected runtime in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Observed resource use of a finished task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak CPU percent.
    pub cpu: f64,
    /// Peak memory in megabytes.
    pub memory: f64,
}

/// A unit of work submitted to the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Assigned by the pool when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<ResourceRequirements>,
    /// Execution timeout in milliseconds.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Handler input, opaque to the pool and strategies.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates an empty task with a null payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task carrying the given handler payload.
    pub fn with_payload(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    /// Sets an explicit id.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the task type.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Sets a named priority.
    pub fn with_priority(mut self, level: PriorityLevel) -> Self {
        self.priority = Some(TaskPriority::Level(level));
        self
    }

    /// Sets a numeric priority.
    pub fn with_numeric_priority(mut self, value: i64) -> Self {
        self.priority = Some(TaskPriority::Numeric(value));
        self
    }

    /// Sets the project id.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the repository.
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    /// Sets the session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets resource requirements.
    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.requirements = Some(requirements);
        self
    }

    /// Sets the execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Returns the task id, or a placeholder for unassigned tasks.
    pub fn id_label(&self) -> String {
        self.id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unassigned".to_string())
    }

    /// Execution timeout, if the task sets one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Resolved priority level, from explicit priority, type hints, or `Normal`.
    pub fn priority_level(&self) -> PriorityLevel {
        if let Some(priority) = self.priority {
            return priority.level();
        }
        self.task_type
            .as_deref()
            .and_then(PriorityLevel::from_type_hint)
            .unwrap_or(PriorityLevel::Normal)
    }

    /// Looks up a named attribute, falling back to string or number payload fields.
    pub fn attribute(&self, name: &str) -> Option<String> {
        let known = match name {
            "projectId" => self.project_id.clone(),
            "repository" => self.repository.clone(),
            "type" => self.task_type.clone(),
            "sessionId" => self.session_id.clone(),
            "priority" => self.priority.map(|p| p.level().to_string()),
            _ => None,
        };
        if known.is_some() {
            return known;
        }

        match self.payload.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    /// Returns the status label.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed-out",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of an assigned task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The worker returned a result.
    Completed {
        result: serde_json::Value,
        duration: Duration,
        usage: Option<ResourceUsage>,
    },
    /// The worker reported an error, or died while running the task.
    Failed { error: String, duration: Duration },
    /// The coordinator's timer fired first.
    TimedOut { after: Duration },
}

impl TaskOutcome {
    /// Returns true for a completed task.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    /// Resource usage reported alongside a result.
    pub fn usage(&self) -> Option<ResourceUsage> {
        match self {
            TaskOutcome::Completed { usage, .. } => *usage,
            _ => None,
        }
    }

    /// Time between dispatch and outcome.
    pub fn duration(&self) -> Duration {
        match self {
            TaskOutcome::Completed { duration, .. } | TaskOutcome::Failed { duration, .. } => {
                *duration
            }
            TaskOutcome::TimedOut { after } => *after,
        }
    }

    /// Terminal status for this outcome.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::TimedOut { .. } => TaskStatus::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_priority_thresholds() {
        assert_eq!(PriorityLevel::from_numeric(150), PriorityLevel::Urgent);
        assert_eq!(PriorityLevel::from_numeric(100), PriorityLevel::Urgent);
        assert_eq!(PriorityLevel::from_numeric(80), PriorityLevel::High);
        assert_eq!(PriorityLevel::from_numeric(50), PriorityLevel::Normal);
        assert_eq!(PriorityLevel::from_numeric(30), PriorityLevel::Low);
        assert_eq!(PriorityLevel::from_numeric(-5), PriorityLevel::Background);
    }

    #[test]
    fn test_priority_from_type_hints() {
        let task = Task::new().with_type("emergency-fix");
        assert_eq!(task.priority_level(), PriorityLevel::Urgent);

        let task = Task::new().with_type("important_review");
        assert_eq!(task.priority_level(), PriorityLevel::High);

        let task = Task::new().with_type("background-index");
        assert_eq!(task.priority_level(), PriorityLevel::Low);

        let task = Task::new().with_type("compile");
        assert_eq!(task.priority_level(), PriorityLevel::Normal);
    }

    #[test]
    fn test_explicit_priority_wins_over_type_hint() {
        let task = Task::new()
            .with_type("urgent-thing")
            .with_priority(PriorityLevel::Low);
        assert_eq!(task.priority_level(), PriorityLevel::Low);
    }

    #[test]
    fn test_task_deserializes_wire_shape() {
        let task: Task = serde_json::from_value(json!({
            "id": "t-1",
            "type": "compile",
            "priority": "high",
            "projectId": "alpha",
            "sessionId": "s-9",
            "requirements": {"cpu": 40.0, "memory": 1024.0},
            "timeout": 5000,
            "payload": {"sleepMs": 10}
        }))
        .unwrap();

        assert_eq!(task.id, Some(TaskId::from("t-1")));
        assert_eq!(task.task_type.as_deref(), Some("compile"));
        assert_eq!(task.priority, Some(TaskPriority::Level(PriorityLevel::High)));
        assert_eq!(task.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(task.requirements.unwrap().memory, Some(1024.0));
    }

    #[test]
    fn test_numeric_priority_deserializes() {
        let task: Task = serde_json::from_value(json!({"priority": 80})).unwrap();
        assert_eq!(task.priority, Some(TaskPriority::Numeric(80)));
        assert_eq!(task.priority_level(), PriorityLevel::High);
    }

    #[test]
    fn test_attribute_lookup_falls_back_to_payload() {
        let task = Task::with_payload(json!({"branch": "main", "shard": 3}))
            .with_project("alpha");

        assert_eq!(task.attribute("projectId").as_deref(), Some("alpha"));
        assert_eq!(task.attribute("branch").as_deref(), Some("main"));
        assert_eq!(task.attribute("shard").as_deref(), Some("3"));
        assert_eq!(task.attribute("repository"), None);
    }

    #[test]
    fn test_outcome_status() {
        let done = TaskOutcome::Completed {
            result: json!(1),
            duration: Duration::from_millis(5),
            usage: None,
        };
        assert!(done.is_success());
        assert_eq!(done.status(), TaskStatus::Completed);

        let timed_out = TaskOutcome::TimedOut {
            after: Duration::from_secs(1),
        };
        assert!(!timed_out.is_success());
        assert_eq!(timed_out.status().as_str(), "timed-out");
    }
}
