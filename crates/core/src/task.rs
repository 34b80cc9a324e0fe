//! Request/result types shared by the pool, the executors and the services.
//!
//! A [`TaskRequest`] is immutable once built. Every accepted request
//! produces exactly one [`TaskResult`].

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::Timestamp;

/// Unique id of a submitted task.
pub type TaskId = Uuid;

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

/// The four kinds of CPU-bound work the pool accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Train,
    Evaluate,
    Preprocess,
    Optimize,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Train => "train",
            TaskKind::Evaluate => "evaluate",
            TaskKind::Preprocess => "preprocess",
            TaskKind::Optimize => "optimize",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// A unit of work submitted to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: Value,
    pub submitted_at: Timestamp,
}

impl TaskRequest {
    /// Build a request with a fresh id, stamped now.
    pub fn new(kind: TaskKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            submitted_at: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed structure.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TaskError::InvalidPayload(format!("{} payload: {e}", self.kind)))
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum TaskOutcome {
    Succeeded(Value),
    Failed(String),
}

/// The single terminal record for a [`TaskRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: TaskId,
    pub outcome: TaskOutcome,
    pub completed_at: Timestamp,
}

impl TaskResult {
    pub fn succeeded(id: TaskId, value: Value) -> Self {
        Self {
            id,
            outcome: TaskOutcome::Succeeded(value),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(id: TaskId, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: TaskOutcome::Failed(message.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Succeeded(_))
    }

    /// The result value, or `None` for a failed task.
    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            TaskOutcome::Succeeded(v) => Some(v),
            TaskOutcome::Failed(_) => None,
        }
    }

    /// Consume the result, yielding the value or the failure message.
    pub fn into_value(self) -> Result<Value, String> {
        match self.outcome {
            TaskOutcome::Succeeded(v) => Ok(v),
            TaskOutcome::Failed(msg) => Err(msg),
        }
    }

    /// The error message, or `None` for a successful task.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Succeeded(_) => None,
            TaskOutcome::Failed(msg) => Some(msg),
        }
    }
}

/// A progress message emitted by a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub data: Value,
    pub emitted_at: Timestamp,
}

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// A failure raised by a task's own logic.
///
/// Caught inside the worker and surfaced as a failed [`TaskResult`]; it never
/// takes the worker down.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Task cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn kind_serializes_lowercase() {
        let v = serde_json::to_value(TaskKind::Preprocess).unwrap();
        assert_eq!(v, json!("preprocess"));
    }

    #[test]
    fn new_requests_get_distinct_ids() {
        let a = TaskRequest::new(TaskKind::Train, json!({}));
        let b = TaskRequest::new(TaskKind::Train, json!({}));
        assert_ne!(a.id, b.id);
    }

    #[derive(Debug, Deserialize)]
    struct Sample {
        dataset_id: i64,
    }

    #[test]
    fn parse_payload_reports_kind_on_error() {
        let req = TaskRequest::new(TaskKind::Evaluate, json!({"nope": 1}));
        let err = req.parse_payload::<Sample>().unwrap_err();
        assert_matches!(err, TaskError::InvalidPayload(msg) if msg.starts_with("evaluate payload"));
    }

    #[test]
    fn parse_payload_succeeds() {
        let req = TaskRequest::new(TaskKind::Preprocess, json!({"dataset_id": 9}));
        let parsed: Sample = req.parse_payload().unwrap();
        assert_eq!(parsed.dataset_id, 9);
    }

    #[test]
    fn result_accessors() {
        let id = Uuid::new_v4();
        let ok = TaskResult::succeeded(id, json!({"loss": 0.1}));
        assert!(ok.is_success());
        assert_eq!(ok.value().unwrap()["loss"], 0.1);
        assert!(ok.error_message().is_none());

        let failed = TaskResult::failed(id, "boom");
        assert!(!failed.is_success());
        assert_eq!(failed.error_message(), Some("boom"));
        assert!(failed.value().is_none());
    }
}
