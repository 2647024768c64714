//! Error taxonomy.
//!
//! [`TaskError`] is what awaiting orchestrator code observes. [`WorkerError`]
//! covers failures at the engine boundary (replay divergence, size limits,
//! transport and payload store problems).

use thiserror::Error;

use crate::failure::FailureDetails;

/// Outcome of a failed await on a durable task.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// Cooperative cancellation through a [`crate::CancellationToken`]. Never retried.
    #[error("task '{name}' was cancelled")]
    Cancelled { name: String, task_id: Option<u64> },

    /// The activity or sub-orchestration failed.
    #[error("{0}")]
    Failed(TaskFailedError),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }

    pub fn failure(&self) -> Option<&FailureDetails> {
        match self {
            TaskError::Failed(failed) => Some(&failed.failure),
            TaskError::Cancelled { .. } => None,
        }
    }

    pub(crate) fn cancelled(name: impl Into<String>, task_id: Option<u64>) -> Self {
        TaskError::Cancelled {
            name: name.into(),
            task_id,
        }
    }
}

/// A task failure carrying the full failure chain reported by the backend.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("task '{task_name}' (id {task_id}) failed: {failure}")]
pub struct TaskFailedError {
    pub task_name: String,
    pub task_id: u64,
    pub failure: FailureDetails,
}

impl TaskFailedError {
    pub fn is_task_not_found(&self) -> bool {
        self.failure.is_task_not_found()
    }
}

/// Errors raised by the engine and worker host.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// History diverged from what the orchestrator code scheduled on replay.
    #[error("non-deterministic orchestration: {0}")]
    NonDeterminism(String),

    #[error(
        "action {action_id} ({action_kind}) serializes to {size} bytes, exceeding the {limit}-byte chunk limit"
    )]
    PayloadTooLarge {
        action_id: u64,
        action_kind: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("custom status serializes to {size} bytes, exceeding the {limit}-byte chunk limit")]
    CustomStatusTooLarge { size: usize, limit: usize },

    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("payload store error: {0}")]
    PayloadStore(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkerError {
    /// Terminal errors fail the orchestration instead of being retried by the host.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerError::NonDeterminism(_)
                | WorkerError::PayloadTooLarge { .. }
                | WorkerError::CustomStatusTooLarge { .. }
        )
    }

    pub fn to_failure_details(&self) -> FailureDetails {
        match self {
            WorkerError::NonDeterminism(msg) => FailureDetails::non_determinism(msg.clone()),
            WorkerError::PayloadTooLarge { .. } | WorkerError::CustomStatusTooLarge { .. } => FailureDetails {
                is_non_retriable: true,
                ..FailureDetails::new(crate::failure::PAYLOAD_TOO_LARGE, self.to_string())
            },
            other => FailureDetails::new("WorkerError", other.to_string()),
        }
    }
}
