//! Work-item transport between the worker and a backend.
//!
//! The worker pulls work items, runs them and pushes completions back. The
//! backend owns history and guarantees that at most one orchestration work
//! item per instance is outstanding at a time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::failure::FailureDetails;
use crate::{HistoryEvent, OrchestratorAction};

pub mod error;
pub mod in_memory;

pub use error::TransportError;
pub use in_memory::{InMemoryTaskHub, InstanceState};

/// Orchestration turn to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationWorkItem {
    pub instance_id: String,
    /// Identifies this delivery; echoed back on completion or abandon.
    pub completion_token: String,
    /// Committed history from previous turns.
    pub past_events: Vec<HistoryEvent>,
    /// Events not yet seen by the orchestrator.
    pub new_events: Vec<HistoryEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityWorkItem {
    pub instance_id: String,
    pub task_id: u64,
    pub name: String,
    pub input: String,
    pub completion_token: String,
}

/// Actions produced by one orchestration turn, possibly one chunk of several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationCompletion {
    pub instance_id: String,
    pub completion_token: String,
    pub actions: Vec<OrchestratorAction>,
    pub custom_status: Option<String>,
    pub chunk_index: u32,
    /// More chunks follow.
    pub is_partial: bool,
}

impl OrchestrationCompletion {
    pub fn new(
        instance_id: impl Into<String>,
        completion_token: impl Into<String>,
        actions: Vec<OrchestratorAction>,
        custom_status: Option<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            completion_token: completion_token.into(),
            actions,
            custom_status,
            chunk_index: 0,
            is_partial: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    pub instance_id: String,
    pub task_id: u64,
    pub completion_token: String,
    pub outcome: Result<String, FailureDetails>,
}

/// Backend connection used by the worker's dispatch loops.
///
/// Fetch calls return `Ok(None)` when no work is available; the worker then
/// sleeps for its idle poll interval.
#[async_trait]
pub trait WorkItemTransport: Send + Sync {
    async fn fetch_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, TransportError>;

    async fn fetch_activity_work_item(&self) -> Result<Option<ActivityWorkItem>, TransportError>;

    /// Deliver one chunk of an orchestration completion. Chunks of the same
    /// completion arrive in `chunk_index` order.
    async fn complete_orchestration(&self, completion: OrchestrationCompletion) -> Result<(), TransportError>;

    async fn complete_activity(&self, result: ActivityResult) -> Result<(), TransportError>;

    /// Release an orchestration work item without completing it so it can be redelivered.
    async fn abandon_orchestration_work_item(
        &self,
        instance_id: &str,
        completion_token: &str,
    ) -> Result<(), TransportError>;
}
