//! Worker-side runtime for durable, replay-based workflow orchestration.
//!
//! Orchestrator functions are plain `async fn`s that program against an
//! [`OrchestrationContext`]. The runtime re-executes them from the top on every
//! new batch of history, matching each scheduling call to the recorded history
//! by sequence id, so state survives crashes and redeployments without ever
//! persisting stack state.
//!
//! ```rust,no_run
//! use durabletask_worker::{OrchestrationContext, RetryPolicy, TaskOptions};
//! use std::time::Duration;
//!
//! async fn greet(ctx: OrchestrationContext, name: String) -> anyhow::Result<String> {
//!     let policy = RetryPolicy::new(3, Duration::from_secs(1));
//!     let greeting = ctx
//!         .call_activity_with_options("Greet", name, TaskOptions::with_retry(policy))
//!         .await?;
//!     ctx.create_timer(Duration::from_secs(5)).await?;
//!     let reply = ctx.wait_for_external_event("Reply").await?;
//!     Ok(format!("{greeting} / {reply}"))
//! }
//! ```
//!
//! The crate is split into:
//! - the orchestration engine ([`OrchestrationContext`], [`runtime::replay_engine`],
//!   [`runtime::event_dispatcher`], [`retry`], [`cancellation`])
//! - the worker host ([`runtime::Worker`], [`transport`], [`payloads`], [`runtime::session_cache`])

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cancellation;
pub mod codec;
pub mod context;
pub mod error;
pub mod failure;
pub mod futures;
pub mod logging;
pub mod payloads;
pub mod retry;
pub mod runtime;
pub mod transport;

pub use cancellation::{CancellationSource, CancellationToken};
pub use context::OrchestrationContext;
pub use error::{TaskError, TaskFailedError, WorkerError};
pub use failure::{ApplicationError, FailureDetails, FailurePropertiesProvider};
pub use crate::futures::{DurableFuture, TimerFuture};
pub use retry::{RetryContext, RetryPolicy, SubOrchestrationOptions, TaskOptions, TaskRetryOptions};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{ActivityContext, Worker, WorkerOptions};

/// Terminal (or running) state of an orchestration instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrchestrationStatus::Running | OrchestrationStatus::ContinuedAsNew)
    }
}

/// Link from a sub-orchestration back to the instance that scheduled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentInstance {
    pub instance_id: String,
    pub task_scheduled_id: u64,
}

/// A single persisted history record.
///
/// Scheduling events (`TaskScheduled`, `TimerCreated`, `SubOrchestrationInstanceCreated`,
/// `EventSent`) carry the sequence id that was allocated for the action; result events
/// reference that id through `task_scheduled_id` / `timer_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    /// Marks the start of a work item; its timestamp becomes the logical clock.
    OrchestratorStarted,
    ExecutionStarted {
        name: String,
        version: Option<String>,
        input: String,
        execution_id: String,
        parent: Option<ParentInstance>,
    },
    TaskScheduled {
        id: u64,
        name: String,
        input: String,
    },
    TaskCompleted {
        task_scheduled_id: u64,
        result: String,
    },
    TaskFailed {
        task_scheduled_id: u64,
        failure: FailureDetails,
    },
    TimerCreated {
        id: u64,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: u64,
        fire_at: DateTime<Utc>,
    },
    SubOrchestrationInstanceCreated {
        id: u64,
        name: String,
        version: Option<String>,
        instance_id: String,
        input: String,
    },
    SubOrchestrationInstanceCompleted {
        task_scheduled_id: u64,
        result: String,
    },
    SubOrchestrationInstanceFailed {
        task_scheduled_id: u64,
        failure: FailureDetails,
    },
    EventSent {
        id: u64,
        instance_id: String,
        name: String,
        input: String,
    },
    EventRaised {
        name: String,
        input: String,
    },
    ExecutionTerminated {
        reason: String,
    },
    ExecutionCompleted {
        status: OrchestrationStatus,
        result: Option<String>,
        failure: Option<FailureDetails>,
    },
    OrchestratorCompleted,
}

impl HistoryEvent {
    /// Create an event stamped with the current wall-clock time.
    ///
    /// Only backends call this; orchestrator code never observes real time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn at(timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self { timestamp, kind }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            EventKind::OrchestratorStarted => "OrchestratorStarted",
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::SubOrchestrationInstanceCreated { .. } => "SubOrchestrationInstanceCreated",
            EventKind::SubOrchestrationInstanceCompleted { .. } => "SubOrchestrationInstanceCompleted",
            EventKind::SubOrchestrationInstanceFailed { .. } => "SubOrchestrationInstanceFailed",
            EventKind::EventSent { .. } => "EventSent",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            EventKind::OrchestratorCompleted => "OrchestratorCompleted",
        }
    }

    /// The user payload carried by this event, if any.
    pub fn payload_mut(&mut self) -> Option<&mut String> {
        match &mut self.kind {
            EventKind::ExecutionStarted { input, .. }
            | EventKind::TaskScheduled { input, .. }
            | EventKind::SubOrchestrationInstanceCreated { input, .. }
            | EventKind::EventSent { input, .. }
            | EventKind::EventRaised { input, .. } => Some(input),
            EventKind::TaskCompleted { result, .. } | EventKind::SubOrchestrationInstanceCompleted { result, .. } => {
                Some(result)
            }
            EventKind::ExecutionCompleted { result, .. } => result.as_mut(),
            EventKind::ExecutionTerminated { reason } => Some(reason),
            _ => None,
        }
    }
}

/// A decision produced by one orchestration turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorAction {
    pub id: u64,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionKind {
    ScheduleTask {
        name: String,
        input: String,
    },
    CreateTimer {
        fire_at: DateTime<Utc>,
    },
    CreateSubOrchestration {
        name: String,
        version: Option<String>,
        instance_id: String,
        input: String,
    },
    SendEvent {
        instance_id: String,
        name: String,
        data: String,
    },
    CompleteOrchestration {
        status: OrchestrationStatus,
        result: Option<String>,
        failure: Option<FailureDetails>,
        /// External events carried into the next generation on continue-as-new.
        carryover_events: Vec<HistoryEvent>,
    },
}

impl OrchestratorAction {
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ActionKind::ScheduleTask { .. } => "ScheduleTask",
            ActionKind::CreateTimer { .. } => "CreateTimer",
            ActionKind::CreateSubOrchestration { .. } => "CreateSubOrchestration",
            ActionKind::SendEvent { .. } => "SendEvent",
            ActionKind::CompleteOrchestration { .. } => "CompleteOrchestration",
        }
    }

    /// Mutable references to every user payload the action carries.
    pub fn payloads_mut(&mut self) -> Vec<&mut String> {
        match &mut self.kind {
            ActionKind::ScheduleTask { input, .. } | ActionKind::CreateSubOrchestration { input, .. } => vec![input],
            ActionKind::SendEvent { data, .. } => vec![data],
            ActionKind::CompleteOrchestration {
                result, carryover_events, ..
            } => {
                let mut out: Vec<&mut String> = result.iter_mut().collect();
                out.extend(carryover_events.iter_mut().filter_map(HistoryEvent::payload_mut));
                out
            }
            ActionKind::CreateTimer { .. } => Vec::new(),
        }
    }
}
