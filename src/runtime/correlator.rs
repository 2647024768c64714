//! Feeds history events into the orchestration context.
//!
//! Scheduling events confirm the action the code produced for the same
//! sequence id; result events resolve the pending task with that id. Any
//! mismatch means the code no longer matches its history.

use tracing::{debug, warn};

use crate::context::{CtxInner, TaskKind, TaskState};
use crate::error::WorkerError;
use crate::failure::FailureDetails;
use crate::{ActionKind, EventKind, HistoryEvent};

/// What the replay driver should do after an event was applied.
#[derive(Debug, PartialEq)]
pub(crate) enum Applied {
    /// `ExecutionStarted`: start the orchestrator with this input.
    Started { input: String },
    /// The instance was terminated; user code must not run again.
    Terminated { reason: String },
    /// Nothing for the driver to do. Woken tasks are picked up by the waker flag.
    Recorded,
}

pub(crate) fn apply(inner: &mut CtxInner, event: &HistoryEvent) -> Result<Applied, WorkerError> {
    match &event.kind {
        EventKind::OrchestratorStarted => {
            inner.current_utc = event.timestamp;
            Ok(Applied::Recorded)
        }
        EventKind::ExecutionStarted {
            name,
            version,
            input,
            execution_id,
            parent,
        } => {
            inner.name = name.clone();
            inner.version = version.clone();
            inner.execution_id = execution_id.clone();
            inner.parent = parent.clone();
            Ok(Applied::Started { input: input.clone() })
        }
        EventKind::TaskScheduled { id, name, .. } => confirm(inner, *id, "TaskScheduled", Some(name)),
        EventKind::TimerCreated { id, .. } => confirm(inner, *id, "TimerCreated", None),
        EventKind::SubOrchestrationInstanceCreated { id, name, .. } => {
            confirm(inner, *id, "SubOrchestrationInstanceCreated", Some(name))
        }
        EventKind::EventSent { id, name, .. } => confirm(inner, *id, "EventSent", Some(name)),
        EventKind::TaskCompleted {
            task_scheduled_id,
            result,
        } => resolve(inner, *task_scheduled_id, TaskKind::Activity, "TaskCompleted", Ok(result.clone())),
        EventKind::TaskFailed {
            task_scheduled_id,
            failure,
        } => resolve(inner, *task_scheduled_id, TaskKind::Activity, "TaskFailed", Err(failure.clone())),
        EventKind::SubOrchestrationInstanceCompleted {
            task_scheduled_id,
            result,
        } => resolve(
            inner,
            *task_scheduled_id,
            TaskKind::SubOrchestration,
            "SubOrchestrationInstanceCompleted",
            Ok(result.clone()),
        ),
        EventKind::SubOrchestrationInstanceFailed {
            task_scheduled_id,
            failure,
        } => resolve(
            inner,
            *task_scheduled_id,
            TaskKind::SubOrchestration,
            "SubOrchestrationInstanceFailed",
            Err(failure.clone()),
        ),
        EventKind::TimerFired { timer_id, .. } => {
            let applied = resolve(inner, *timer_id, TaskKind::Timer, "TimerFired", Ok(String::new()))?;
            if let Some(token) = inner.timeout_tokens.remove(timer_id) {
                inner.cancel_token(token);
            }
            Ok(applied)
        }
        EventKind::EventRaised { name, input } => {
            deliver_event(inner, name, input.clone());
            Ok(Applied::Recorded)
        }
        EventKind::ExecutionTerminated { reason } => Ok(Applied::Terminated { reason: reason.clone() }),
        EventKind::ExecutionCompleted { .. } | EventKind::OrchestratorCompleted => Ok(Applied::Recorded),
    }
}

fn action_matches(kind: &ActionKind, event: &str, name: Option<&str>) -> Result<(), String> {
    let (expected_event, scheduled_name) = match kind {
        ActionKind::ScheduleTask { name, .. } => ("TaskScheduled", Some(name.as_str())),
        ActionKind::CreateTimer { .. } => ("TimerCreated", None),
        ActionKind::CreateSubOrchestration { name, .. } => ("SubOrchestrationInstanceCreated", Some(name.as_str())),
        ActionKind::SendEvent { name, .. } => ("EventSent", Some(name.as_str())),
        ActionKind::CompleteOrchestration { .. } => ("ExecutionCompleted", None),
    };
    if expected_event != event {
        return Err(format!("history has {event} but the orchestrator produced {expected_event}"));
    }
    if let (Some(history_name), Some(code_name)) = (name, scheduled_name) {
        if history_name != code_name {
            return Err(format!(
                "history has {event} for '{history_name}' but the orchestrator scheduled '{code_name}'"
            ));
        }
    }
    Ok(())
}

fn confirm(inner: &mut CtxInner, id: u64, event: &str, name: Option<&str>) -> Result<Applied, WorkerError> {
    let Some(action) = inner.pending_actions.get(&id) else {
        return Err(WorkerError::NonDeterminism(format!(
            "history has {event} with id {id}, but the orchestrator did not schedule an action with that id"
        )));
    };
    action_matches(&action.kind, event, name)
        .map_err(|detail| WorkerError::NonDeterminism(format!("id {id}: {detail}")))?;
    inner.pending_actions.remove(&id);
    Ok(Applied::Recorded)
}

fn resolve(
    inner: &mut CtxInner,
    id: u64,
    expected: TaskKind,
    event: &str,
    outcome: Result<String, FailureDetails>,
) -> Result<Applied, WorkerError> {
    let Some(task) = inner.tasks.get_mut(&id) else {
        return Err(WorkerError::NonDeterminism(format!(
            "{event} references id {id}, but no task with that id was scheduled"
        )));
    };
    if task.kind != expected {
        return Err(WorkerError::NonDeterminism(format!(
            "{event} for id {id} does not match the scheduled {}",
            task.kind.as_str()
        )));
    }
    match task.state {
        TaskState::Scheduled => {
            task.state = match outcome {
                Ok(result) => TaskState::Completed(result),
                Err(failure) => TaskState::Failed(failure),
            };
            task.wake();
        }
        TaskState::Cancelled => {
            debug!(instance_id = %inner.instance_id, task_id = id, event, "discarding result of cancelled task");
        }
        _ => {
            warn!(instance_id = %inner.instance_id, task_id = id, event, "ignoring duplicate result");
        }
    }
    Ok(Applied::Recorded)
}

fn deliver_event(inner: &mut CtxInner, name: &str, payload: String) {
    let tasks = &inner.tasks;
    let matched = inner
        .events
        .raise(name, payload, |id| tasks.get(id).is_some_and(|t| t.state == TaskState::Scheduled));
    match matched {
        Some((id, payload)) => {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Completed(payload);
                task.wake();
            }
        }
        None => {
            debug!(instance_id = %inner.instance_id, event_name = %name, "buffered external event");
        }
    }
}
