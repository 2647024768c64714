//! Test helpers for replay engine tests.
//!
//! Event builders with fixed timestamps, an executor constructor and a small
//! in-test backend (`drive`) that turns actions into history and feeds
//! scripted results back, one turn at a time.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use durabletask_worker::runtime::{FnOrchestration, OrchestrationExecutor, TurnResult};
use durabletask_worker::{
    ActionKind, EventKind, FailureDetails, HistoryEvent, OrchestrationContext, OrchestrationStatus,
    OrchestratorAction,
};

pub const INSTANCE: &str = "test-instance";
pub const EXECUTION_ID: &str = "test-execution";
pub const ORCHESTRATION: &str = "TestOrchestration";

/// Fixed base time; orchestration time advances one second per turn.
pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn event(secs: i64, kind: EventKind) -> HistoryEvent {
    HistoryEvent::at(ts(secs), kind)
}

pub fn orchestrator_started(secs: i64) -> HistoryEvent {
    event(secs, EventKind::OrchestratorStarted)
}

pub fn started(input: &str) -> HistoryEvent {
    event(
        0,
        EventKind::ExecutionStarted {
            name: ORCHESTRATION.to_string(),
            version: Some("1.0.0".to_string()),
            input: input.to_string(),
            execution_id: EXECUTION_ID.to_string(),
            parent: None,
        },
    )
}

/// `OrchestratorStarted` + `ExecutionStarted`, the opening of every first turn.
pub fn opening(input: &str) -> Vec<HistoryEvent> {
    vec![orchestrator_started(0), started(input)]
}

pub fn task_scheduled(id: u64, name: &str, input: &str) -> HistoryEvent {
    event(
        0,
        EventKind::TaskScheduled {
            id,
            name: name.to_string(),
            input: input.to_string(),
        },
    )
}

pub fn task_completed(id: u64, result: &str) -> HistoryEvent {
    event(
        1,
        EventKind::TaskCompleted {
            task_scheduled_id: id,
            result: result.to_string(),
        },
    )
}

pub fn task_failed(id: u64, error_type: &str, message: &str) -> HistoryEvent {
    event(
        1,
        EventKind::TaskFailed {
            task_scheduled_id: id,
            failure: FailureDetails::new(error_type, message),
        },
    )
}

pub fn timer_created(id: u64, fire_at: DateTime<Utc>) -> HistoryEvent {
    event(0, EventKind::TimerCreated { id, fire_at })
}

pub fn timer_fired(id: u64, fire_at: DateTime<Utc>) -> HistoryEvent {
    event(1, EventKind::TimerFired { timer_id: id, fire_at })
}

pub fn event_raised(name: &str, input: &str) -> HistoryEvent {
    event(
        1,
        EventKind::EventRaised {
            name: name.to_string(),
            input: input.to_string(),
        },
    )
}

pub fn terminated(reason: &str) -> HistoryEvent {
    event(
        1,
        EventKind::ExecutionTerminated {
            reason: reason.to_string(),
        },
    )
}

pub fn executor<F, Fut>(f: F) -> OrchestrationExecutor
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    OrchestrationExecutor::new(INSTANCE, Arc::new(FnOrchestration(f)))
}

/// The history event a backend records for an action it accepted.
pub fn scheduling_event(action: &OrchestratorAction, secs: i64) -> HistoryEvent {
    let kind = match &action.kind {
        ActionKind::ScheduleTask { name, input } => EventKind::TaskScheduled {
            id: action.id,
            name: name.clone(),
            input: input.clone(),
        },
        ActionKind::CreateTimer { fire_at } => EventKind::TimerCreated {
            id: action.id,
            fire_at: *fire_at,
        },
        ActionKind::CreateSubOrchestration {
            name,
            version,
            instance_id,
            input,
        } => EventKind::SubOrchestrationInstanceCreated {
            id: action.id,
            name: name.clone(),
            version: version.clone(),
            instance_id: instance_id.clone(),
            input: input.clone(),
        },
        ActionKind::SendEvent {
            instance_id,
            name,
            data,
        } => EventKind::EventSent {
            id: action.id,
            instance_id: instance_id.clone(),
            name: name.clone(),
            input: data.clone(),
        },
        ActionKind::CompleteOrchestration {
            status,
            result,
            failure,
            ..
        } => EventKind::ExecutionCompleted {
            status: *status,
            result: result.clone(),
            failure: failure.clone(),
        },
    };
    event(secs, kind)
}

/// Everything a driven orchestration produced.
pub struct Run {
    pub turns: Vec<TurnResult>,
    pub history: Vec<HistoryEvent>,
}

impl Run {
    pub fn last(&self) -> &TurnResult {
        self.turns.last().unwrap()
    }

    /// All non-completion actions across turns, in emission order.
    pub fn actions(&self) -> Vec<&OrchestratorAction> {
        self.turns
            .iter()
            .flat_map(|t| t.actions.iter())
            .filter(|a| !matches!(a.kind, ActionKind::CompleteOrchestration { .. }))
            .collect()
    }

    pub fn scheduled_tasks(&self) -> usize {
        self.actions()
            .iter()
            .filter(|a| matches!(a.kind, ActionKind::ScheduleTask { .. }))
            .count()
    }
}

/// Run an orchestration turn by turn until it completes or stops producing work.
///
/// After each turn every action is recorded as its scheduling event and
/// `respond` decides which result event (if any) arrives in the next turn.
pub fn drive<R>(executor: &mut OrchestrationExecutor, input: &str, mut respond: R) -> Run
where
    R: FnMut(&OrchestratorAction) -> Option<EventKind>,
{
    let mut history: Vec<HistoryEvent> = Vec::new();
    let mut new_events = opening(input);
    let mut turns = Vec::new();

    for turn_no in 1..=100i64 {
        let turn = executor.execute(&history, &new_events);
        history.append(&mut new_events);

        let mut responses = Vec::new();
        for action in &turn.actions {
            history.push(scheduling_event(action, turn_no - 1));
            if let Some(kind) = respond(action) {
                responses.push(event(turn_no, kind));
            }
        }

        let done = turn.is_complete();
        turns.push(turn);
        if done || responses.is_empty() {
            break;
        }
        new_events = std::iter::once(orchestrator_started(turn_no)).chain(responses).collect();
    }
    Run { turns, history }
}

/// Responder completing every activity with `"{name}:{input}"` and firing every timer.
pub fn echo_everything(action: &OrchestratorAction) -> Option<EventKind> {
    match &action.kind {
        ActionKind::ScheduleTask { name, input } => Some(EventKind::TaskCompleted {
            task_scheduled_id: action.id,
            result: format!("{name}:{input}"),
        }),
        ActionKind::CreateTimer { fire_at } => Some(EventKind::TimerFired {
            timer_id: action.id,
            fire_at: *fire_at,
        }),
        _ => None,
    }
}

pub fn assert_completed(turn: &TurnResult, expected: &str) {
    match turn.completion().map(|a| &a.kind) {
        Some(ActionKind::CompleteOrchestration {
            status: OrchestrationStatus::Completed,
            result,
            ..
        }) => assert_eq!(result.as_deref(), Some(expected)),
        other => panic!("expected Completed({expected}), got {other:?}"),
    }
}

/// Failure details of a failed turn.
pub fn failure_of(turn: &TurnResult) -> &FailureDetails {
    match turn.completion().map(|a| &a.kind) {
        Some(ActionKind::CompleteOrchestration {
            status: OrchestrationStatus::Failed,
            failure: Some(failure),
            ..
        }) => failure,
        other => panic!("expected Failed, got {other:?}"),
    }
}

pub fn assert_running(turn: &TurnResult) {
    assert!(!turn.is_complete(), "expected a running turn, got {:?}", turn.completion());
}
