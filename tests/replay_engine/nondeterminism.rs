//! Nondeterminism Detection Tests
//!
//! Replayed code must produce the same actions, in the same order, that the
//! history recorded. Any divergence fails the instance with
//! `NonDeterminismError` and discards whatever the divergent run produced.

use std::time::Duration;

use durabletask_worker::OrchestrationStatus;

use super::helpers::*;

fn assert_non_deterministic(turn: &durabletask_worker::runtime::TurnResult, needle: &str) {
    let failure = failure_of(turn);
    assert_eq!(failure.error_type, "NonDeterminismError");
    assert!(
        failure.error_message.contains(needle),
        "message {:?} should mention {needle:?}",
        failure.error_message
    );
    assert!(failure.is_non_retriable());
    assert_eq!(turn.actions.len(), 1, "only the completion action survives: {:?}", turn.actions);
}

/// History scheduled "A" but the code now schedules "B".
///
/// Orchestration code:
/// ```ignore
/// ctx.call_activity("B", "x").await?;   // previously "A"
/// ```
#[test]
fn renamed_activity_is_detected() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.call_activity("B", "x").await?;
        ctx.call_activity("C", "y").await?;
        Ok(String::new())
    });

    let mut past = opening("");
    past.push(task_scheduled(0, "A", "x"));
    let turn = exec.execute(&past, &[orchestrator_started(1), task_completed(0, "done")]);
    assert_non_deterministic(&turn, "'A'");
}

/// History has a timer where the code now schedules an activity.
#[test]
fn changed_action_kind_is_detected() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.call_activity("Work", "").await?;
        Ok(String::new())
    });

    let mut past = opening("");
    past.push(timer_created(0, ts(60)));
    let turn = exec.execute(&past, &[]);
    assert_non_deterministic(&turn, "TimerCreated");
}

/// A result for an id the code never scheduled.
#[test]
fn result_for_unknown_id_is_detected() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.create_timer(Duration::from_secs(5)).await?;
        Ok(String::new())
    });

    let turn = exec.execute(&opening(""), &[orchestrator_started(1), task_completed(7, "stray")]);
    assert_non_deterministic(&turn, "id 7");
}

/// A result whose kind does not match the scheduled task.
#[test]
fn result_of_wrong_kind_is_detected() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.create_timer(Duration::from_secs(5)).await?;
        Ok(String::new())
    });

    let mut past = opening("");
    past.push(timer_created(0, ts(5)));
    let turn = exec.execute(&past, &[orchestrator_started(1), task_completed(0, "not a timer")]);
    assert_non_deterministic(&turn, "timer");
}

/// Code that schedules fewer actions than history recorded.
#[test]
fn missing_action_is_detected() {
    let mut exec = executor(|_ctx, _input| async move { Ok("done early".to_string()) });

    let mut past = opening("");
    past.push(task_scheduled(0, "Work", ""));
    let turn = exec.execute(&past, &[]);
    assert_eq!(turn.status(), OrchestrationStatus::Failed);
    assert_non_deterministic(&turn, "id 0");
}
