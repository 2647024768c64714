//! Retry Tests
//!
//! Every attempt is a fresh task with its own sequence id. Policy backoff goes
//! through durable timers; handler-driven retries reschedule immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use durabletask_worker::{ActionKind, EventKind, FailureDetails, OrchestratorAction, RetryPolicy, TaskOptions};

use super::helpers::*;

fn always_fail(action: &OrchestratorAction) -> Option<EventKind> {
    match &action.kind {
        ActionKind::ScheduleTask { .. } => Some(EventKind::TaskFailed {
            task_scheduled_id: action.id,
            failure: FailureDetails::new("Boom", "activity exploded"),
        }),
        ActionKind::CreateTimer { fire_at } => Some(EventKind::TimerFired {
            timer_id: action.id,
            fire_at: *fire_at,
        }),
        _ => None,
    }
}

/// A handler that retries while `last_attempt_number < k` produces exactly k attempts.
///
/// Orchestration code:
/// ```ignore
/// let options = TaskOptions::with_retry_handler(|rc| rc.last_attempt_number < 3);
/// ctx.call_activity_with_options("Flaky", "", options).await?;
/// ```
#[test]
fn handler_retries_are_deterministic() {
    for k in 1..=4u32 {
        let mut exec = executor(move |ctx, _input| async move {
            let options = TaskOptions::with_retry_handler(move |rc| rc.last_attempt_number < k);
            ctx.call_activity_with_options("Flaky", "", options).await?;
            Ok(String::new())
        });

        let run = drive(&mut exec, "", always_fail);
        assert_eq!(run.scheduled_tasks(), k as usize, "k = {k}");

        // no backoff timers for handler retries
        assert!(run.actions().iter().all(|a| a.kind_name() == "ScheduleTask"));
        let ids: Vec<u64> = run.actions().iter().map(|a| a.id).collect();
        assert_eq!(ids, (0..u64::from(k)).collect::<Vec<_>>());

        let failure = failure_of(run.last());
        assert_eq!(failure.error_type, "TaskFailed");
        assert_eq!(failure.innermost().error_type, "Boom");
    }
}

/// Policy retries wait on a durable timer with exponential backoff between attempts.
#[test]
fn policy_backoff_uses_durable_timers() {
    let mut exec = executor(|ctx, _input| async move {
        let policy = RetryPolicy::new(3, Duration::from_secs(10)).with_backoff_coefficient(2.0);
        ctx.call_activity_with_options("Flaky", "", TaskOptions::with_retry(policy)).await?;
        Ok(String::new())
    });

    let run = drive(&mut exec, "", always_fail);
    let kinds: Vec<&str> = run.actions().iter().map(|a| a.kind_name()).collect();
    assert_eq!(
        kinds,
        vec!["ScheduleTask", "CreateTimer", "ScheduleTask", "CreateTimer", "ScheduleTask"]
    );

    // turn n runs at ts(n - 1); backoff is 10s then 20s
    let fire_times: Vec<_> = run
        .actions()
        .iter()
        .filter_map(|a| match a.kind {
            ActionKind::CreateTimer { fire_at } => Some(fire_at),
            _ => None,
        })
        .collect();
    assert_eq!(fire_times, vec![ts(1) + chrono::Duration::seconds(10), ts(3) + chrono::Duration::seconds(20)]);

    assert_eq!(failure_of(run.last()).innermost().error_type, "Boom");
}

/// A failure that eventually succeeds returns the successful result.
#[test]
fn retry_succeeds_after_transient_failures() {
    let mut exec = executor(|ctx, _input| async move {
        let options = TaskOptions::with_retry(RetryPolicy::new(5, Duration::from_secs(1)));
        Ok(ctx.call_activity_with_options("Flaky", "in", options).await?)
    });

    let mut failures_left = 2;
    let run = drive(&mut exec, "", |action| match &action.kind {
        ActionKind::ScheduleTask { .. } if failures_left > 0 => {
            failures_left -= 1;
            Some(EventKind::TaskFailed {
                task_scheduled_id: action.id,
                failure: FailureDetails::new("Transient", "later"),
            })
        }
        _ => echo_everything(action),
    });

    assert_completed(run.last(), "Flaky:in");
    assert_eq!(run.scheduled_tasks(), 3);
}

/// TaskNotFound is never retried and never reaches the retry handler.
#[test]
fn task_not_found_is_never_retried() {
    let consulted = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&consulted);
    let mut exec = executor(move |ctx, _input| {
        let counter = Arc::clone(&counter);
        async move {
            let options = TaskOptions::with_retry_handler(move |_rc| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });
            ctx.call_activity_with_options("Missing", "", options).await?;
            Ok(String::new())
        }
    });

    let run = drive(&mut exec, "", |action| match &action.kind {
        ActionKind::ScheduleTask { name, .. } => Some(EventKind::TaskFailed {
            task_scheduled_id: action.id,
            failure: FailureDetails::task_not_found("activity", name),
        }),
        _ => None,
    });

    assert_eq!(run.scheduled_tasks(), 1);
    assert_eq!(consulted.load(Ordering::SeqCst), 0);
    let failure = failure_of(run.last());
    assert!(failure.is_caused_by("TaskNotFound"));
}

/// A policy predicate can refuse to retry specific failures.
#[test]
fn policy_predicate_stops_retries() {
    let mut exec = executor(|ctx, _input| async move {
        let policy = RetryPolicy::new(5, Duration::from_secs(1)).with_handle(|f| f.error_type == "Transient");
        ctx.call_activity_with_options("Flaky", "", TaskOptions::with_retry(policy)).await?;
        Ok(String::new())
    });

    let run = drive(&mut exec, "", always_fail);
    assert_eq!(run.scheduled_tasks(), 1);
    assert_eq!(failure_of(run.last()).innermost().error_type, "Boom");
}

/// TaskNotFound is recognised by its error type even when the recorded failure
/// carries no non-retriable flag.
#[test]
fn task_not_found_without_flag_is_never_retried() {
    let consulted = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&consulted);
    let mut exec = executor(move |ctx, _input| {
        let counter = Arc::clone(&counter);
        async move {
            let options = TaskOptions::with_retry_handler(move |rc| {
                counter.fetch_add(1, Ordering::SeqCst);
                rc.last_attempt_number < 3
            });
            ctx.call_activity_with_options("Missing", "", options).await?;
            Ok(String::new())
        }
    });

    let recorded: FailureDetails = serde_json::from_str(
        r#"{
            "error_type": "TaskNotFound",
            "error_message": "No activity task named 'Missing' was found.",
            "stack_trace": null,
            "properties": {},
            "inner_failure": null
        }"#,
    )
    .unwrap();
    assert!(!recorded.is_non_retriable);

    let run = drive(&mut exec, "", |action| match &action.kind {
        ActionKind::ScheduleTask { .. } => Some(EventKind::TaskFailed {
            task_scheduled_id: action.id,
            failure: recorded.clone(),
        }),
        _ => None,
    });

    assert_eq!(run.scheduled_tasks(), 1);
    assert_eq!(consulted.load(Ordering::SeqCst), 0);
    assert!(failure_of(run.last()).is_caused_by("TaskNotFound"));
}

/// The same rule holds for declarative policies.
#[test]
fn task_not_found_without_flag_skips_policy() {
    let mut exec = executor(|ctx, _input| async move {
        let policy = RetryPolicy::new(5, Duration::from_secs(1)).with_handle(|_| true);
        ctx.call_activity_with_options("Missing", "", TaskOptions::with_retry(policy)).await?;
        Ok(String::new())
    });

    let run = drive(&mut exec, "", |action| match &action.kind {
        ActionKind::ScheduleTask { .. } => Some(EventKind::TaskFailed {
            task_scheduled_id: action.id,
            failure: FailureDetails::new("TaskNotFound", "not registered"),
        }),
        _ => echo_everything(action),
    });

    assert_eq!(run.scheduled_tasks(), 1);
    assert!(run.actions().iter().all(|a| a.kind_name() == "ScheduleTask"));
}
