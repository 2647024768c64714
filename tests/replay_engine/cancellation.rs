//! Cancellation Tests
//!
//! Cancellation is eager: triggering a token resolves every pending task that
//! observes it right away, and a task scheduled with an already-cancelled
//! token never reaches the backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;

use durabletask_worker::{
    ActionKind, EventKind, FailureDetails, OrchestrationContext, RetryPolicy, TaskError, TaskOptions,
};

use super::helpers::*;

fn cancelled_or(result: Result<String, TaskError>) -> String {
    match result {
        Ok(v) => v,
        Err(TaskError::Cancelled { .. }) => "cancelled".to_string(),
        Err(e) => format!("failed:{e}"),
    }
}

/// A task scheduled with a cancelled token resolves at once and emits no action.
///
/// Orchestration code:
/// ```ignore
/// let source = ctx.new_cancellation_source();
/// source.cancel();
/// ctx.call_activity_with_options("Charge", "42", TaskOptions::default().with_cancellation(source.token())).await
/// ```
#[test]
fn pre_cancelled_activity_is_never_scheduled() {
    let mut exec = executor(|ctx, _input| async move {
        let source = ctx.new_cancellation_source();
        source.cancel();
        let charged = ctx
            .call_activity_with_options("Charge", "42", TaskOptions::default().with_cancellation(source.token()))
            .await;
        let after = ctx.call_activity("After", "x").await?;
        Ok(format!("{}|{after}", cancelled_or(charged)))
    });

    let run = drive(&mut exec, "", echo_everything);
    assert_completed(run.last(), "cancelled|After:x");

    let actions = run.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].id, 0, "the cancelled call must not consume a sequence id");
    assert!(matches!(&actions[0].kind, ActionKind::ScheduleTask { name, .. } if name == "After"));
}

/// Cancelling an in-flight activity resolves it immediately; its late result is discarded.
#[test]
fn cancelling_pending_activity_resolves_now() {
    let orchestration = |ctx: OrchestrationContext, _input: String| async move {
        let source = ctx.new_cancellation_source();
        let slow =
            ctx.call_activity_with_options("Slow", "", TaskOptions::default().with_cancellation(source.token()));
        ctx.create_timer(Duration::from_secs(5)).await?;
        source.cancel();
        let outcome = cancelled_or(slow.await);
        ctx.create_timer(Duration::from_secs(5)).await?;
        Ok::<_, anyhow::Error>(outcome)
    };

    let mut exec = executor(orchestration);
    let run = drive(&mut exec, "", |action| match &action.kind {
        ActionKind::CreateTimer { fire_at } => Some(EventKind::TimerFired {
            timer_id: action.id,
            fire_at: *fire_at,
        }),
        _ => None,
    });
    assert_completed(run.last(), "cancelled");
    assert_eq!(run.scheduled_tasks(), 1);

    // the activity result shows up after cancellation, before the second timer fires
    let past = vec![
        orchestrator_started(0),
        started(""),
        task_scheduled(0, "Slow", ""),
        timer_created(1, ts(5)),
        orchestrator_started(1),
        timer_fired(1, ts(5)),
        timer_created(2, ts(6)),
    ];
    let new_events = vec![orchestrator_started(2), task_completed(0, "too late"), timer_fired(2, ts(6))];
    let mut replay = executor(orchestration);
    let turn = replay.execute(&past, &new_events);
    assert_completed(&turn, "cancelled");
    assert_eq!(turn.actions.len(), 1);
}

/// `cancel_after` cancels through a durable timer.
#[test]
fn cancel_after_times_out_activity() {
    let mut exec = executor(|ctx, _input| async move {
        let timeout = ctx.cancel_after(Duration::from_secs(30));
        let result = ctx
            .call_activity_with_options("Slow", "", TaskOptions::default().with_cancellation(timeout.token()))
            .await;
        Ok(cancelled_or(result))
    });

    let run = drive(&mut exec, "", |action| match &action.kind {
        ActionKind::CreateTimer { fire_at } => Some(EventKind::TimerFired {
            timer_id: action.id,
            fire_at: *fire_at,
        }),
        _ => None,
    });

    assert_completed(run.last(), "cancelled");
    let ids: Vec<_> = run.actions().iter().map(|a| (a.id, a.kind_name())).collect();
    assert_eq!(ids, vec![(0, "CreateTimer"), (1, "ScheduleTask")]);
}

/// A retried activity stops retrying once its token is cancelled.
#[test]
fn cancellation_ends_retry_loop() {
    let mut exec = executor(|ctx, _input| async move {
        let timeout = ctx.cancel_after(Duration::from_secs(5));
        let options = TaskOptions::with_retry(RetryPolicy::new(5, Duration::from_secs(60)))
            .with_cancellation(timeout.token());
        Ok(cancelled_or(ctx.call_activity_with_options("Flaky", "", options).await))
    });

    let run = drive(&mut exec, "", |action| match &action.kind {
        ActionKind::CreateTimer { fire_at } => Some(EventKind::TimerFired {
            timer_id: action.id,
            fire_at: *fire_at,
        }),
        ActionKind::ScheduleTask { .. } => Some(EventKind::TaskFailed {
            task_scheduled_id: action.id,
            failure: FailureDetails::new("Transient", "try again"),
        }),
        _ => None,
    });

    assert_completed(run.last(), "cancelled");
    assert_eq!(run.scheduled_tasks(), 1);
}

/// Cancellation that lands between a failed attempt and the retry decision is
/// visible to the handler, which can stop retrying with the task failure.
///
/// Orchestration code:
/// ```ignore
/// let options = TaskOptions::with_retry_handler(|rc| !rc.is_cancellation_requested)
///     .with_cancellation(source.token());
/// let mut call = ctx.call_activity_with_options("Flaky", "", options);
/// (&mut call).now_or_never();          // attempt 1 is scheduled
/// ctx.wait_for_external_event("Stop").await?;
/// source.cancel();                     // attempt 1 already failed
/// call.await?;
/// ```
#[test]
fn retry_handler_observes_cancellation_between_attempts() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let mut exec = executor(move |ctx, _input| {
        let recorded = Arc::clone(&recorded);
        async move {
            let source = ctx.new_cancellation_source();
            let options = TaskOptions::with_retry_handler(move |rc| {
                recorded.lock().unwrap().push(rc.is_cancellation_requested);
                !rc.is_cancellation_requested
            })
            .with_cancellation(source.token());
            let mut call = ctx.call_activity_with_options("Flaky", "", options);
            assert!((&mut call).now_or_never().is_none());

            ctx.wait_for_external_event("Stop").await?;
            source.cancel();
            Ok(call.await?)
        }
    });

    let turn1 = exec.execute(&[], &opening(""));
    assert_running(&turn1);
    assert_eq!(turn1.actions.len(), 1);
    assert_eq!(turn1.actions[0].id, 0);

    let mut history = opening("");
    history.push(task_scheduled(0, "Flaky", ""));
    let turn2 = exec.execute(
        &history,
        &[orchestrator_started(1), task_failed(0, "Boom", "attempt 1"), event_raised("Stop", "")],
    );

    // no second attempt and no cancellation error
    assert!(turn2.actions.iter().all(|a| a.kind_name() == "CompleteOrchestration"));
    let failure = failure_of(&turn2);
    assert_eq!(failure.error_type, "TaskFailed");
    assert_eq!(failure.innermost().error_type, "Boom");
    assert_eq!(*seen.lock().unwrap(), vec![true]);
}

/// A cancelled timer resolves with `Cancelled` instead of firing.
#[test]
fn cancelled_timer_resolves_cancelled() {
    let mut exec = executor(|ctx, _input| async move {
        let source = ctx.new_cancellation_source();
        let timer = ctx.create_timer_with_cancellation(Duration::from_secs(3600), &source.token());
        source.cancel();
        match timer.await {
            Ok(()) => Ok("fired".to_string()),
            Err(e) if e.is_cancelled() => Ok("cancelled".to_string()),
            Err(e) => Err(e.into()),
        }
    });

    let turn = exec.execute(&[], &opening(""));
    assert_completed(&turn, "cancelled");
    // the timer was already produced and stays in the action list
    assert_eq!(turn.actions[0].kind_name(), "CreateTimer");
}
