//! External Event Tests
//!
//! Delivery order of raised events to concurrent waiters, buffering of events
//! nobody waits for yet, and timeouts.

use std::time::Duration;

use durabletask_worker::{ActionKind, EventKind, TaskError};

use super::helpers::*;

/// Concurrent waiters for the same name are served newest first.
///
/// Orchestration code:
/// ```ignore
/// let w1 = ctx.wait_for_external_event("Approval");
/// let w2 = ctx.wait_for_external_event("Approval");
/// let w3 = ctx.wait_for_external_event("Approval");
/// let (a, b, c) = futures::join!(w1, w2, w3);
/// ```
#[test]
fn waiters_are_served_last_in_first_out() {
    let mut exec = executor(|ctx, _input| async move {
        let w1 = ctx.wait_for_external_event("Approval");
        let w2 = ctx.wait_for_external_event("Approval");
        let w3 = ctx.wait_for_external_event("Approval");
        let (a, b, c) = futures::join!(w1, w2, w3);
        Ok(format!("w1={},w2={},w3={}", a?, b?, c?))
    });

    let mut new_events = opening("");
    new_events.push(event_raised("Approval", "e1"));
    new_events.push(event_raised("Approval", "e2"));
    new_events.push(event_raised("Approval", "e3"));

    let turn = exec.execute(&[], &new_events);
    assert_completed(&turn, "w1=e3,w2=e2,w3=e1");
}

/// Events raised before anyone waits are buffered and handed out in arrival order.
#[test]
fn early_events_are_buffered_fifo() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.create_timer(Duration::from_secs(60)).await?;
        let first = ctx.wait_for_external_event("Item").await?;
        let second = ctx.wait_for_external_event("Item").await?;
        Ok(format!("{first},{second}"))
    });

    let turn1 = exec.execute(&[], &opening(""));
    assert_running(&turn1);
    let fire_at = match &turn1.actions[0].kind {
        ActionKind::CreateTimer { fire_at } => *fire_at,
        other => panic!("expected a timer, got {other:?}"),
    };
    assert_eq!(fire_at, ts(60));

    let past: Vec<_> = opening("").into_iter().chain([timer_created(0, fire_at)]).collect();
    let new_events = vec![
        orchestrator_started(1),
        event_raised("Item", "a"),
        event_raised("Item", "b"),
        timer_fired(0, fire_at),
    ];
    let turn2 = exec.execute(&past, &new_events);
    assert_completed(&turn2, "a,b");
}

/// Event names are matched without regard to case.
#[test]
fn event_names_are_case_insensitive() {
    let mut exec = executor(|ctx, _input| async move { Ok(ctx.wait_for_external_event("approval").await?) });

    let mut new_events = opening("");
    new_events.push(event_raised("APPROVAL", "yes"));
    let turn = exec.execute(&[], &new_events);
    assert_completed(&turn, "yes");
}

/// A cancelled waiter is skipped; the event goes to the next live waiter.
#[test]
fn cancelled_waiter_is_skipped() {
    let mut exec = executor(|ctx, _input| async move {
        let source = ctx.new_cancellation_source();
        let live = ctx.wait_for_external_event("Signal");
        let doomed = ctx.wait_for_external_event_with_cancellation("Signal", &source.token());
        source.cancel();

        let doomed = doomed.await;
        assert!(matches!(doomed, Err(TaskError::Cancelled { .. })));
        Ok(live.await?)
    });

    let mut new_events = opening("");
    new_events.push(event_raised("Signal", "payload"));
    let turn = exec.execute(&[], &new_events);
    assert_completed(&turn, "payload");
}

/// A dropped wait future stops competing for events.
#[test]
fn dropped_waiter_does_not_consume_events() {
    let mut exec = executor(|ctx, _input| async move {
        let live = ctx.wait_for_external_event("Signal");
        drop(ctx.wait_for_external_event("Signal"));
        Ok(live.await?)
    });

    let mut new_events = opening("");
    new_events.push(event_raised("Signal", "payload"));
    let turn = exec.execute(&[], &new_events);
    assert_completed(&turn, "payload");
}

/// The timeout timer firing first cancels the wait.
#[test]
fn wait_with_timeout_expires() {
    let mut exec = executor(|ctx, _input| async move {
        match ctx.wait_for_external_event_with_timeout("Approval", Duration::from_secs(3600)).await {
            Ok(v) => Ok(format!("approved:{v}")),
            Err(e) if e.is_cancelled() => Ok("timed out".to_string()),
            Err(e) => Err(e.into()),
        }
    });

    let turn1 = exec.execute(&[], &opening(""));
    assert_running(&turn1);
    assert_eq!(turn1.actions.len(), 1);
    assert_eq!(turn1.actions[0].id, 0);
    assert!(matches!(turn1.actions[0].kind, ActionKind::CreateTimer { fire_at } if fire_at == ts(3600)));

    let past: Vec<_> = opening("").into_iter().chain([timer_created(0, ts(3600))]).collect();
    let turn2 = exec.execute(&past, &[orchestrator_started(3600), timer_fired(0, ts(3600))]);
    assert_completed(&turn2, "timed out");
}

/// An event arriving before the timeout wins.
#[test]
fn wait_with_timeout_receives_event() {
    let mut exec = executor(|ctx, _input| async move {
        let approval = ctx
            .wait_for_external_event_with_timeout("Approval", Duration::from_secs(3600))
            .await?;
        ctx.create_timer(Duration::from_secs(1)).await?;
        Ok(approval)
    });

    let run = drive(&mut exec, "", |action| match &action.kind {
        // only the follow-up timer fires; the timeout timer stays pending
        ActionKind::CreateTimer { fire_at } if action.id == 2 => Some(EventKind::TimerFired {
            timer_id: action.id,
            fire_at: *fire_at,
        }),
        ActionKind::CreateTimer { .. } => Some(EventKind::EventRaised {
            name: "Approval".into(),
            input: "granted".into(),
        }),
        _ => None,
    });
    assert_completed(run.last(), "granted");
}
