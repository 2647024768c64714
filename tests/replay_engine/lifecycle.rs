//! Lifecycle Tests
//!
//! Start, completion, continue-as-new, termination, panics and the
//! replay-visible context state (time, replay flag, custom status).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use durabletask_worker::{ActionKind, EventKind, OrchestrationStatus};

use super::helpers::*;

/// Replaying a full history reproduces the same completion and nothing else.
#[test]
fn replay_is_idempotent() {
    let orchestration = |ctx: durabletask_worker::OrchestrationContext, input: String| async move {
        let a = ctx.call_activity("Fetch", input.clone()).await?;
        ctx.create_timer(Duration::from_secs(30)).await?;
        let (b, c) = futures::join!(ctx.call_activity("Left", a.clone()), ctx.call_activity("Right", a));
        Ok::<_, anyhow::Error>(format!("{}+{}", b?, c?))
    };

    let mut live = executor(orchestration);
    let run = drive(&mut live, "order-7", echo_everything);
    assert_completed(run.last(), "Left:Fetch:order-7+Right:Fetch:order-7");

    let mut replay = executor(orchestration);
    let turn = replay.execute(&run.history, &[]);
    assert_eq!(turn.actions, vec![run.last().completion().unwrap().clone()]);
    assert_eq!(turn, *run.last());
}

/// Sequence ids follow scheduling order, across kinds.
#[test]
fn sequence_ids_follow_call_order() {
    let mut exec = executor(|ctx, _input| async move {
        let a = ctx.call_activity("A", "");
        let t = ctx.create_timer(Duration::from_secs(1));
        let s = ctx.call_sub_orchestration("Child", "");
        ctx.send_event("other", "Ping", "1");
        let _ = futures::join!(a, t, s);
        Ok(String::new())
    });

    let turn = exec.execute(&[], &opening(""));
    let got: Vec<_> = turn.actions.iter().map(|a| (a.id, a.kind_name())).collect();
    assert_eq!(
        got,
        vec![
            (0, "ScheduleTask"),
            (1, "CreateTimer"),
            (2, "CreateSubOrchestration"),
            (3, "SendEvent")
        ]
    );
}

/// `is_replaying` is true only while past events are applied.
#[test]
fn replay_flag_tracks_history_position() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let mut exec = executor(move |ctx, _input| {
        let log = Arc::clone(&log);
        async move {
            log.lock().unwrap().push(ctx.is_replaying());
            ctx.call_activity("Work", "").await?;
            log.lock().unwrap().push(ctx.is_replaying());
            Ok(String::new())
        }
    });

    let mut past = opening("");
    past.push(task_scheduled(0, "Work", ""));
    let turn = exec.execute(&past, &[orchestrator_started(1), task_completed(0, "ok")]);
    assert_completed(&turn, "");
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

/// Orchestration time comes from `OrchestratorStarted`, not the wall clock.
#[test]
fn current_time_is_deterministic() {
    let mut exec = executor(|ctx, _input| async move {
        let before = ctx.current_utc_datetime();
        ctx.create_timer(Duration::from_secs(5)).await?;
        let after = ctx.current_utc_datetime();
        Ok(format!("{}|{}", before.timestamp(), after.timestamp()))
    });

    let run = drive(&mut exec, "", echo_everything);
    assert_completed(run.last(), &format!("{}|{}", ts(0).timestamp(), ts(1).timestamp()));
}

/// `new_guid` yields the same values on every replay.
#[test]
fn guids_are_replay_stable() {
    let orchestration = |ctx: durabletask_worker::OrchestrationContext, _input: String| async move {
        let first = ctx.new_guid();
        let second = ctx.new_guid();
        assert_ne!(first, second);
        Ok::<_, anyhow::Error>(format!("{first}/{second}"))
    };
    let a = executor(orchestration).execute(&[], &opening(""));
    let b = executor(orchestration).execute(&opening(""), &[]);
    assert_eq!(a.completion(), b.completion());
}

/// Continue-as-new completes the execution and carries unread events forward.
#[test]
fn continue_as_new_carries_buffered_events() {
    let mut exec = executor(|ctx, input| async move {
        ctx.create_timer(Duration::from_secs(1)).await?;
        let n: u32 = input.parse()?;
        ctx.continue_as_new((n + 1).to_string(), true);
        Ok(String::new())
    });

    let mut past = opening("4");
    past.push(timer_created(0, ts(1)));
    let new_events = vec![
        orchestrator_started(1),
        event_raised("Tick", "a"),
        timer_fired(0, ts(1)),
        event_raised("Tick", "b"),
    ];
    let turn = exec.execute(&past, &new_events);

    match &turn.completion().unwrap().kind {
        ActionKind::CompleteOrchestration {
            status,
            result,
            carryover_events,
            ..
        } => {
            assert_eq!(*status, OrchestrationStatus::ContinuedAsNew);
            assert_eq!(result.as_deref(), Some("5"));
            let carried: Vec<_> = carryover_events
                .iter()
                .map(|e| match &e.kind {
                    EventKind::EventRaised { input, .. } => input.as_str(),
                    other => panic!("unexpected carryover {other:?}"),
                })
                .collect();
            assert_eq!(carried, vec!["a", "b"]);
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

/// Without preservation, buffered events are dropped on continue-as-new.
#[test]
fn continue_as_new_can_drop_events() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.continue_as_new("next", false);
        Ok(String::new())
    });

    let mut new_events = opening("");
    new_events.insert(1, event_raised("Tick", "a"));
    let turn = exec.execute(&[], &new_events);
    assert!(matches!(
        &turn.completion().unwrap().kind,
        ActionKind::CompleteOrchestration { status: OrchestrationStatus::ContinuedAsNew, carryover_events, .. }
            if carryover_events.is_empty()
    ));
}

/// Termination stops user code and drops its pending actions.
#[test]
fn terminate_discards_pending_actions() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.call_activity("Work", "").await?;
        Ok("finished".to_string())
    });

    let mut new_events = opening("");
    new_events.push(terminated("operator request"));
    let turn = exec.execute(&[], &new_events);

    assert_eq!(turn.actions.len(), 1);
    assert!(matches!(
        &turn.actions[0].kind,
        ActionKind::CompleteOrchestration { status: OrchestrationStatus::Terminated, result: Some(reason), .. }
            if reason == "operator request"
    ));
}

/// A panicking orchestrator fails the instance instead of the worker.
#[test]
fn panic_fails_orchestration() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.call_activity("Work", "").await?;
        panic!("invariant broken");
    });

    let mut past = opening("");
    past.push(task_scheduled(0, "Work", ""));
    let turn = exec.execute(&past, &[orchestrator_started(1), task_completed(0, "ok")]);

    let failure = failure_of(&turn);
    assert_eq!(failure.error_type, "OrchestratorPanicked");
    assert!(failure.error_message.contains("invariant broken"));
}

/// Errors returned by the orchestrator become its failure details.
#[test]
fn returned_error_fails_orchestration() {
    let mut exec = executor(|_ctx, _input| async move {
        Err(durabletask_worker::ApplicationError::new("InvalidOrder", "quantity must be positive").into())
    });

    let turn = exec.execute(&[], &opening(""));
    let failure = failure_of(&turn);
    assert_eq!(failure.error_type, "InvalidOrder");
    assert_eq!(failure.error_message, "quantity must be positive");
}

/// Custom status is reported with every turn.
#[test]
fn custom_status_is_reported() {
    let mut exec = executor(|ctx, _input| async move {
        ctx.set_custom_status("step 1");
        ctx.create_timer(Duration::from_secs(1)).await?;
        ctx.set_custom_status("step 2");
        Ok(String::new())
    });

    let turn1 = exec.execute(&[], &opening(""));
    assert_eq!(turn1.custom_status.as_deref(), Some("step 1"));

    let mut past = opening("");
    past.push(timer_created(0, ts(1)));
    let turn2 = exec.execute(&past, &[orchestrator_started(1), timer_fired(0, ts(1))]);
    assert_eq!(turn2.custom_status.as_deref(), Some("step 2"));
    assert!(turn2.is_complete());
}

/// A sub-orchestration failure surfaces as a task failure with the child's details.
#[test]
fn sub_orchestration_failure_propagates() {
    let mut exec = executor(|ctx, _input| async move {
        match ctx.call_sub_orchestration("Child", "").await {
            Ok(v) => Ok(v),
            Err(e) => Ok(format!("child failed: {}", e.failure().unwrap().error_type)),
        }
    });

    let turn1 = exec.execute(&[], &opening(""));
    let action = &turn1.actions[0];
    let mut past = opening("");
    past.push(scheduling_event(action, 0));
    let failed = event(
        1,
        EventKind::SubOrchestrationInstanceFailed {
            task_scheduled_id: 0,
            failure: durabletask_worker::FailureDetails::new("ChildError", "nope"),
        },
    );
    let turn2 = exec.execute(&past, &[orchestrator_started(1), failed]);
    assert_completed(&turn2, "child failed: ChildError");
}
