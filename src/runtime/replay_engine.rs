//! Replay driver: runs orchestrator code against history.
//!
//! An [`OrchestrationExecutor`] owns one orchestration context and the root
//! future of the user function. Each call to [`OrchestrationExecutor::execute`]
//! applies the history it has not seen yet (past events in replay mode, new
//! events live), polling the root future whenever a task it waits on resolves,
//! and returns the actions produced so far.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::task::{Context, Poll, Wake, Waker};

use tracing::{debug, info, warn};

use super::OrchestrationHandler;
use super::correlator::{self, Applied};
use super::limits::MAX_POLLS_PER_EVENT;
use crate::error::WorkerError;
use crate::failure::{self, FailureDetails, FailurePropertiesProvider};
use crate::{ActionKind, EventKind, HistoryEvent, OrchestrationContext, OrchestrationStatus, OrchestratorAction};

type RootFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;

/// Waker that only records that something woke the orchestrator.
#[derive(Default)]
struct WakeFlag(AtomicBool);

impl WakeFlag {
    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.set();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.set();
    }
}

#[derive(Debug)]
struct Completion {
    status: OrchestrationStatus,
    result: Option<String>,
    failure: Option<FailureDetails>,
    carryover_events: Vec<HistoryEvent>,
    /// Keep collecting external events that arrive after the function returned.
    preserve_late_events: bool,
    /// Pending actions are dropped when the run diverged from history.
    discard_actions: bool,
}

/// Output of one [`OrchestrationExecutor::execute`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    /// New actions ordered by sequence id, with the completion action last when present.
    pub actions: Vec<OrchestratorAction>,
    pub custom_status: Option<String>,
}

impl TurnResult {
    pub fn completion(&self) -> Option<&OrchestratorAction> {
        self.actions
            .last()
            .filter(|a| matches!(a.kind, ActionKind::CompleteOrchestration { .. }))
    }

    pub fn is_complete(&self) -> bool {
        self.completion().is_some()
    }

    pub fn status(&self) -> OrchestrationStatus {
        match self.completion().map(|a| &a.kind) {
            Some(ActionKind::CompleteOrchestration { status, .. }) => *status,
            _ => OrchestrationStatus::Running,
        }
    }
}

pub struct OrchestrationExecutor {
    instance_id: String,
    ctx: OrchestrationContext,
    handler: Arc<dyn OrchestrationHandler>,
    failure_provider: Option<Arc<dyn FailurePropertiesProvider>>,
    root: Option<RootFuture>,
    started: bool,
    wake_flag: Arc<WakeFlag>,
    processed_events: usize,
    completion: Option<Completion>,
}

impl OrchestrationExecutor {
    pub fn new(instance_id: impl Into<String>, handler: Arc<dyn OrchestrationHandler>) -> Self {
        let instance_id = instance_id.into();
        Self {
            ctx: OrchestrationContext::new(instance_id.clone()),
            instance_id,
            handler,
            failure_provider: None,
            root: None,
            started: false,
            wake_flag: Arc::new(WakeFlag::default()),
            processed_events: 0,
            completion: None,
        }
    }

    pub fn with_failure_provider(mut self, provider: Option<Arc<dyn FailurePropertiesProvider>>) -> Self {
        self.failure_provider = provider;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> String {
        self.ctx.execution_id()
    }

    /// Number of history events already applied; a cached executor resumes after them.
    pub fn processed_events(&self) -> usize {
        self.processed_events
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_some()
    }

    pub fn context(&self) -> &OrchestrationContext {
        &self.ctx
    }

    /// Apply unseen history and collect the resulting actions.
    ///
    /// `past_events` must start with the events this executor already processed.
    pub fn execute(&mut self, past_events: &[HistoryEvent], new_events: &[HistoryEvent]) -> TurnResult {
        if self.processed_events > past_events.len() {
            warn!(
                instance_id = %self.instance_id,
                processed = self.processed_events,
                history_len = past_events.len(),
                "history is shorter than what this executor already processed"
            );
        }
        let skip = self.processed_events.min(past_events.len());

        self.ctx.lock().is_replaying = true;
        for event in &past_events[skip..] {
            self.process(event);
        }
        self.ctx.lock().is_replaying = false;
        for event in new_events {
            self.process(event);
        }
        self.processed_events = past_events.len() + new_events.len();

        self.build_turn()
    }

    fn process(&mut self, event: &HistoryEvent) {
        if let Some(completion) = self.completion.as_mut() {
            if completion.preserve_late_events && matches!(event.kind, EventKind::EventRaised { .. }) {
                completion.carryover_events.push(event.clone());
            }
            // Scheduling events recorded with the final turn must still match its actions.
            if !completion.discard_actions && is_scheduling(&event.kind) {
                let confirmed = {
                    let mut inner = self.ctx.lock();
                    correlator::apply(&mut inner, event)
                };
                if let Err(err) = confirmed {
                    self.fail_non_deterministic(err);
                }
            }
            return;
        }

        let applied = {
            let mut inner = self.ctx.lock();
            correlator::apply(&mut inner, event)
        };
        match applied {
            Ok(Applied::Started { input }) => self.start(input),
            Ok(Applied::Terminated { reason }) => self.terminate(reason),
            Ok(Applied::Recorded) => {}
            Err(err) => self.fail_non_deterministic(err),
        }
        self.run_until_stalled();
    }

    fn start(&mut self, input: String) {
        if self.started {
            warn!(instance_id = %self.instance_id, "ignoring duplicate ExecutionStarted");
            return;
        }
        self.started = true;
        let handler = self.handler.clone();
        let ctx = self.ctx.clone();
        self.root = Some(Box::pin(async move { handler.invoke(ctx, input).await }));
        self.wake_flag.set();
    }

    fn terminate(&mut self, reason: String) {
        info!(instance_id = %self.instance_id, reason = %reason, "orchestration terminated");
        self.root = None;
        self.completion = Some(Completion {
            status: OrchestrationStatus::Terminated,
            result: Some(reason),
            failure: None,
            carryover_events: Vec::new(),
            preserve_late_events: false,
            discard_actions: true,
        });
    }

    fn fail_non_deterministic(&mut self, err: WorkerError) {
        warn!(instance_id = %self.instance_id, error = %err, "orchestration diverged from history");
        self.root = None;
        self.completion = Some(Completion {
            status: OrchestrationStatus::Failed,
            result: None,
            failure: Some(err.to_failure_details()),
            carryover_events: Vec::new(),
            preserve_late_events: false,
            discard_actions: true,
        });
    }

    /// Poll the root future for as long as something keeps waking it.
    fn run_until_stalled(&mut self) {
        let Some(root) = self.root.as_mut() else {
            return;
        };
        let waker = Waker::from(self.wake_flag.clone());
        let mut cx = Context::from_waker(&waker);

        let mut polls = 0usize;
        let outcome = loop {
            if !self.wake_flag.take() {
                return;
            }
            polls += 1;
            if polls > MAX_POLLS_PER_EVENT {
                warn!(instance_id = %self.instance_id, polls, "orchestrator keeps waking itself; yielding");
                return;
            }
            match catch_unwind(AssertUnwindSafe(|| root.as_mut().poll(&mut cx))) {
                Ok(Poll::Pending) => continue,
                Ok(Poll::Ready(result)) => break Ok(result),
                Err(payload) => break Err(panic_message(payload.as_ref())),
            }
        };

        self.root = None;
        match outcome {
            Ok(result) => self.complete(result),
            Err(message) => {
                warn!(instance_id = %self.instance_id, panic = %message, "orchestrator panicked");
                self.completion = Some(Completion {
                    status: OrchestrationStatus::Failed,
                    result: None,
                    failure: Some(FailureDetails::new(failure::PANICKED, message)),
                    carryover_events: Vec::new(),
                    preserve_late_events: false,
                    discard_actions: false,
                });
            }
        }
    }

    fn complete(&mut self, result: anyhow::Result<String>) {
        let completion = match result {
            Ok(output) => {
                let mut inner = self.ctx.lock();
                match inner.continue_as_new.take() {
                    Some(next) => {
                        let carryover_events = if next.preserve_unprocessed_events {
                            let at = inner.current_utc;
                            inner
                                .events
                                .drain_buffered()
                                .into_iter()
                                .map(|(name, input)| HistoryEvent::at(at, EventKind::EventRaised { name, input }))
                                .collect()
                        } else {
                            Vec::new()
                        };
                        Completion {
                            status: OrchestrationStatus::ContinuedAsNew,
                            result: Some(next.input),
                            failure: None,
                            carryover_events,
                            preserve_late_events: next.preserve_unprocessed_events,
                            discard_actions: false,
                        }
                    }
                    None => Completion {
                        status: OrchestrationStatus::Completed,
                        result: Some(output),
                        failure: None,
                        carryover_events: Vec::new(),
                        preserve_late_events: false,
                        discard_actions: false,
                    },
                }
            }
            Err(err) => Completion {
                status: OrchestrationStatus::Failed,
                result: None,
                failure: Some(FailureDetails::from_error(&err, self.failure_provider.as_deref())),
                carryover_events: Vec::new(),
                preserve_late_events: false,
                discard_actions: false,
            },
        };
        debug!(instance_id = %self.instance_id, status = ?completion.status, "orchestrator function returned");
        self.completion = Some(completion);
    }

    fn build_turn(&self) -> TurnResult {
        let inner = self.ctx.lock();
        let custom_status = inner.custom_status.clone();
        let discard = self.completion.as_ref().is_some_and(|c| c.discard_actions);
        let mut actions: Vec<OrchestratorAction> = if discard {
            Vec::new()
        } else {
            inner.pending_actions.values().cloned().collect()
        };
        if let Some(c) = &self.completion {
            actions.push(OrchestratorAction {
                id: inner.next_sequence_id(),
                kind: ActionKind::CompleteOrchestration {
                    status: c.status,
                    result: c.result.clone(),
                    failure: c.failure.clone(),
                    carryover_events: c.carryover_events.clone(),
                },
            });
        }
        TurnResult { actions, custom_status }
    }
}

fn is_scheduling(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::TaskScheduled { .. }
            | EventKind::TimerCreated { .. }
            | EventKind::SubOrchestrationInstanceCreated { .. }
            | EventKind::EventSent { .. }
    )
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}
