//! The orchestration context: the only API orchestrator code uses to talk to
//! the outside world.
//!
//! Every scheduling call allocates the next sequence id, records an action and
//! returns a future bound to that id. Replay feeds recorded results back by
//! id, so the same code observes the same results in the same order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::task::{Poll, Waker};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::codec;
use crate::error::{TaskError, TaskFailedError};
use crate::failure::FailureDetails;
use crate::futures::{DurableFuture, TaskFuture, TimerFuture};
use crate::retry::{self, SubOrchestrationOptions, TaskOptions};
use crate::runtime::event_dispatcher::EventDispatcher;
use crate::runtime::limits::MAX_CUSTOM_STATUS_BYTES;
use crate::{ActionKind, OrchestratorAction, ParentInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Activity,
    SubOrchestration,
    Timer,
    EventWait,
}

impl TaskKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TaskKind::Activity => "activity",
            TaskKind::SubOrchestration => "sub-orchestration",
            TaskKind::Timer => "timer",
            TaskKind::EventWait => "external event",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskState {
    Scheduled,
    Completed(String),
    Failed(FailureDetails),
    Cancelled,
    /// Result already handed to the awaiting future.
    Consumed,
}

#[derive(Debug)]
pub(crate) struct PendingTask {
    pub(crate) kind: TaskKind,
    pub(crate) name: String,
    pub(crate) state: TaskState,
    pub(crate) token: Option<usize>,
    pub(crate) waker: Option<Waker>,
}

impl PendingTask {
    pub(crate) fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ContinueAsNew {
    pub(crate) input: String,
    pub(crate) preserve_unprocessed_events: bool,
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    pub(crate) name: String,
    pub(crate) version: Option<String>,
    pub(crate) execution_id: String,
    pub(crate) parent: Option<ParentInstance>,
    pub(crate) current_utc: DateTime<Utc>,
    pub(crate) is_replaying: bool,
    next_sequence_id: u64,
    guid_counter: u64,
    /// Actions not yet confirmed by a scheduling event in history.
    pub(crate) pending_actions: BTreeMap<u64, OrchestratorAction>,
    pub(crate) tasks: HashMap<u64, PendingTask>,
    pub(crate) events: EventDispatcher<u64>,
    tokens: Vec<bool>,
    /// Timer id -> token cancelled when that timer fires.
    pub(crate) timeout_tokens: HashMap<u64, usize>,
    pub(crate) custom_status: Option<String>,
    pub(crate) continue_as_new: Option<ContinueAsNew>,
}

impl CtxInner {
    fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            name: String::new(),
            version: None,
            execution_id: String::new(),
            parent: None,
            current_utc: DateTime::<Utc>::UNIX_EPOCH,
            is_replaying: false,
            next_sequence_id: 0,
            guid_counter: 0,
            pending_actions: BTreeMap::new(),
            tasks: HashMap::new(),
            events: EventDispatcher::new(),
            tokens: Vec::new(),
            timeout_tokens: HashMap::new(),
            custom_status: None,
            continue_as_new: None,
        }
    }

    pub(crate) fn next_sequence_id(&self) -> u64 {
        self.next_sequence_id
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        id
    }

    fn new_token(&mut self) -> usize {
        self.tokens.push(false);
        self.tokens.len() - 1
    }

    pub(crate) fn is_token_cancelled(&self, token: usize) -> bool {
        self.tokens.get(token).copied().unwrap_or(false)
    }

    /// Trigger a token and resolve every still-scheduled task that observes it.
    pub(crate) fn cancel_token(&mut self, token: usize) {
        match self.tokens.get_mut(token) {
            Some(flag) if !*flag => *flag = true,
            _ => return,
        }
        let mut affected: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.token == Some(token) && t.state == TaskState::Scheduled)
            .map(|(id, _)| *id)
            .collect();
        affected.sort_unstable();

        for id in affected {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.state = TaskState::Cancelled;
                if task.kind == TaskKind::EventWait {
                    self.events.remove(&task.name, &id);
                }
                task.wake();
            }
        }
    }

    /// A dropped event-wait future gives up its place on the waiter stack.
    pub(crate) fn abandon_wait(&mut self, id: u64) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.kind == TaskKind::EventWait && task.state == TaskState::Scheduled {
                task.state = TaskState::Cancelled;
                self.events.remove(&task.name, &id);
            }
        }
    }

    pub(crate) fn poll_task(&mut self, id: u64, waker: &Waker) -> Poll<Result<String, TaskError>> {
        let Some(task) = self.tasks.get_mut(&id) else {
            return Poll::Ready(Err(TaskError::cancelled("<unknown>", Some(id))));
        };
        match std::mem::replace(&mut task.state, TaskState::Consumed) {
            TaskState::Scheduled => {
                task.state = TaskState::Scheduled;
                task.waker = Some(waker.clone());
                Poll::Pending
            }
            TaskState::Completed(value) => Poll::Ready(Ok(value)),
            TaskState::Failed(failure) => Poll::Ready(Err(TaskError::Failed(TaskFailedError {
                task_name: task.name.clone(),
                task_id: id,
                failure,
            }))),
            TaskState::Cancelled => {
                task.state = TaskState::Cancelled;
                Poll::Ready(Err(TaskError::cancelled(task.name.clone(), Some(id))))
            }
            TaskState::Consumed => Poll::Pending,
        }
    }
}

/// Handle passed to orchestrator functions. Cheap to clone.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(inner) => f
                .debug_struct("OrchestrationContext")
                .field("instance_id", &inner.instance_id)
                .field("next_sequence_id", &inner.next_sequence_id)
                .field("is_replaying", &inner.is_replaying)
                .finish(),
            None => f.write_str("OrchestrationContext(<locked>)"),
        }
    }
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id.into()))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, CtxInner>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub(crate) fn same_instance(&self, other: &OrchestrationContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    /// Registered name of the running orchestrator.
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn version(&self) -> Option<String> {
        self.lock().version.clone()
    }

    pub fn execution_id(&self) -> String {
        self.lock().execution_id.clone()
    }

    pub fn parent(&self) -> Option<ParentInstance> {
        self.lock().parent.clone()
    }

    /// True while the orchestrator is re-executing recorded history.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    /// Deterministic current time: the timestamp of the latest `OrchestratorStarted` event.
    pub fn current_utc_datetime(&self) -> DateTime<Utc> {
        self.lock().current_utc
    }

    /// Deterministic UUID derived from the instance id and the current position in the code.
    pub fn new_guid(&self) -> Uuid {
        let mut inner = self.lock();
        let counter = inner.guid_counter;
        inner.guid_counter += 1;
        let name = format!("{}:{}:{}", inner.instance_id, inner.next_sequence_id, counter);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }

    /// Set the custom status reported alongside the orchestration's state.
    ///
    /// Values larger than [`MAX_CUSTOM_STATUS_BYTES`] are rejected and the previous
    /// status is kept.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        let status = status.into();
        if status.len() > MAX_CUSTOM_STATUS_BYTES {
            crate::durable_warn!(
                self,
                size = status.len(),
                limit = MAX_CUSTOM_STATUS_BYTES,
                "custom status too large; ignoring"
            );
            return;
        }
        self.lock().custom_status = Some(status);
    }

    pub fn clear_custom_status(&self) {
        self.lock().custom_status = None;
    }

    pub fn custom_status(&self) -> Option<String> {
        self.lock().custom_status.clone()
    }

    fn schedule(
        &self,
        kind: TaskKind,
        name: String,
        token: &CancellationToken,
        action: Option<ActionKind>,
    ) -> DurableFuture {
        let slot = token.slot_for(self);
        let mut inner = self.lock();
        if slot.is_some_and(|s| inner.is_token_cancelled(s)) {
            return DurableFuture::ready(Err(TaskError::cancelled(name, None)));
        }

        let id = inner.allocate_id();
        if let Some(kind) = action {
            inner.pending_actions.insert(id, OrchestratorAction { id, kind });
        }
        let state = match kind {
            TaskKind::EventWait => match inner.events.register(&name, id) {
                Some(payload) => TaskState::Completed(payload),
                None => TaskState::Scheduled,
            },
            _ => TaskState::Scheduled,
        };
        inner.tasks.insert(
            id,
            PendingTask {
                kind,
                name,
                state,
                token: slot,
                waker: None,
            },
        );
        drop(inner);
        DurableFuture::pending(self.clone(), id)
    }

    pub(crate) fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        token: &CancellationToken,
    ) -> DurableFuture {
        let name = name.into();
        let action = ActionKind::ScheduleTask {
            name: name.clone(),
            input: input.into(),
        };
        self.schedule(TaskKind::Activity, name, token, Some(action))
    }

    pub(crate) fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        version: Option<String>,
        instance_id: Option<String>,
        input: impl Into<String>,
        token: &CancellationToken,
    ) -> DurableFuture {
        let name = name.into();
        let instance_id = instance_id.unwrap_or_else(|| self.new_guid().to_string());
        let action = ActionKind::CreateSubOrchestration {
            name: name.clone(),
            version,
            instance_id,
            input: input.into(),
        };
        self.schedule(TaskKind::SubOrchestration, name, token, Some(action))
    }

    fn schedule_timer(&self, fire_at: DateTime<Utc>, token: &CancellationToken) -> DurableFuture {
        self.schedule(
            TaskKind::Timer,
            "timer".to_string(),
            token,
            Some(ActionKind::CreateTimer { fire_at }),
        )
    }

    fn fire_at(&self, delay: Duration) -> DateTime<Utc> {
        let now = self.current_utc_datetime();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Schedule an activity and await its raw string result.
    pub fn call_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity(name, input, &CancellationToken::none())
    }

    /// Schedule an activity with retry and cancellation options.
    pub fn call_activity_with_options(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: TaskOptions,
    ) -> TaskFuture {
        let ctx = self.clone();
        let name = name.into();
        let input = input.into();
        let label = name.clone();
        retry::run_with_retry(self.clone(), label, options, move |token| {
            ctx.schedule_activity(name.clone(), input.clone(), token)
        })
        .boxed()
    }

    /// Schedule an activity, encoding the input and decoding the result as JSON.
    pub fn call_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<Out>>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let encoded = codec::encode(input);
        let ctx = self.clone();
        let name = name.into();
        async move {
            let result = ctx.call_activity(name, encoded?).await?;
            codec::decode(&result)
        }
        .boxed()
    }

    /// Start a sub-orchestration with a generated instance id.
    pub fn call_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_sub_orchestration(name, None, None, input, &CancellationToken::none())
    }

    pub fn call_sub_orchestration_with_options(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: SubOrchestrationOptions,
    ) -> TaskFuture {
        let ctx = self.clone();
        let name = name.into();
        let input = input.into();
        let label = name.clone();
        let SubOrchestrationOptions {
            task,
            instance_id,
            version,
        } = options;
        retry::run_with_retry(self.clone(), label, task, move |token| {
            ctx.schedule_sub_orchestration(name.clone(), version.clone(), instance_id.clone(), input.clone(), token)
        })
        .boxed()
    }

    pub fn call_sub_orchestration_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<Out>>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let encoded = codec::encode(input);
        let ctx = self.clone();
        let name = name.into();
        async move {
            let result = ctx.call_sub_orchestration(name, encoded?).await?;
            codec::decode(&result)
        }
        .boxed()
    }

    /// Durable timer firing `delay` after the current orchestration time.
    pub fn create_timer(&self, delay: Duration) -> TimerFuture {
        self.create_timer_with_cancellation(delay, &CancellationToken::none())
    }

    pub fn create_timer_at(&self, fire_at: DateTime<Utc>) -> TimerFuture {
        TimerFuture::new(self.schedule_timer(fire_at, &CancellationToken::none()))
    }

    pub fn create_timer_with_cancellation(&self, delay: Duration, token: &CancellationToken) -> TimerFuture {
        let fire_at = self.fire_at(delay);
        TimerFuture::new(self.schedule_timer(fire_at, token))
    }

    /// Wait for the next external event with this name (case-insensitive).
    pub fn wait_for_external_event(&self, name: impl Into<String>) -> DurableFuture {
        self.wait_for_external_event_with_cancellation(name, &CancellationToken::none())
    }

    pub fn wait_for_external_event_with_cancellation(
        &self,
        name: impl Into<String>,
        token: &CancellationToken,
    ) -> DurableFuture {
        self.schedule(TaskKind::EventWait, name.into(), token, None)
    }

    /// Wait for an external event, resolving with [`TaskError::Cancelled`] if it does
    /// not arrive before a durable timeout timer fires.
    pub fn wait_for_external_event_with_timeout(&self, name: impl Into<String>, timeout: Duration) -> TaskFuture {
        let source = self.cancel_after(timeout);
        let wait = self.wait_for_external_event_with_cancellation(name, &source.token());
        wait.boxed()
    }

    pub fn wait_for_external_event_typed<Out>(
        &self,
        name: impl Into<String>,
    ) -> futures::future::BoxFuture<'static, anyhow::Result<Out>>
    where
        Out: DeserializeOwned + Send + 'static,
    {
        let wait = self.wait_for_external_event(name);
        async move {
            let payload = wait.await?;
            codec::decode(&payload)
        }
        .boxed()
    }

    /// Fire-and-forget: raise an event on another orchestration instance.
    pub fn send_event(&self, instance_id: impl Into<String>, name: impl Into<String>, data: impl Into<String>) {
        let mut inner = self.lock();
        let id = inner.allocate_id();
        inner.pending_actions.insert(
            id,
            OrchestratorAction {
                id,
                kind: ActionKind::SendEvent {
                    instance_id: instance_id.into(),
                    name: name.into(),
                    data: data.into(),
                },
            },
        );
    }

    /// Restart this orchestration with fresh history once the current function returns.
    ///
    /// With `preserve_unprocessed_events`, external events that were buffered but never
    /// awaited are carried into the new generation.
    pub fn continue_as_new(&self, input: impl Into<String>, preserve_unprocessed_events: bool) {
        self.lock().continue_as_new = Some(ContinueAsNew {
            input: input.into(),
            preserve_unprocessed_events,
        });
    }

    pub fn new_cancellation_source(&self) -> CancellationSource {
        let id = self.lock().new_token();
        CancellationSource::new(self.clone(), id)
    }

    /// A cancellation source that triggers when a durable timer fires after `delay`.
    pub fn cancel_after(&self, delay: Duration) -> CancellationSource {
        let fire_at = self.fire_at(delay);
        let mut inner = self.lock();
        let token = inner.new_token();
        let timer_id = inner.allocate_id();
        inner.pending_actions.insert(
            timer_id,
            OrchestratorAction {
                id: timer_id,
                kind: ActionKind::CreateTimer { fire_at },
            },
        );
        inner.tasks.insert(
            timer_id,
            PendingTask {
                kind: TaskKind::Timer,
                name: "timeout".to_string(),
                state: TaskState::Scheduled,
                token: None,
                waker: None,
            },
        );
        inner.timeout_tokens.insert(timer_id, token);
        drop(inner);
        CancellationSource::new(self.clone(), token)
    }
}
