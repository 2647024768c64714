//! In-process task hub for tests and local development.
//!
//! Owns instance history, hands out one orchestration work item per instance
//! at a time, queues activities, fires durable timers with tokio, routes
//! sub-orchestration results and sent events, and restarts instances on
//! continue-as-new. Nothing is persisted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ActivityResult, ActivityWorkItem, OrchestrationCompletion, OrchestrationWorkItem, TransportError,
    WorkItemTransport,
};
use crate::failure::FailureDetails;
use crate::payloads::chunking;
use crate::payloads::PayloadStore;
use crate::{ActionKind, EventKind, HistoryEvent, OrchestrationStatus, OrchestratorAction, ParentInstance};

/// Client-visible snapshot of an orchestration instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub instance_id: String,
    pub name: String,
    pub version: Option<String>,
    pub execution_id: String,
    pub status: OrchestrationStatus,
    pub input: String,
    pub output: Option<String>,
    pub failure: Option<FailureDetails>,
    pub custom_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LockedTurn {
    token: String,
    delivered: Vec<HistoryEvent>,
    chunks: Vec<OrchestrationCompletion>,
}

#[derive(Debug)]
struct Instance {
    state: InstanceState,
    parent: Option<ParentInstance>,
    history: Vec<HistoryEvent>,
    inbox: Vec<HistoryEvent>,
    locked: Option<LockedTurn>,
}

#[derive(Debug, Clone)]
struct OutstandingActivity {
    instance_id: String,
    execution_id: String,
    task_id: u64,
}

#[derive(Debug, Default)]
struct HubState {
    instances: HashMap<String, Instance>,
    ready: VecDeque<String>,
    activities: VecDeque<ActivityWorkItem>,
    outstanding_activities: HashMap<String, OutstandingActivity>,
    next_token: u64,
}

impl HubState {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}-{}", self.next_token)
    }

    fn execution_id(&mut self, instance_id: &str) -> String {
        self.next_token += 1;
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{instance_id}/{}/{}", self.next_token, Utc::now().timestamp_nanos_opt().unwrap_or_default())
                .as_bytes(),
        )
        .to_string()
    }

    fn mark_ready(&mut self, instance_id: &str) {
        let Some(inst) = self.instances.get(instance_id) else {
            return;
        };
        if inst.locked.is_none() && !inst.inbox.is_empty() && !self.ready.iter().any(|i| i == instance_id) {
            self.ready.push_back(instance_id.to_string());
        }
    }

    /// Deliver an event to a running instance. Events for finished or unknown
    /// instances are dropped.
    fn deliver(&mut self, instance_id: &str, event: HistoryEvent) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(inst) if !inst.state.status.is_terminal() => {
                inst.inbox.push(event);
                self.mark_ready(instance_id);
                true
            }
            Some(_) => {
                debug!(instance_id, event = event.kind_name(), "dropping event for finished instance");
                false
            }
            None => {
                debug!(instance_id, event = event.kind_name(), "dropping event for unknown instance");
                false
            }
        }
    }

    fn create_instance(
        &mut self,
        instance_id: &str,
        name: &str,
        version: Option<String>,
        input: String,
        parent: Option<ParentInstance>,
    ) -> Result<(), TransportError> {
        if let Some(existing) = self.instances.get(instance_id) {
            if !existing.state.status.is_terminal() {
                return Err(TransportError::permanent(
                    "schedule_new_orchestration",
                    format!("instance '{instance_id}' already exists and is running"),
                ));
            }
        }
        let execution_id = self.execution_id(instance_id);
        let now = Utc::now();
        let started = HistoryEvent::new(EventKind::ExecutionStarted {
            name: name.to_string(),
            version: version.clone(),
            input: input.clone(),
            execution_id: execution_id.clone(),
            parent: parent.clone(),
        });
        self.instances.insert(
            instance_id.to_string(),
            Instance {
                state: InstanceState {
                    instance_id: instance_id.to_string(),
                    name: name.to_string(),
                    version,
                    execution_id,
                    status: OrchestrationStatus::Running,
                    input,
                    output: None,
                    failure: None,
                    custom_status: None,
                    created_at: now,
                    last_updated_at: now,
                },
                parent,
                history: Vec::new(),
                inbox: vec![started],
                locked: None,
            },
        );
        self.mark_ready(instance_id);
        Ok(())
    }
}

/// In-memory backend implementing [`WorkItemTransport`] plus client operations.
#[derive(Clone, Default)]
pub struct InMemoryTaskHub {
    state: Arc<Mutex<HubState>>,
    changed: Arc<Notify>,
    payload_store: Option<Arc<dyn PayloadStore>>,
}

impl InMemoryTaskHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve externalized payloads when reading instance state.
    pub fn with_payload_store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.payload_store = Some(store);
        self
    }

    /// Start a new instance with a generated id.
    pub async fn schedule_new_orchestration(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<String, TransportError> {
        let name = name.into();
        let instance_id = {
            let mut state = self.state.lock().await;
            let seed = state.token("instance");
            Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{name}/{seed}/{}", Utc::now()).as_bytes()).to_string()
        };
        self.schedule_new_orchestration_with_id(instance_id.clone(), name, input, None)
            .await?;
        Ok(instance_id)
    }

    pub async fn schedule_new_orchestration_with_id(
        &self,
        instance_id: impl Into<String>,
        name: impl Into<String>,
        input: impl Into<String>,
        version: Option<String>,
    ) -> Result<(), TransportError> {
        let instance_id = instance_id.into();
        let name = name.into();
        self.state
            .lock()
            .await
            .create_instance(&instance_id, &name, version, input.into(), None)?;
        debug!(instance_id = %instance_id, orchestration = %name, "scheduled new orchestration");
        self.changed.notify_waiters();
        Ok(())
    }

    pub async fn raise_event(
        &self,
        instance_id: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.instances.contains_key(instance_id) {
            return Err(TransportError::permanent(
                "raise_event",
                format!("instance '{instance_id}' not found"),
            ));
        }
        state.deliver(
            instance_id,
            HistoryEvent::new(EventKind::EventRaised {
                name: name.into(),
                input: data.into(),
            }),
        );
        Ok(())
    }

    pub async fn terminate(&self, instance_id: &str, reason: impl Into<String>) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if !state.instances.contains_key(instance_id) {
            return Err(TransportError::permanent("terminate", format!("instance '{instance_id}' not found")));
        }
        state.deliver(
            instance_id,
            HistoryEvent::new(EventKind::ExecutionTerminated { reason: reason.into() }),
        );
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: &str) -> Option<InstanceState> {
        let snapshot = self
            .state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|i| i.state.clone())?;
        Some(self.resolve_state(snapshot).await)
    }

    /// Committed history of the current execution.
    pub async fn get_history(&self, instance_id: &str) -> Vec<HistoryEvent> {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|i| i.history.clone())
            .unwrap_or_default()
    }

    /// Wait until the instance reaches a terminal state.
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceState, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            match self.get_instance(instance_id).await {
                Some(s) if s.status.is_terminal() => return Ok(s),
                Some(_) => {}
                None => {
                    return Err(TransportError::permanent(
                        "wait_for_completion",
                        format!("instance '{instance_id}' not found"),
                    ));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TransportError::retryable(
                    "wait_for_completion",
                    format!("timed out waiting for instance '{instance_id}'"),
                ));
            }
        }
    }

    /// Remove a finished instance. Returns false when it is unknown or still running.
    pub async fn purge_instance(&self, instance_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.instances.get(instance_id) {
            Some(inst) if inst.state.status.is_terminal() => {
                state.instances.remove(instance_id);
                true
            }
            _ => false,
        }
    }

    async fn resolve_state(&self, mut snapshot: InstanceState) -> InstanceState {
        let Some(store) = &self.payload_store else {
            return snapshot;
        };
        for value in [&mut snapshot.output, &mut snapshot.custom_status].into_iter().flatten() {
            if store.is_reference(value) {
                match store.download(value).await {
                    Ok(resolved) => *value = resolved,
                    Err(e) => warn!(instance_id = %snapshot.instance_id, error = %e, "failed to resolve payload"),
                }
            }
        }
        snapshot
    }

    fn spawn_timer(&self, instance_id: String, execution_id: String, timer_id: u64, fire_at: DateTime<Utc>) {
        let hub = self.clone();
        let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = hub.state.lock().await;
            let current = state
                .instances
                .get(&instance_id)
                .is_some_and(|i| i.state.execution_id == execution_id);
            if current {
                state.deliver(&instance_id, HistoryEvent::new(EventKind::TimerFired { timer_id, fire_at }));
            }
        });
    }

    fn apply_completion(
        &self,
        state: &mut HubState,
        instance_id: &str,
        completion: OrchestrationCompletion,
    ) -> Result<(), TransportError> {
        let Some(inst) = state.instances.get_mut(instance_id) else {
            return Err(TransportError::permanent(
                "complete_orchestration",
                format!("instance '{instance_id}' not found"),
            ));
        };
        let Some(turn) = inst.locked.take() else {
            return Err(TransportError::permanent("complete_orchestration", "instance is not locked"));
        };
        inst.history.extend(turn.delivered);
        inst.state.custom_status = completion.custom_status;
        inst.state.last_updated_at = Utc::now();
        let execution_id = inst.state.execution_id.clone();

        let mut outgoing: Vec<(String, HistoryEvent)> = Vec::new();
        let mut children: Vec<(String, String, Option<String>, String, ParentInstance)> = Vec::new();
        let mut timers: Vec<(u64, DateTime<Utc>)> = Vec::new();
        let mut finished: Option<(OrchestrationStatus, Option<String>, Option<FailureDetails>, Vec<HistoryEvent>)> =
            None;

        for OrchestratorAction { id, kind } in completion.actions {
            match kind {
                ActionKind::ScheduleTask { name, input } => {
                    inst.history.push(HistoryEvent::new(EventKind::TaskScheduled {
                        id,
                        name: name.clone(),
                        input: input.clone(),
                    }));
                    state.next_token += 1;
                    let token = format!("activity-{}", state.next_token);
                    state.outstanding_activities.insert(
                        token.clone(),
                        OutstandingActivity {
                            instance_id: instance_id.to_string(),
                            execution_id: execution_id.clone(),
                            task_id: id,
                        },
                    );
                    state.activities.push_back(ActivityWorkItem {
                        instance_id: instance_id.to_string(),
                        task_id: id,
                        name,
                        input,
                        completion_token: token,
                    });
                }
                ActionKind::CreateTimer { fire_at } => {
                    inst.history.push(HistoryEvent::new(EventKind::TimerCreated { id, fire_at }));
                    timers.push((id, fire_at));
                }
                ActionKind::CreateSubOrchestration {
                    name,
                    version,
                    instance_id: child_id,
                    input,
                } => {
                    inst.history.push(HistoryEvent::new(EventKind::SubOrchestrationInstanceCreated {
                        id,
                        name: name.clone(),
                        version: version.clone(),
                        instance_id: child_id.clone(),
                        input: input.clone(),
                    }));
                    children.push((
                        child_id,
                        name,
                        version,
                        input,
                        ParentInstance {
                            instance_id: instance_id.to_string(),
                            task_scheduled_id: id,
                        },
                    ));
                }
                ActionKind::SendEvent {
                    instance_id: target,
                    name,
                    data,
                } => {
                    inst.history.push(HistoryEvent::new(EventKind::EventSent {
                        id,
                        instance_id: target.clone(),
                        name: name.clone(),
                        input: data.clone(),
                    }));
                    outgoing.push((target, HistoryEvent::new(EventKind::EventRaised { name, input: data })));
                }
                ActionKind::CompleteOrchestration {
                    status,
                    result,
                    failure,
                    carryover_events,
                } => {
                    inst.history.push(HistoryEvent::new(EventKind::ExecutionCompleted {
                        status,
                        result: result.clone(),
                        failure: failure.clone(),
                    }));
                    finished = Some((status, result, failure, carryover_events));
                }
            }
        }

        let parent = inst.parent.clone();
        for (timer_id, fire_at) in timers {
            self.spawn_timer(instance_id.to_string(), execution_id.clone(), timer_id, fire_at);
        }

        if let Some((status, result, failure, carryover)) = finished {
            if status == OrchestrationStatus::ContinuedAsNew {
                let input = result.unwrap_or_default();
                let new_execution = state.execution_id(instance_id);
                if let Some(inst) = state.instances.get_mut(instance_id) {
                    let started = HistoryEvent::new(EventKind::ExecutionStarted {
                        name: inst.state.name.clone(),
                        version: inst.state.version.clone(),
                        input: input.clone(),
                        execution_id: new_execution.clone(),
                        parent: inst.parent.clone(),
                    });
                    let mut inbox = vec![started];
                    inbox.extend(carryover);
                    inbox.append(&mut inst.inbox);
                    inst.inbox = inbox;
                    inst.history.clear();
                    inst.state.execution_id = new_execution;
                    inst.state.input = input;
                    debug!(instance_id, "continued as new");
                }
            } else {
                if let Some(inst) = state.instances.get_mut(instance_id) {
                    inst.state.status = status;
                    inst.state.output = result.clone();
                    inst.state.failure = failure.clone();
                    inst.inbox.clear();
                }
                debug!(instance_id, status = ?status, "orchestration finished");
                if let Some(parent) = parent {
                    let kind = match status {
                        OrchestrationStatus::Completed => EventKind::SubOrchestrationInstanceCompleted {
                            task_scheduled_id: parent.task_scheduled_id,
                            result: result.unwrap_or_default(),
                        },
                        OrchestrationStatus::Terminated => EventKind::SubOrchestrationInstanceFailed {
                            task_scheduled_id: parent.task_scheduled_id,
                            failure: FailureDetails::new(
                                "Terminated",
                                result.unwrap_or_else(|| "terminated".to_string()),
                            ),
                        },
                        _ => EventKind::SubOrchestrationInstanceFailed {
                            task_scheduled_id: parent.task_scheduled_id,
                            failure: failure
                                .unwrap_or_else(|| FailureDetails::new("OrchestrationFailed", "sub-orchestration failed")),
                        },
                    };
                    outgoing.push((parent.instance_id, HistoryEvent::new(kind)));
                }
            }
        }

        for (child_id, name, version, input, parent) in children {
            let task_scheduled_id = parent.task_scheduled_id;
            if let Err(e) = state.create_instance(&child_id, &name, version, input, Some(parent)) {
                outgoing.push((
                    instance_id.to_string(),
                    HistoryEvent::new(EventKind::SubOrchestrationInstanceFailed {
                        task_scheduled_id,
                        failure: FailureDetails::new("SubOrchestrationCreationFailed", e.message),
                    }),
                ));
            }
        }
        for (target, event) in outgoing {
            state.deliver(&target, event);
        }
        state.mark_ready(instance_id);
        Ok(())
    }
}

#[async_trait]
impl WorkItemTransport for InMemoryTaskHub {
    async fn fetch_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, TransportError> {
        let mut state = self.state.lock().await;
        while let Some(instance_id) = state.ready.pop_front() {
            let token = state.token("orchestration");
            let Some(inst) = state.instances.get_mut(&instance_id) else {
                continue;
            };
            if inst.locked.is_some() || inst.inbox.is_empty() {
                continue;
            }
            let mut new_events = vec![HistoryEvent::new(EventKind::OrchestratorStarted)];
            new_events.append(&mut inst.inbox);
            inst.locked = Some(LockedTurn {
                token: token.clone(),
                delivered: new_events.clone(),
                chunks: Vec::new(),
            });
            return Ok(Some(OrchestrationWorkItem {
                instance_id,
                completion_token: token,
                past_events: inst.history.clone(),
                new_events,
            }));
        }
        Ok(None)
    }

    async fn fetch_activity_work_item(&self) -> Result<Option<ActivityWorkItem>, TransportError> {
        Ok(self.state.lock().await.activities.pop_front())
    }

    async fn complete_orchestration(&self, completion: OrchestrationCompletion) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let instance_id = completion.instance_id.clone();
        let Some(turn) = state
            .instances
            .get_mut(&instance_id)
            .and_then(|i| i.locked.as_mut())
            .filter(|t| t.token == completion.completion_token)
        else {
            return Err(TransportError::permanent(
                "complete_orchestration",
                format!("no outstanding work item for '{instance_id}' with this token"),
            ));
        };

        let is_partial = completion.is_partial;
        turn.chunks.push(completion);
        if is_partial {
            return Ok(());
        }
        let chunks = std::mem::take(&mut turn.chunks);
        let full = chunking::reassemble(chunks)?;
        self.apply_completion(&mut state, &instance_id, full)?;
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn complete_activity(&self, result: ActivityResult) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let Some(outstanding) = state.outstanding_activities.remove(&result.completion_token) else {
            return Err(TransportError::permanent(
                "complete_activity",
                format!("unknown completion token '{}'", result.completion_token),
            ));
        };
        let current = state
            .instances
            .get(&outstanding.instance_id)
            .is_some_and(|i| i.state.execution_id == outstanding.execution_id);
        if !current {
            debug!(instance_id = %outstanding.instance_id, task_id = outstanding.task_id, "dropping stale activity result");
            return Ok(());
        }
        let kind = match result.outcome {
            Ok(result) => EventKind::TaskCompleted {
                task_scheduled_id: outstanding.task_id,
                result,
            },
            Err(failure) => EventKind::TaskFailed {
                task_scheduled_id: outstanding.task_id,
                failure,
            },
        };
        state.deliver(&outstanding.instance_id, HistoryEvent::new(kind));
        Ok(())
    }

    async fn abandon_orchestration_work_item(
        &self,
        instance_id: &str,
        completion_token: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        let Some(inst) = state.instances.get_mut(instance_id) else {
            return Err(TransportError::permanent(
                "abandon_orchestration_work_item",
                format!("instance '{instance_id}' not found"),
            ));
        };
        match inst.locked.take() {
            Some(turn) if turn.token == completion_token => {
                // OrchestratorStarted is regenerated on the next delivery
                let mut inbox: Vec<HistoryEvent> = turn
                    .delivered
                    .into_iter()
                    .filter(|e| !matches!(e.kind, EventKind::OrchestratorStarted))
                    .collect();
                inbox.append(&mut inst.inbox);
                inst.inbox = inbox;
                state.mark_ready(instance_id);
                Ok(())
            }
            other => {
                inst.locked = other;
                Err(TransportError::permanent(
                    "abandon_orchestration_work_item",
                    "completion token does not match the outstanding work item",
                ))
            }
        }
    }
}
