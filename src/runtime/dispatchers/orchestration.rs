//! Orchestration dispatcher.
//!
//! Fetches orchestration work items, runs one turn per item (reusing a cached
//! executor when extended sessions are on) and sends the resulting actions
//! back, chunked to the configured budget.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::WorkerShared;
use super::super::replay_engine::{OrchestrationExecutor, TurnResult};
use crate::error::WorkerError;
use crate::failure::FailureDetails;
use crate::payloads::chunking;
use crate::transport::{OrchestrationCompletion, OrchestrationWorkItem};
use crate::{ActionKind, EventKind, HistoryEvent, OrchestrationStatus, OrchestratorAction};

/// Name, version and execution id recorded by the execution's `ExecutionStarted`.
struct StartInfo {
    name: String,
    version: Option<String>,
    execution_id: String,
}

fn start_info(past: &[HistoryEvent], new: &[HistoryEvent]) -> Option<StartInfo> {
    past.iter().chain(new.iter()).find_map(|e| match &e.kind {
        EventKind::ExecutionStarted {
            name,
            version,
            execution_id,
            ..
        } => Some(StartInfo {
            name: name.clone(),
            version: version.clone(),
            execution_id: execution_id.clone(),
        }),
        _ => None,
    })
}

/// A turn that fails the instance without running user code.
fn failed_turn(id: u64, failure: FailureDetails) -> TurnResult {
    TurnResult {
        actions: vec![OrchestratorAction {
            id,
            kind: ActionKind::CompleteOrchestration {
                status: OrchestrationStatus::Failed,
                result: None,
                failure: Some(failure),
                carryover_events: Vec::new(),
            },
        }],
        custom_status: None,
    }
}

impl WorkerShared {
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutting_down() {
                    debug!("orchestration dispatcher exiting");
                    break;
                }
                let Ok(permit) = Arc::clone(&self.orchestration_slots).acquire_owned().await else {
                    break;
                };
                match self.transport.fetch_orchestration_work_item().await {
                    Ok(Some(item)) => {
                        let shared = Arc::clone(&self);
                        tokio::spawn(async move {
                            shared.process_orchestration_item(item).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        self.pause(self.options.idle_poll_interval).await;
                    }
                    Err(e) => {
                        drop(permit);
                        warn!(error = %e, retryable = e.is_retryable(), "failed to fetch orchestration work item");
                        self.pause(self.options.idle_poll_interval).await;
                    }
                }
            }
        })
    }

    async fn process_orchestration_item(&self, item: OrchestrationWorkItem) {
        let OrchestrationWorkItem {
            instance_id,
            completion_token,
            mut past_events,
            mut new_events,
        } = item;

        if let Some(ext) = &self.options.large_payloads {
            let resolved = match ext.resolve_events(&mut past_events).await {
                Ok(()) => ext.resolve_events(&mut new_events).await,
                Err(e) => Err(e),
            };
            if let Err(e) = resolved {
                warn!(instance_id = %instance_id, error = %e, "failed to resolve externalized payloads");
                self.abandon(&instance_id, &completion_token).await;
                return;
            }
        }

        self.metrics.record_turn();
        let (executor, turn) = self.run_turn(&instance_id, &past_events, &new_events);
        let status = turn.status();
        let completion_id = turn
            .completion()
            .map(|a| a.id)
            .or_else(|| executor.as_ref().map(|e| e.context().lock().next_sequence_id()))
            .unwrap_or(0);

        let completion = match self.prepare_completion(&instance_id, &completion_token, turn, completion_id).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "failed to prepare orchestration completion");
                if let Some(sessions) = &self.sessions {
                    sessions.remove(&instance_id);
                }
                self.abandon(&instance_id, &completion_token).await;
                return;
            }
        };
        let final_status = completion
            .last()
            .and_then(|c| c.actions.last())
            .map(|a| match &a.kind {
                ActionKind::CompleteOrchestration { status, .. } => *status,
                _ => OrchestrationStatus::Running,
            })
            .unwrap_or(status);

        for chunk in completion {
            let chunk_index = chunk.chunk_index;
            if let Err(e) = self.transport.complete_orchestration(chunk).await {
                warn!(
                    instance_id = %instance_id,
                    chunk_index,
                    error = %e,
                    "failed to deliver orchestration completion"
                );
                if let Some(sessions) = &self.sessions {
                    sessions.remove(&instance_id);
                }
                self.abandon(&instance_id, &completion_token).await;
                return;
            }
        }

        if final_status.is_terminal() {
            self.metrics.record_orchestration_outcome(final_status == OrchestrationStatus::Failed);
        }
        debug!(instance_id = %instance_id, status = ?final_status, "orchestration turn completed");

        if let (Some(sessions), Some(executor)) = (&self.sessions, executor) {
            if final_status == OrchestrationStatus::Running {
                sessions.put(executor);
            } else {
                sessions.remove(&instance_id);
            }
        }
    }

    /// Run one turn. Returns the executor when user code ran, for the session cache.
    fn run_turn(
        &self,
        instance_id: &str,
        past_events: &[HistoryEvent],
        new_events: &[HistoryEvent],
    ) -> (Option<OrchestrationExecutor>, TurnResult) {
        let Some(start) = start_info(past_events, new_events) else {
            error!(instance_id = %instance_id, "work item history has no ExecutionStarted event");
            let failure = FailureDetails::non_determinism("history has no ExecutionStarted event");
            return (None, failed_turn(0, failure));
        };

        let cached = self
            .sessions
            .as_ref()
            .and_then(|s| s.take(instance_id, &start.execution_id, past_events.len()));
        let mut executor = match cached {
            Some(executor) => {
                debug!(instance_id = %instance_id, processed = executor.processed_events(), "resuming cached session");
                self.metrics.record_session_hit();
                executor
            }
            None => {
                let Some((version, handler)) = self
                    .orchestrations
                    .resolve_for_execution(&start.name, start.version.as_deref())
                else {
                    warn!(
                        instance_id = %instance_id,
                        name = %start.name,
                        version = ?start.version,
                        "orchestrator is not registered"
                    );
                    let failure = FailureDetails::task_not_found("orchestrator", &start.name);
                    return (None, failed_turn(0, failure));
                };
                debug!(instance_id = %instance_id, name = %start.name, version = %version, "starting replay");
                OrchestrationExecutor::new(instance_id, handler)
                    .with_failure_provider(self.options.failure_properties_provider.clone())
            }
        };

        let turn = executor.execute(past_events, new_events);
        (Some(executor), turn)
    }

    /// Externalize payloads and split the turn into chunks.
    ///
    /// An action that cannot fit a chunk fails the instance instead; `completion_id`
    /// is the sequence id used for that failure.
    async fn prepare_completion(
        &self,
        instance_id: &str,
        completion_token: &str,
        turn: TurnResult,
        completion_id: u64,
    ) -> Result<Vec<OrchestrationCompletion>, WorkerError> {
        let TurnResult {
            mut actions,
            mut custom_status,
        } = turn;
        if let Some(ext) = &self.options.large_payloads {
            let externalized = match ext.externalize_actions(&mut actions).await {
                Ok(()) => match custom_status.as_mut() {
                    Some(status) => ext.externalize(status).await,
                    None => Ok(()),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = externalized {
                warn!(instance_id = %instance_id, error = %e, "payload externalization failed; failing orchestration");
                return Ok(vec![OrchestrationCompletion::new(
                    instance_id,
                    completion_token,
                    failed_turn(completion_id, e.to_failure_details()).actions,
                    None,
                )]);
            }
        }

        let completion = OrchestrationCompletion::new(instance_id, completion_token, actions, custom_status);
        match chunking::split_completion(completion, self.options.max_chunk_bytes) {
            Ok(chunks) => {
                if chunks.len() > 1 {
                    debug!(instance_id = %instance_id, chunks = chunks.len(), "completion split into chunks");
                }
                Ok(chunks)
            }
            Err(e @ (WorkerError::PayloadTooLarge { .. } | WorkerError::CustomStatusTooLarge { .. })) => {
                error!(instance_id = %instance_id, error = %e, "completion exceeds chunk budget; failing orchestration");
                Ok(vec![OrchestrationCompletion::new(
                    instance_id,
                    completion_token,
                    failed_turn(completion_id, e.to_failure_details()).actions,
                    None,
                )])
            }
            Err(e) => Err(e),
        }
    }

    async fn abandon(&self, instance_id: &str, completion_token: &str) {
        self.metrics.record_abandon();
        if let Err(e) = self
            .transport
            .abandon_orchestration_work_item(instance_id, completion_token)
            .await
        {
            warn!(instance_id = %instance_id, error = %e, "failed to abandon orchestration work item");
        }
    }
}
