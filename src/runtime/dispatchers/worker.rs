//! Activity dispatcher.
//!
//! Executes activity work items against the activity registry. Handler
//! errors and panics become failure details; nothing an activity does can
//! take the dispatcher down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::replay_engine::panic_message;
use super::super::{ActivityContext, WorkerShared};
use crate::failure::{self, FailureDetails};
use crate::transport::{ActivityResult, ActivityWorkItem};

impl WorkerShared {
    pub(in crate::runtime) fn start_activity_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_shutting_down() {
                    debug!("activity dispatcher exiting");
                    break;
                }
                let Ok(permit) = Arc::clone(&self.activity_slots).acquire_owned().await else {
                    break;
                };
                match self.transport.fetch_activity_work_item().await {
                    Ok(Some(item)) => {
                        let shared = Arc::clone(&self);
                        tokio::spawn(async move {
                            shared.process_activity_item(item).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        self.pause(self.options.idle_poll_interval).await;
                    }
                    Err(e) => {
                        drop(permit);
                        warn!(error = %e, retryable = e.is_retryable(), "failed to fetch activity work item");
                        self.pause(self.options.idle_poll_interval).await;
                    }
                }
            }
        })
    }

    async fn process_activity_item(&self, item: ActivityWorkItem) {
        let ActivityWorkItem {
            instance_id,
            task_id,
            name,
            input,
            completion_token,
        } = item;

        debug!(instance_id = %instance_id, task_id, name = %name, "activity started");
        let started = Instant::now();
        let outcome = self.execute_activity(&instance_id, task_id, &name, input).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(output) => debug!(
                instance_id = %instance_id,
                task_id,
                name = %name,
                duration_ms,
                result_size = output.len(),
                "activity completed"
            ),
            Err(failure) => warn!(
                instance_id = %instance_id,
                task_id,
                name = %name,
                duration_ms,
                error_type = %failure.error_type,
                error = %failure.error_message,
                "activity failed"
            ),
        }
        self.metrics.record_activity(&name, outcome.is_ok(), started.elapsed());

        let result = ActivityResult {
            instance_id,
            task_id,
            completion_token,
            outcome,
        };
        if let Err(e) = self.transport.complete_activity(result).await {
            warn!(task_id, name = %name, error = %e, "failed to deliver activity result");
        }
    }

    async fn execute_activity(
        &self,
        instance_id: &str,
        task_id: u64,
        name: &str,
        mut input: String,
    ) -> Result<String, FailureDetails> {
        let Some(handler) = self.activities.get(name) else {
            warn!(instance_id = %instance_id, task_id, name = %name, "activity is not registered");
            return Err(FailureDetails::task_not_found("activity", name));
        };

        if let Some(ext) = &self.options.large_payloads {
            ext.resolve(&mut input).await.map_err(|e| e.to_failure_details())?;
        }

        let ctx = ActivityContext::new(instance_id, task_id, name);
        let mut output = match AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind().await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(FailureDetails::from_error(
                    &err,
                    self.options.failure_properties_provider.as_deref(),
                ));
            }
            Err(payload) => {
                return Err(FailureDetails::new(
                    failure::ACTIVITY_PANICKED,
                    panic_message(payload.as_ref()),
                ));
            }
        };

        if let Some(ext) = &self.options.large_payloads {
            ext.externalize(&mut output).await.map_err(|e| e.to_failure_details())?;
        }
        Ok(output)
    }
}
