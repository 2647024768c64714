//! Dispatch loops of the [`Worker`](super::Worker).
//!
//! - `orchestration`: runs orchestration turns and reports completions
//! - `worker`: executes activities
//!
//! Each loop takes a concurrency permit before fetching, so no more work
//! items are pulled than the worker is allowed to run at once.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use super::WorkerShared;

mod orchestration;
mod worker;

impl WorkerShared {
    pub(super) fn start_session_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(sessions) = self.sessions.as_ref() else {
                return;
            };
            let scan_interval = sessions.options().scan_interval;
            loop {
                self.pause(scan_interval).await;
                if self.is_shutting_down() {
                    debug!("session sweeper exiting");
                    break;
                }
                sessions.sweep();
            }
        })
    }
}
