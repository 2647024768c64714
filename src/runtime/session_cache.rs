//! Extended sessions: keep live executors between work items.
//!
//! A cached executor already holds the orchestrator's suspended state and
//! the number of history events it has applied. When the next work item for
//! the same execution arrives, only the unseen suffix of history is applied
//! instead of replaying from the start.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::limits::DEFAULT_SESSION_CACHE_CAPACITY;
use super::replay_engine::OrchestrationExecutor;

#[derive(Debug, Clone)]
pub struct ExtendedSessionOptions {
    /// Entries unused for this long are evicted by the sweeper.
    pub idle_timeout: Duration,
    /// How often the sweeper runs.
    pub scan_interval: Duration,
    pub max_cached_sessions: usize,
}

impl Default for ExtendedSessionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            scan_interval: Duration::from_secs(5),
            max_cached_sessions: DEFAULT_SESSION_CACHE_CAPACITY,
        }
    }
}

struct CachedSession {
    executor: OrchestrationExecutor,
    last_used: Instant,
}

pub struct SessionCache {
    options: ExtendedSessionOptions,
    entries: Mutex<HashMap<String, CachedSession>>,
}

impl SessionCache {
    pub fn new(options: ExtendedSessionOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &ExtendedSessionOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedSession>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the cached executor for `instance_id` if it can continue this history.
    ///
    /// The entry is removed either way; a stale executor is dropped.
    pub fn take(&self, instance_id: &str, execution_id: &str, past_events_len: usize) -> Option<OrchestrationExecutor> {
        let cached = self.lock().remove(instance_id)?;
        let executor = cached.executor;
        if executor.is_complete() {
            debug!(instance_id, "dropping cached executor of a finished orchestration");
            return None;
        }
        if executor.execution_id() != execution_id {
            debug!(instance_id, "dropping cached executor of a previous execution");
            return None;
        }
        if executor.processed_events() > past_events_len {
            debug!(
                instance_id,
                processed = executor.processed_events(),
                history_len = past_events_len,
                "dropping cached executor ahead of history"
            );
            return None;
        }
        Some(executor)
    }

    /// Cache an executor after a turn. Finished executors are not kept.
    pub fn put(&self, executor: OrchestrationExecutor) {
        if executor.is_complete() || self.options.max_cached_sessions == 0 {
            return;
        }
        let mut entries = self.lock();
        if entries.len() >= self.options.max_cached_sessions && !entries.contains_key(executor.instance_id()) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                debug!(instance_id = %oldest, "evicting least recently used session");
                entries.remove(&oldest);
            }
        }
        entries.insert(
            executor.instance_id().to_string(),
            CachedSession {
                executor,
                last_used: Instant::now(),
            },
        );
    }

    pub fn remove(&self, instance_id: &str) -> bool {
        self.lock().remove(instance_id).is_some()
    }

    /// Evict entries idle longer than the configured timeout. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let idle_timeout = self.options.idle_timeout;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, s| s.last_used.elapsed() < idle_timeout);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "swept idle sessions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
