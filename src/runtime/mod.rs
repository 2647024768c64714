//! Worker host: handler traits, options and the dispatch loops that pull
//! work items from a [`WorkItemTransport`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::OrchestrationContext;
use crate::failure::FailurePropertiesProvider;
use crate::payloads::PayloadExternalizer;
use crate::transport::WorkItemTransport;

pub(crate) mod correlator;
mod dispatchers;
pub mod event_dispatcher;
pub mod limits;
pub mod observability;
pub mod registry;
pub mod replay_engine;
pub mod session_cache;

pub use observability::{LogFormat, MetricsSnapshot, ObservabilityConfig};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder, VersionPolicy,
};
pub use replay_engine::{OrchestrationExecutor, TurnResult};
pub use session_cache::{ExtendedSessionOptions, SessionCache};

use observability::WorkerMetrics;

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> anyhow::Result<String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> anyhow::Result<String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> anyhow::Result<String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> anyhow::Result<String> {
        (self.0)(ctx, input).await
    }
}

/// Identity of the activity invocation being executed.
///
/// Activities are not replayed, so unlike orchestrator code they may do I/O
/// and read the clock freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    task_id: u64,
    name: String,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, task_id: u64, name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_id,
            name: name.into(),
        }
    }

    /// Orchestration instance that scheduled this activity.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Sequence id of the scheduling call; stable across retries of the same attempt.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration options for the [`Worker`].
#[derive(Clone)]
pub struct WorkerOptions {
    pub max_concurrent_orchestrations: usize,
    pub max_concurrent_activities: usize,
    /// Sleep between fetches when the transport has no work.
    pub idle_poll_interval: Duration,
    /// Keep executors in memory between work items of the same instance.
    pub extended_sessions: Option<ExtendedSessionOptions>,
    /// Externalize payloads above a threshold through a payload store.
    pub large_payloads: Option<PayloadExternalizer>,
    /// Per-chunk budget for serialized completion actions.
    pub max_chunk_bytes: usize,
    pub failure_properties_provider: Option<Arc<dyn FailurePropertiesProvider>>,
    /// Logging to install on start. `None` leaves any existing subscriber alone.
    pub observability: Option<ObservabilityConfig>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_orchestrations: 10,
            max_concurrent_activities: 10,
            idle_poll_interval: Duration::from_millis(10),
            extended_sessions: None,
            large_payloads: None,
            max_chunk_bytes: limits::DEFAULT_MAX_CHUNK_BYTES,
            failure_properties_provider: None,
            observability: None,
        }
    }
}

impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("max_concurrent_orchestrations", &self.max_concurrent_orchestrations)
            .field("max_concurrent_activities", &self.max_concurrent_activities)
            .field("idle_poll_interval", &self.idle_poll_interval)
            .field("extended_sessions", &self.extended_sessions)
            .field("large_payloads", &self.large_payloads.is_some())
            .field("max_chunk_bytes", &self.max_chunk_bytes)
            .field("failure_properties_provider", &self.failure_properties_provider.is_some())
            .field("observability", &self.observability)
            .finish()
    }
}

/// State shared by the dispatch loops.
pub(crate) struct WorkerShared {
    transport: Arc<dyn WorkItemTransport>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    options: WorkerOptions,
    sessions: Option<SessionCache>,
    orchestration_slots: Arc<Semaphore>,
    activity_slots: Arc<Semaphore>,
    shutdown: AtomicBool,
    stopped: Notify,
    metrics: WorkerMetrics,
}

impl WorkerShared {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Sleep for `duration`, returning early when shutdown starts.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stopped.notified() => {}
        }
    }
}

/// Semaphore size for a concurrency limit: at least one, and never more than
/// a single `acquire_many` can take back during shutdown.
fn permits(limit: usize) -> u32 {
    u32::try_from(limit.clamp(1, Semaphore::MAX_PERMITS)).unwrap_or(u32::MAX)
}

/// Long-running host that executes orchestration and activity work items.
pub struct Worker {
    shared: Arc<WorkerShared>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Start the dispatch loops. Must be called from within a tokio runtime.
    pub async fn start(
        transport: Arc<dyn WorkItemTransport>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        options: WorkerOptions,
    ) -> Arc<Self> {
        if let Some(config) = &options.observability {
            if let Err(e) = observability::init_logging(config) {
                debug!(error = %e, "logging already initialized");
            }
        }

        let shared = Arc::new(WorkerShared {
            transport,
            activities,
            orchestrations,
            sessions: options.extended_sessions.clone().map(SessionCache::new),
            orchestration_slots: Arc::new(Semaphore::new(permits(options.max_concurrent_orchestrations) as usize)),
            activity_slots: Arc::new(Semaphore::new(permits(options.max_concurrent_activities) as usize)),
            shutdown: AtomicBool::new(false),
            stopped: Notify::new(),
            metrics: WorkerMetrics::new(options.observability.as_ref()),
            options,
        });

        let worker = Arc::new(Self {
            shared: Arc::clone(&shared),
            joins: Mutex::new(Vec::new()),
        });

        let mut joins = worker.joins.lock().await;
        joins.push(Arc::clone(&shared).start_orchestration_dispatcher());
        joins.push(Arc::clone(&shared).start_activity_dispatcher());
        if shared.sessions.is_some() {
            joins.push(Arc::clone(&shared).start_session_sweeper());
        }
        drop(joins);

        info!(
            max_concurrent_orchestrations = shared.options.max_concurrent_orchestrations,
            max_concurrent_activities = shared.options.max_concurrent_activities,
            extended_sessions = shared.sessions.is_some(),
            "worker started"
        );
        worker
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Number of executors currently held by the extended session cache.
    pub fn cached_sessions(&self) -> usize {
        self.shared.sessions.as_ref().map_or(0, SessionCache::len)
    }

    /// Stop fetching, wait up to `timeout` for in-flight work items, then abort what is left.
    pub async fn shutdown(self: Arc<Self>, timeout: Duration) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.shared.stopped.notify_waiters();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut joins = self.joins.lock().await;
        for join in joins.drain(..) {
            let abort = join.abort_handle();
            if tokio::time::timeout_at(deadline, join).await.is_err() {
                abort.abort();
            }
        }
        drop(joins);

        // In-flight work items hold permits until they finish.
        let drained = tokio::time::timeout_at(deadline, async {
            let orch = permits(self.shared.options.max_concurrent_orchestrations);
            let act = permits(self.shared.options.max_concurrent_activities);
            let _o = self.shared.orchestration_slots.acquire_many(orch).await;
            let _a = self.shared.activity_slots.acquire_many(act).await;
        })
        .await;
        if drained.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "shutdown timed out with work items in flight");
        }
        self.shared.orchestration_slots.close();
        self.shared.activity_slots.close();
        self.shared.metrics.shutdown();
        info!("worker stopped");
    }
}
