//! Retry policies and the retry loop wrapped around activity and
//! sub-orchestration calls.
//!
//! Backoff delays are durable timers, so an instance can be unloaded between
//! attempts and resumed on another worker without losing its place. Every
//! decision is recomputed from history on replay.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::cancellation::CancellationToken;
use crate::context::OrchestrationContext;
use crate::error::TaskError;
use crate::failure::FailureDetails;
use crate::futures::DurableFuture;

/// Predicate deciding whether a particular failure is worth retrying.
pub type FailurePredicate = Arc<dyn Fn(&FailureDetails) -> bool + Send + Sync>;

/// Asynchronous retry decision. Returning `true` schedules another attempt immediately;
/// the handler can await a durable timer through the context to delay it.
pub type AsyncRetryHandler = Arc<dyn Fn(RetryContext) -> BoxFuture<'static, bool> + Send + Sync>;

/// Declarative retry policy with exponential backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub first_retry_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_retry_interval: Duration,
    /// Budget measured from the first attempt; `None` means unbounded.
    pub retry_timeout: Option<Duration>,
    pub handle: Option<FailurePredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_retry_interval", &self.first_retry_interval)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("max_retry_interval", &self.max_retry_interval)
            .field("retry_timeout", &self.retry_timeout)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_retry_interval: Duration::from_secs(1),
            backoff_coefficient: 1.0,
            max_retry_interval: Duration::from_secs(3600),
            retry_timeout: None,
            handle: None,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` below 1 is treated as a single attempt.
    pub fn new(max_attempts: u32, first_retry_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_retry_interval,
            ..Self::default()
        }
    }

    /// Coefficients below 1.0, or not finite, fall back to 1.0 (constant backoff).
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = if coefficient.is_finite() && coefficient >= 1.0 {
            coefficient
        } else {
            1.0
        };
        self
    }

    pub fn with_max_retry_interval(mut self, max: Duration) -> Self {
        self.max_retry_interval = max;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    /// Only retry failures for which `predicate` returns true.
    pub fn with_handle(mut self, predicate: impl Fn(&FailureDetails) -> bool + Send + Sync + 'static) -> Self {
        self.handle = Some(Arc::new(predicate));
        self
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.powi(exponent);
        let secs = self.first_retry_interval.as_secs_f64() * factor;
        let max = self.max_retry_interval.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_retry_interval;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_retry_interval)
    }

    /// Decide whether to retry after `attempt` failed. Returns the backoff delay when
    /// another attempt should be scheduled.
    pub fn next_retry_delay(
        &self,
        attempt: u32,
        failure: &FailureDetails,
        first_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        if is_terminal(failure) || attempt >= self.max_attempts.max(1) {
            return None;
        }
        if let Some(handle) = &self.handle {
            if !handle(failure) {
                return None;
            }
        }
        if let Some(timeout) = self.retry_timeout {
            let deadline = chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|t| first_attempt_at.checked_add_signed(t))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now >= deadline {
                return None;
            }
        }
        Some(self.delay_for_attempt(attempt))
    }
}

/// Snapshot handed to a retry handler. Built fresh for every decision.
#[derive(Clone, Debug)]
pub struct RetryContext {
    pub orchestration_context: OrchestrationContext,
    pub last_attempt_number: u32,
    pub last_failure: FailureDetails,
    pub total_retry_time: Duration,
    /// Cancellation state captured when the decision was requested.
    pub is_cancellation_requested: bool,
    pub cancellation_token: CancellationToken,
}

#[derive(Clone)]
pub enum TaskRetryOptions {
    Policy(RetryPolicy),
    Handler(AsyncRetryHandler),
}

impl TaskRetryOptions {
    pub fn from_policy(policy: RetryPolicy) -> Self {
        TaskRetryOptions::Policy(policy)
    }

    /// Synchronous decision function.
    pub fn from_handler(handler: impl Fn(&RetryContext) -> bool + Send + Sync + 'static) -> Self {
        let handler = Arc::new(handler);
        TaskRetryOptions::Handler(Arc::new(move |rc: RetryContext| -> BoxFuture<'static, bool> {
            let decision = handler(&rc);
            Box::pin(async move { decision })
        }))
    }

    pub fn from_async_handler<F, Fut>(handler: F) -> Self
    where
        F: Fn(RetryContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        TaskRetryOptions::Handler(Arc::new(move |rc| -> BoxFuture<'static, bool> { Box::pin(handler(rc)) }))
    }
}

impl fmt::Debug for TaskRetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRetryOptions::Policy(p) => f.debug_tuple("Policy").field(p).finish(),
            TaskRetryOptions::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Options for an activity call.
#[derive(Clone, Debug, Default)]
pub struct TaskOptions {
    pub retry: Option<TaskRetryOptions>,
    pub cancellation: CancellationToken,
}

impl TaskOptions {
    pub fn with_retry(policy: RetryPolicy) -> Self {
        Self {
            retry: Some(TaskRetryOptions::Policy(policy)),
            ..Self::default()
        }
    }

    pub fn with_retry_handler(handler: impl Fn(&RetryContext) -> bool + Send + Sync + 'static) -> Self {
        Self {
            retry: Some(TaskRetryOptions::from_handler(handler)),
            ..Self::default()
        }
    }

    pub fn with_retry_options(mut self, retry: TaskRetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Options for a sub-orchestration call.
#[derive(Clone, Debug, Default)]
pub struct SubOrchestrationOptions {
    pub task: TaskOptions,
    /// Fixed child instance id. Generated deterministically per attempt when absent.
    pub instance_id: Option<String>,
    pub version: Option<String>,
}

impl SubOrchestrationOptions {
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_task_options(mut self, task: TaskOptions) -> Self {
        self.task = task;
        self
    }
}

impl From<TaskOptions> for SubOrchestrationOptions {
    fn from(task: TaskOptions) -> Self {
        Self {
            task,
            ..Self::default()
        }
    }
}

/// Failures that never reach a retry decision. `TaskNotFound` is matched by
/// error type so that failures recorded without the flag are still terminal.
fn is_terminal(failure: &FailureDetails) -> bool {
    failure.is_task_not_found() || failure.is_non_retriable()
}

/// Run `attempt` until it succeeds or the retry options give up.
///
/// Each call to `attempt` schedules a fresh task and therefore consumes a new
/// sequence id. Cancellation and non-retriable failures end the loop at once.
pub(crate) async fn run_with_retry<F>(
    ctx: OrchestrationContext,
    name: String,
    options: TaskOptions,
    mut attempt: F,
) -> Result<String, TaskError>
where
    F: FnMut(&CancellationToken) -> DurableFuture + Send,
{
    let TaskOptions { retry, cancellation } = options;
    let Some(retry) = retry else {
        return attempt(&cancellation).await;
    };

    let first_attempt_at = ctx.current_utc_datetime();
    let mut attempt_number: u32 = 1;
    loop {
        let failed = match attempt(&cancellation).await {
            Ok(result) => return Ok(result),
            Err(TaskError::Failed(failed)) => failed,
            Err(cancelled) => return Err(cancelled),
        };

        if is_terminal(&failed.failure) {
            crate::durable_debug!(ctx, task = %name, error_type = %failed.failure.error_type, "non-retriable failure");
            return Err(TaskError::Failed(failed));
        }

        let now = ctx.current_utc_datetime();
        let delay = match &retry {
            TaskRetryOptions::Policy(policy) => {
                match policy.next_retry_delay(attempt_number, &failed.failure, first_attempt_at, now) {
                    Some(delay) => delay,
                    None => {
                        crate::durable_info!(ctx, task = %name, attempts = attempt_number, "retries exhausted");
                        return Err(TaskError::Failed(failed));
                    }
                }
            }
            TaskRetryOptions::Handler(handler) => {
                let retry_context = RetryContext {
                    orchestration_context: ctx.clone(),
                    last_attempt_number: attempt_number,
                    last_failure: failed.failure.clone(),
                    total_retry_time: (now - first_attempt_at).to_std().unwrap_or_default(),
                    is_cancellation_requested: cancellation.is_cancellation_requested(),
                    cancellation_token: cancellation.clone(),
                };
                if !handler(retry_context).await {
                    crate::durable_info!(ctx, task = %name, attempts = attempt_number, "retry handler declined");
                    return Err(TaskError::Failed(failed));
                }
                Duration::ZERO
            }
        };

        crate::durable_info!(
            ctx,
            task = %name,
            attempt = attempt_number,
            delay_ms = delay.as_millis() as u64,
            error = %failed.failure,
            "retrying after failure"
        );
        if !delay.is_zero() {
            ctx.create_timer_with_cancellation(delay, &cancellation).await?;
        }
        attempt_number += 1;
    }
}
