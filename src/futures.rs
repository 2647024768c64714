//! Futures returned by the orchestration context.
//!
//! They implement `std::future::Future` directly, so standard combinators
//! (`futures::join!`, `join_all`, `select`, `FuturesUnordered`) work inside
//! orchestrator code. Each future is bound to one sequence id and reads its
//! result from the context's pending-task table.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FusedFuture};

use crate::OrchestrationContext;
use crate::error::TaskError;

/// Boxed future returned by calls that carry options (retry, cancellation, timeouts).
pub type TaskFuture = BoxFuture<'static, Result<String, TaskError>>;

enum State {
    /// Resolved at creation, e.g. scheduled with an already-cancelled token.
    Ready(Result<String, TaskError>),
    Waiting { ctx: OrchestrationContext, id: u64 },
    Done,
}

/// Future for an activity, sub-orchestration or external event.
///
/// Resolves to the raw string result, or a [`TaskError`] on failure or cancellation.
#[must_use = "futures do nothing unless awaited"]
pub struct DurableFuture {
    state: State,
}

impl DurableFuture {
    pub(crate) fn ready(result: Result<String, TaskError>) -> Self {
        Self {
            state: State::Ready(result),
        }
    }

    pub(crate) fn pending(ctx: OrchestrationContext, id: u64) -> Self {
        Self {
            state: State::Waiting { ctx, id },
        }
    }

    /// Sequence id allocated for this task, if one was allocated.
    pub fn task_id(&self) -> Option<u64> {
        match &self.state {
            State::Waiting { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl Future for DurableFuture {
    type Output = Result<String, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.state {
            // FusedFuture behavior: already completed
            State::Done => Poll::Pending,
            State::Ready(_) => match std::mem::replace(&mut this.state, State::Done) {
                State::Ready(result) => Poll::Ready(result),
                _ => Poll::Pending,
            },
            State::Waiting { ctx, id } => {
                let polled = ctx.lock().poll_task(*id, cx.waker());
                if polled.is_ready() {
                    this.state = State::Done;
                }
                polled
            }
        }
    }
}

impl FusedFuture for DurableFuture {
    fn is_terminated(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

impl Drop for DurableFuture {
    fn drop(&mut self) {
        let State::Waiting { ctx, id } = &self.state else {
            return;
        };
        // try_lock: the context may already be locked on this thread during teardown
        if let Some(mut inner) = ctx.try_lock() {
            inner.abandon_wait(*id);
        }
    }
}

/// Future for a durable timer. Resolves to `Ok(())` when the timer fires.
#[must_use = "futures do nothing unless awaited"]
pub struct TimerFuture {
    inner: DurableFuture,
}

impl TimerFuture {
    pub(crate) fn new(inner: DurableFuture) -> Self {
        Self { inner }
    }

    pub fn task_id(&self) -> Option<u64> {
        self.inner.task_id()
    }
}

impl Future for TimerFuture {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().inner).poll(cx).map(|r| r.map(|_| ()))
    }
}

impl FusedFuture for TimerFuture {
    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}
