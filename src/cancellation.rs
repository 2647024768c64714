//! Orchestration-local, deterministic cancellation.
//!
//! Tokens live inside one orchestration context. They trigger either when
//! orchestrator code calls [`CancellationSource::cancel`] or when the durable
//! timer behind [`OrchestrationContext::cancel_after`] fires, never on a real-time
//! clock, so the same history always cancels at the same point.

use std::fmt;

use crate::OrchestrationContext;

/// Read side of a cancellation signal.
///
/// The default token is never cancelled.
#[derive(Clone, Default)]
pub struct CancellationToken {
    handle: Option<TokenHandle>,
}

#[derive(Clone)]
struct TokenHandle {
    ctx: OrchestrationContext,
    id: usize,
}

impl CancellationToken {
    /// A token that can never be cancelled.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        match &self.handle {
            Some(h) => h.ctx.lock().is_token_cancelled(h.id),
            None => false,
        }
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.handle.is_some()
    }

    /// Slot id of this token when it belongs to `ctx`.
    ///
    /// Tokens from another orchestration are treated as never-cancelling.
    pub(crate) fn slot_for(&self, ctx: &OrchestrationContext) -> Option<usize> {
        let handle = self.handle.as_ref()?;
        if handle.ctx.same_instance(ctx) {
            Some(handle.id)
        } else {
            tracing::warn!(
                target: "durabletask_worker::cancellation",
                "cancellation token used outside the orchestration that created it; ignoring"
            );
            None
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handle {
            Some(h) => f.debug_struct("CancellationToken").field("id", &h.id).finish(),
            None => f.write_str("CancellationToken(none)"),
        }
    }
}

/// Write side of a cancellation signal.
#[derive(Clone)]
pub struct CancellationSource {
    ctx: OrchestrationContext,
    id: usize,
}

impl CancellationSource {
    pub(crate) fn new(ctx: OrchestrationContext, id: usize) -> Self {
        Self { ctx, id }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            handle: Some(TokenHandle {
                ctx: self.ctx.clone(),
                id: self.id,
            }),
        }
    }

    /// Trigger the signal. Every pending task observing it resolves with
    /// [`crate::TaskError::Cancelled`] on its next poll. Idempotent.
    pub fn cancel(&self) {
        self.ctx.lock().cancel_token(self.id);
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.ctx.lock().is_token_cancelled(self.id)
    }
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource").field("id", &self.id).finish()
    }
}
