//! Replay Engine Tests
//!
//! Drive `OrchestrationExecutor` directly with hand-built history: no worker,
//! no transport, no tokio runtime.

mod helpers;

mod cancellation;
mod event_dispatch;
mod lifecycle;
mod nondeterminism;
mod retry;
