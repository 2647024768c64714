//! Runtime limits and constants.
//!
//! Collect all hard limits in one place so they're easy to find, document,
//! and reference from both the engine and the worker host.

/// Maximum depth of a [`crate::FailureDetails`] chain built from an error.
///
/// Deeper `source()` chains are truncated; the innermost levels are dropped.
pub const MAX_FAILURE_DEPTH: usize = 10;

/// Maximum size in bytes for the custom status string set via
/// `ctx.set_custom_status()`.
///
/// Larger values are rejected at the call site and the previous status is kept.
pub const MAX_CUSTOM_STATUS_BYTES: usize = 256 * 1024;

/// Default byte budget for one chunk of an orchestrator completion.
///
/// A single action whose serialized form exceeds this budget fails the
/// orchestration instead of being split.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Default size above which payloads are moved to the payload store when
/// large-payload externalization is enabled.
pub const DEFAULT_EXTERNALIZE_THRESHOLD_BYTES: usize = 900 * 1024;

/// Upper bound on consecutive re-polls of an orchestrator without new history.
///
/// Guards against user futures that wake themselves forever.
pub const MAX_POLLS_PER_EVENT: usize = 10_000;

/// Maximum number of cached executors when extended sessions are enabled
/// and no explicit capacity is configured.
pub const DEFAULT_SESSION_CACHE_CAPACITY: usize = 1_000;
