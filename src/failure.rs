//! Structured, serializable failure chains.
//!
//! A [`FailureDetails`] mirrors an error and its `source()` chain as an immutable,
//! boundedly-deep tree. It is what crosses the wire between the worker and the
//! backend and what orchestrator code inspects when a task fails.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use crate::error::TaskError;
use crate::runtime::limits::MAX_FAILURE_DEPTH;

/// Error type recorded when an activity or orchestrator name is not registered.
pub const TASK_NOT_FOUND: &str = "TaskNotFound";
/// Error type recorded when replay diverges from history.
pub const NON_DETERMINISM: &str = "NonDeterminismError";
/// Error type recorded when a completion action exceeds the chunk budget.
pub const PAYLOAD_TOO_LARGE: &str = "PayloadTooLarge";
/// Error type recorded when user code panics.
pub const PANICKED: &str = "OrchestratorPanicked";
/// Error type recorded when an activity panics.
pub const ACTIVITY_PANICKED: &str = "ActivityPanicked";
/// Error type used when a [`TaskError::Failed`] is propagated out of an orchestrator.
pub const TASK_FAILED: &str = "TaskFailed";
/// Error type used when a [`TaskError::Cancelled`] is propagated out of an orchestrator.
pub const TASK_CANCELLED: &str = "TaskCancelled";

const DEFAULT_ERROR_TYPE: &str = "Error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    pub inner_failure: Option<Box<FailureDetails>>,
    /// Set for failures that must never reach a retry decision.
    #[serde(default)]
    pub is_non_retriable: bool,
}

/// Hook that enriches failure details for specific error types.
///
/// Implementations typically downcast the error and copy domain fields into the
/// properties map, e.g. an HTTP status code.
pub trait FailurePropertiesProvider: Send + Sync {
    fn properties(&self, error: &(dyn StdError + 'static)) -> Option<BTreeMap<String, serde_json::Value>>;

    /// Override the recorded error type name.
    fn error_type(&self, _error: &(dyn StdError + 'static)) -> Option<String> {
        None
    }
}

/// An error with an explicit type name, for user code that wants a stable
/// `error_type` in its failure details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationError {
    pub error_type: String,
    pub message: String,
}

impl ApplicationError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl StdError for ApplicationError {}

impl FailureDetails {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
            properties: BTreeMap::new(),
            inner_failure: None,
            is_non_retriable: false,
        }
    }

    pub fn task_not_found(kind: &str, name: &str) -> Self {
        Self {
            is_non_retriable: true,
            ..Self::new(TASK_NOT_FOUND, format!("No {kind} task named '{name}' was found."))
        }
    }

    pub fn non_determinism(message: impl Into<String>) -> Self {
        Self {
            is_non_retriable: true,
            ..Self::new(NON_DETERMINISM, message)
        }
    }

    pub fn with_inner(mut self, inner: FailureDetails) -> Self {
        self.inner_failure = Some(Box::new(inner));
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn is_task_not_found(&self) -> bool {
        self.error_type == TASK_NOT_FOUND
    }

    pub fn is_non_retriable(&self) -> bool {
        self.is_non_retriable
    }

    /// True when this failure or any inner failure has the given error type.
    pub fn is_caused_by(&self, error_type: &str) -> bool {
        self.chain().any(|f| f.error_type == error_type)
    }

    /// Iterate from this failure down to the innermost cause.
    pub fn chain(&self) -> impl Iterator<Item = &FailureDetails> {
        std::iter::successors(Some(self), |f| f.inner_failure.as_deref())
    }

    pub fn innermost(&self) -> &FailureDetails {
        self.chain().last().unwrap_or(self)
    }

    pub fn depth(&self) -> usize {
        self.chain().count()
    }

    /// Build a failure chain from an error and its causes.
    ///
    /// A [`TaskError`] anywhere in the chain contributes its own recorded failure as the
    /// inner failure, so a task failure re-thrown by an orchestrator keeps the full cause
    /// chain of the activity that produced it.
    pub fn from_error(error: &anyhow::Error, provider: Option<&dyn FailurePropertiesProvider>) -> Self {
        let levels: Vec<&(dyn StdError + 'static)> = error.chain().take(MAX_FAILURE_DEPTH).collect();

        let mut inner: Option<FailureDetails> = None;
        for (depth, level) in levels.iter().enumerate().rev() {
            let mut details = Self::from_level(*level, provider);
            if let Some(TaskError::Failed(failed)) = level.downcast_ref::<TaskError>() {
                // Everything below a task failure is already captured by its recorded failure.
                let remaining = MAX_FAILURE_DEPTH.saturating_sub(depth + 1);
                if remaining > 0 {
                    let mut nested = failed.failure.clone();
                    truncate_depth(&mut nested, remaining);
                    details.inner_failure = Some(Box::new(nested));
                }
            } else if let Some(prev) = inner.take() {
                details.inner_failure = Some(Box::new(prev));
            }
            inner = Some(details);
        }

        let mut root = inner.unwrap_or_else(|| Self::new(DEFAULT_ERROR_TYPE, error.to_string()));
        if let std::backtrace::BacktraceStatus::Captured = error.backtrace().status() {
            root.stack_trace = Some(error.backtrace().to_string());
        }
        root
    }

    fn from_level(level: &(dyn StdError + 'static), provider: Option<&dyn FailurePropertiesProvider>) -> Self {
        let error_type = provider
            .and_then(|p| p.error_type(level))
            .or_else(|| builtin_error_type(level))
            .unwrap_or_else(|| DEFAULT_ERROR_TYPE.to_string());

        let message = match level.downcast_ref::<ApplicationError>() {
            Some(app) => app.message.clone(),
            None => level.to_string(),
        };

        let mut details = Self::new(error_type, message);
        if let Some(props) = provider.and_then(|p| p.properties(level)) {
            details.properties = props;
        }
        details
    }
}

fn builtin_error_type(level: &(dyn StdError + 'static)) -> Option<String> {
    if let Some(app) = level.downcast_ref::<ApplicationError>() {
        return Some(app.error_type.clone());
    }
    match level.downcast_ref::<TaskError>() {
        Some(TaskError::Failed(_)) => Some(TASK_FAILED.to_string()),
        Some(TaskError::Cancelled { .. }) => Some(TASK_CANCELLED.to_string()),
        None => None,
    }
}

fn truncate_depth(details: &mut FailureDetails, max_depth: usize) {
    if max_depth <= 1 {
        details.inner_failure = None;
        return;
    }
    if let Some(inner) = details.inner_failure.as_mut() {
        truncate_depth(inner, max_depth - 1);
    }
}

impl fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}
