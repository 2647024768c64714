/// Transport error with retry classification.
///
/// Backends return this to tell the worker whether an operation is worth
/// retrying. The dispatch loops back off and retry retryable errors; permanent
/// errors abandon the work item.
///
/// ```rust
/// use durabletask_worker::transport::TransportError;
///
/// let busy = TransportError::retryable("complete_orchestration", "backend is busy");
/// assert!(busy.is_retryable());
///
/// let stale = TransportError::permanent("complete_activity", "unknown completion token");
/// assert!(!stale.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Operation that failed (e.g. "fetch_orchestration_work_item")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    /// Transient failure: connection loss, timeouts, a busy backend.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that will not go away on retry: stale tokens, malformed or
    /// out-of-order chunks, unknown instances.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for TransportError {}
