//! Error types for the task surface.

use uuid::Uuid;

/// Result type using TaskError.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors surfaced to workflow authors by the task surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TaskError {
    /// The task input map was malformed.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// A server API call failed.
    #[error("api request failed during '{operation}': {details}")]
    Api {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A bounded wait ran out of time.
    #[error("timeout waiting for {instance_id} after {elapsed_ms} ms")]
    Timeout {
        /// The process that did not finish in time.
        instance_id: Uuid,
        /// How long the caller waited.
        elapsed_ms: u128,
    },

    /// One or more awaited processes finished in a failed state.
    #[error("{0}")]
    ChildFailures(String),

    /// A process expected to be terminal is still running.
    #[error("process '{instance_id}' not finished")]
    NotFinished {
        /// The still-running process.
        instance_id: Uuid,
    },
}

impl TaskError {
    /// Whether a retry with a fixed delay may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Api { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_api_errors_are_retryable() {
        assert!(
            TaskError::Api {
                operation: "entry".into(),
                details: "connection reset".into()
            }
            .is_retryable()
        );
        assert!(!TaskError::InvalidParams("bad".into()).is_retryable());
        assert!(
            !TaskError::NotFinished {
                instance_id: Uuid::new_v4()
            }
            .is_retryable()
        );
    }
}
