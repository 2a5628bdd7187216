// Copyright (C) 2026 Capstan Contributors
// SPDX-License-Identifier: Apache-2.0
//! Error types for the orchestration core.
//!
//! One unified error type flows through pipelines, the queue store and the
//! coordinators; `error_code()` gives the stable machine-readable code used
//! by callers to classify faults.

use std::fmt;

use uuid::Uuid;

/// Result type using OrchestratorError.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// A single failed child observed while resuming a waiting parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildFailure {
    /// The child instance id.
    pub instance_id: Uuid,
    /// The child's terminal status (FAILED, CANCELLED or TIMED_OUT).
    pub status: String,
    /// The child's recorded error, if any.
    pub error: Option<String>,
}

impl fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "child process {} {}", self.instance_id, self.status)?;
        if let Some(e) = &self.error {
            write!(f, " (error: {})", e)?;
        }
        Ok(())
    }
}

/// Errors produced by the orchestration core.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Malformed input; the process never reaches ENQUEUED.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// No queue entry exists for the given instance.
    ProcessNotFound {
        /// The instance id that was not found.
        instance_id: Uuid,
    },

    /// A queue entry already exists for the given instance.
    ///
    /// ProcessKey uniqueness is the basis for idempotent recovery, so a
    /// duplicate initial insert is a programming error and fails loudly.
    AlreadyExists {
        /// The instance id that already exists.
        instance_id: Uuid,
    },

    /// The process is in the wrong state for the requested operation.
    InvalidProcessState {
        /// The instance id.
        instance_id: Uuid,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// A configured policy rule denied the operation.
    PolicyViolation {
        /// The rule's formatted message.
        message: String,
    },

    /// Queue admission control rejected the submission.
    ///
    /// The HTTP-equivalent of "too many requests": the process is never
    /// written past NEW.
    TooManyRequests {
        /// The exceeded rule's formatted message.
        message: String,
    },

    /// One or more awaited children finished in a failed state.
    ChildFailures {
        /// Every failed child and its recorded error.
        failures: Vec<ChildFailure>,
    },

    /// One or more fork submissions failed.
    ForkFailed {
        /// Human-readable description of each failed submission.
        errors: Vec<String>,
    },

    /// Repository resolution failed.
    RepositoryError {
        /// Error details.
        details: String,
    },

    /// A store operation failed (possibly transient).
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl OrchestratorError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::ProcessNotFound { .. } => "PROCESS_NOT_FOUND",
            Self::AlreadyExists { .. } => "PROCESS_ALREADY_EXISTS",
            Self::InvalidProcessState { .. } => "INVALID_PROCESS_STATE",
            Self::PolicyViolation { .. } => "POLICY_VIOLATION",
            Self::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            Self::ChildFailures { .. } => "CHILD_FAILURES",
            Self::ForkFailed { .. } => "FORK_FAILED",
            Self::RepositoryError { .. } => "REPOSITORY_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::ProcessNotFound { instance_id } => {
                write!(f, "Process '{}' not found", instance_id)
            }
            Self::AlreadyExists { instance_id } => {
                write!(f, "Process '{}' already exists", instance_id)
            }
            Self::InvalidProcessState {
                instance_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Process '{}' is in invalid state: expected '{}', got '{}'",
                    instance_id, expected, actual
                )
            }
            Self::PolicyViolation { message } => {
                write!(f, "Policy violation: {}", message)
            }
            Self::TooManyRequests { message } => {
                write!(f, "Too many requests: {}", message)
            }
            Self::ChildFailures { failures } => {
                write!(f, "Child process failure(s): ")?;
                for (i, c) in failures.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", c)?;
                }
                Ok(())
            }
            Self::ForkFailed { errors } => {
                write!(f, "Fork submission failure(s): {}", errors.join("; "))
            }
            Self::RepositoryError { details } => {
                write!(f, "Repository error: {}", details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
