use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide error type for search, indexing and recommendation operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecallError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Document not found: {id}")]
    NotFound { id: String },

    #[error("{operation} failed ({context}): {message}")]
    Upstream {
        operation: String,
        context: String,
        message: String,
    },

    #[error("Unsupported {what}")]
    Unsupported { what: String },

    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    #[error("{operation} exceeded its deadline ({timeout_ms}ms)")]
    DeadlineExceeded { operation: String, timeout_ms: u64 },
}

/// Coarse classification of a [`RecallError`], for callers mapping errors to
/// transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Upstream,
    Unsupported,
    Cancelled,
}

impl RecallError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RecallError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        RecallError::NotFound { id: id.into() }
    }

    pub fn upstream(
        operation: impl Into<String>,
        context: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        RecallError::Upstream {
            operation: operation.into(),
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        RecallError::Unsupported { what: what.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RecallError::Validation { .. } => ErrorKind::Validation,
            RecallError::NotFound { .. } => ErrorKind::NotFound,
            RecallError::Upstream { .. } => ErrorKind::Upstream,
            RecallError::Unsupported { .. } => ErrorKind::Unsupported,
            RecallError::Cancelled { .. } | RecallError::DeadlineExceeded { .. } => {
                ErrorKind::Cancelled
            }
        }
    }

    /// Validation and not-found errors are the caller's to fix; everything
    /// else originates below the core.
    pub fn is_caller_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::NotFound)
    }

    /// Create a user-friendly error message for display by the calling layer
    pub fn user_message(&self) -> String {
        match self {
            RecallError::Validation { field, reason } => {
                format!("The request field '{}' is invalid: {}.", field, reason)
            }
            RecallError::NotFound { id } => {
                format!("No document with id '{}' exists in the archive.", id)
            }
            RecallError::Upstream { operation, .. } => {
                format!("A backing service failed during '{}'. Please try again later.", operation)
            }
            RecallError::Unsupported { what } => {
                format!("'{}' is not supported.", what)
            }
            RecallError::Cancelled { operation } => {
                format!("The '{}' request was cancelled before it completed.", operation)
            }
            RecallError::DeadlineExceeded { operation, timeout_ms } => {
                format!("The '{}' request did not complete within {}ms.", operation, timeout_ms)
            }
        }
    }
}

/// Result type alias for retrieval operations
pub type RecallResult<T> = Result<T, RecallError>;

impl From<RecallError> for String {
    fn from(error: RecallError) -> Self {
        error.user_message()
    }
}
