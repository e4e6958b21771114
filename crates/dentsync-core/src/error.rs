//! Sync error handling
//!
//! Remote failures carry an [`ErrorCode`] which classifies them as transient
//! (retry), permanent (drop and roll back) or conflict (resolve). Every code
//! maps to a human-readable message for the UI.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{EntityType, MutationAction};
use crate::storage::StorageError;

/// How a failure should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network-level problem; retry later
    Transient,
    /// Semantic rejection; never retry
    Permanent,
    /// Remote state diverged from the assumed base
    Conflict,
}

/// Error codes reported by the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    ResourceExhausted,
    Internal,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Unauthenticated,
    Aborted,
    FailedPrecondition,
    Unknown,
}

impl ErrorCode {
    /// Classify the code
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::Unavailable
            | ErrorCode::DeadlineExceeded
            | ErrorCode::Cancelled
            | ErrorCode::ResourceExhausted
            | ErrorCode::Internal => ErrorKind::Transient,
            ErrorCode::Aborted | ErrorCode::FailedPrecondition => ErrorKind::Conflict,
            ErrorCode::InvalidArgument
            | ErrorCode::PermissionDenied
            | ErrorCode::NotFound
            | ErrorCode::AlreadyExists
            | ErrorCode::Unauthenticated
            | ErrorCode::Unknown => ErrorKind::Permanent,
        }
    }

    /// Wire spelling of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::DeadlineExceeded => "deadline-exceeded",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::ResourceExhausted => "resource-exhausted",
            ErrorCode::Internal => "internal",
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::NotFound => "not-found",
            ErrorCode::AlreadyExists => "already-exists",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Aborted => "aborted",
            ErrorCode::FailedPrecondition => "failed-precondition",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Parse a wire code; unrecognized codes map to `Unknown`
    pub fn from_code(code: &str) -> Self {
        match code {
            "unavailable" => ErrorCode::Unavailable,
            "deadline-exceeded" => ErrorCode::DeadlineExceeded,
            "cancelled" => ErrorCode::Cancelled,
            "resource-exhausted" => ErrorCode::ResourceExhausted,
            "internal" => ErrorCode::Internal,
            "invalid-argument" => ErrorCode::InvalidArgument,
            "permission-denied" => ErrorCode::PermissionDenied,
            "not-found" => ErrorCode::NotFound,
            "already-exists" => ErrorCode::AlreadyExists,
            "unauthenticated" => ErrorCode::Unauthenticated,
            "aborted" => ErrorCode::Aborted,
            "failed-precondition" => ErrorCode::FailedPrecondition,
            _ => ErrorCode::Unknown,
        }
    }

    /// Human-readable message shown to users
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "Permission denied. Please contact support.",
            ErrorCode::Unavailable => "Service temporarily unavailable. Please try again later.",
            ErrorCode::DeadlineExceeded => "The request timed out. It will be retried.",
            ErrorCode::NotFound => "The record no longer exists.",
            ErrorCode::AlreadyExists => "This record already exists.",
            ErrorCode::InvalidArgument => "Some fields are invalid. Please check your input.",
            ErrorCode::Unauthenticated => "Your session has expired. Please sign in again.",
            ErrorCode::Aborted | ErrorCode::FailedPrecondition => {
                "This record was changed by someone else."
            }
            _ => "An error occurred. Please try again.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a [`RemoteChannel`](crate::remote::RemoteChannel)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a transient "unavailable" error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// A payload rejected before it reached the queue
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty
    #[error("{entity} {action}: missing required field '{field}'")]
    MissingField {
        entity: EntityType,
        action: MutationAction,
        field: &'static str,
    },

    /// A field has the wrong JSON type or an unsupported value
    #[error("{entity}: field '{field}' must be {expected}")]
    InvalidField {
        entity: EntityType,
        field: String,
        expected: &'static str,
    },

    /// An update carried nothing besides the id
    #[error("{entity} update: no fields to change")]
    EmptyUpdate { entity: EntityType },
}

/// Errors returned by the sync core's public operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// Payload failed schema validation
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Remote store rejected an operation
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local persistence failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Operation requires a signed-in user
    #[error("No user is signed in")]
    NotSignedIn,

    /// The orchestrator has been stopped
    #[error("Sync orchestrator is stopped")]
    Stopped,
}

impl SyncError {
    /// Error code surfaced to the UI
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Validation(_) => ErrorCode::InvalidArgument,
            SyncError::Remote(e) => e.code,
            SyncError::NotSignedIn => ErrorCode::Unauthenticated,
            SyncError::Storage(_) | SyncError::Stopped => ErrorCode::Unknown,
        }
    }

    /// Human-readable message for the UI
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Validation(e) => e.to_string(),
            other => other.code().user_message().to_string(),
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        for code in [
            ErrorCode::Unavailable,
            ErrorCode::DeadlineExceeded,
            ErrorCode::Cancelled,
            ErrorCode::ResourceExhausted,
            ErrorCode::Internal,
        ] {
            assert_eq!(code.kind(), ErrorKind::Transient, "{code}");
        }
    }

    #[test]
    fn test_permanent_classification() {
        for code in [
            ErrorCode::PermissionDenied,
            ErrorCode::NotFound,
            ErrorCode::InvalidArgument,
            ErrorCode::AlreadyExists,
            ErrorCode::Unauthenticated,
            ErrorCode::Unknown,
        ] {
            assert_eq!(code.kind(), ErrorKind::Permanent, "{code}");
        }
        assert_eq!(ErrorCode::Aborted.kind(), ErrorKind::Conflict);
        assert_eq!(ErrorCode::FailedPrecondition.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_code_parsing() {
        assert_eq!(
            ErrorCode::from_code("permission-denied"),
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            ErrorCode::from_code("deadline-exceeded"),
            ErrorCode::DeadlineExceeded
        );
        assert_eq!(ErrorCode::from_code("weird"), ErrorCode::Unknown);
        assert_eq!(ErrorCode::NotFound.to_string(), "not-found");
    }

    #[test]
    fn test_code_serde_uses_wire_spelling() {
        let json = serde_json::to_string(&ErrorCode::PermissionDenied).unwrap();
        assert_eq!(json, "\"permission-denied\"");
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            ErrorCode::PermissionDenied.user_message(),
            "Permission denied. Please contact support."
        );
        assert_eq!(
            ErrorCode::Internal.user_message(),
            "An error occurred. Please try again."
        );
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::new(ErrorCode::PermissionDenied, "rules rejected write");
        assert_eq!(err.to_string(), "permission-denied: rules rejected write");
        assert!(!err.is_transient());
        assert!(RemoteError::unavailable("offline").is_transient());
    }

    #[test]
    fn test_sync_error_codes() {
        let err = SyncError::from(ValidationError::EmptyUpdate {
            entity: EntityType::Appointment,
        });
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(err.user_message().contains("no fields to change"));
        assert_eq!(SyncError::NotSignedIn.code(), ErrorCode::Unauthenticated);
    }
}
