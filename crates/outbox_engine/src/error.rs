//! Error types for the sync engine.

use outbox_protocol::{ExecuteResponse, OperationId, ProtocolError};
use outbox_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the manager treats a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed operation. Dropped, never retried.
    Validation,
    /// Version mismatch, routed through the conflict resolver.
    Conflict,
    /// Worth retrying after a backoff.
    Transient,
    /// Surfaced to the user and moved to the dead-letter view.
    Permanent,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The operation is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The server holds a different version of the entity.
    #[error("conflict: server is at version {server_version}")]
    Conflict {
        /// Server's current version.
        server_version: u64,
    },

    /// Network failure, 5xx, 408 or 429.
    #[error("transient error: {0}")]
    Transient(String),

    /// Failure that retrying will not fix.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The queue cannot accept more operations.
    #[error("queue capacity exceeded: {pending} pending, limit {limit}")]
    CapacityExceeded {
        /// Operations currently queued.
        pending: usize,
        /// Configured limit.
        limit: usize,
    },

    /// No operation with this id.
    #[error("operation {0} not found")]
    NotFound(OperationId),

    /// The operation is being executed and cannot be changed.
    #[error("operation {0} is in flight")]
    InFlight(OperationId),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The executor did not answer in time.
    #[error("executor timed out after {0:?}")]
    Timeout(Duration),
}

impl SyncError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Converts an executor error response into an error.
    ///
    /// Missing codes, 5xx, 408 and 429 are transient; 400 and 422 are
    /// validation failures; everything else is permanent.
    pub fn from_response(response: &ExecuteResponse) -> Self {
        let message = match (&response.message, response.error_code) {
            (Some(msg), Some(code)) => format!("{code}: {msg}"),
            (Some(msg), None) => msg.clone(),
            (None, Some(code)) => format!("server returned {code}"),
            (None, None) => "server returned an error".to_string(),
        };

        if response.is_transient_error() {
            Self::Transient(message)
        } else if response.is_validation_error() {
            Self::Validation(message)
        } else {
            Self::Permanent(message)
        }
    }

    /// Returns how the manager should treat this error.
    pub fn classify(&self) -> ErrorClass {
        match self {
            SyncError::Validation(_) => ErrorClass::Validation,
            SyncError::Conflict { .. } => ErrorClass::Conflict,
            SyncError::Transient(_) | SyncError::Timeout(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Codec(e) => SyncError::Codec(e),
            other => SyncError::Validation(other.to_string()),
        }
    }
}
