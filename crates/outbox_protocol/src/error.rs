//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building, validating or decoding operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The operation is malformed.
    #[error("invalid operation: {0}")]
    Invalid(String),

    /// An operation id could not be parsed.
    #[error("invalid operation id: {0}")]
    InvalidId(String),

    /// A persisted record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// An unknown enum name was supplied.
    #[error("unknown {kind}: {value}")]
    UnknownName {
        /// What was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}

impl ProtocolError {
    /// Creates an invalid-operation error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::invalid("missing payload");
        assert_eq!(err.to_string(), "invalid operation: missing payload");

        let err = ProtocolError::UnknownName {
            kind: "priority",
            value: "urgent".into(),
        };
        assert_eq!(err.to_string(), "unknown priority: urgent");
    }
}
