//! Executor responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome reported by the remote operation executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    /// The server durably applied the operation.
    Applied,
    /// The server's version differs from the operation's base version.
    Conflict,
    /// The server rejected or failed the operation.
    Error,
}

/// Response returned by a remote operation executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// What happened.
    pub status: ExecuteStatus,
    /// Current server state of the entity (for conflicts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<Value>,
    /// Current server version of the entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<u64>,
    /// HTTP-style status code for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    /// Human-readable error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecuteResponse {
    /// Creates an applied response.
    pub fn applied() -> Self {
        Self {
            status: ExecuteStatus::Applied,
            server_data: None,
            server_version: None,
            error_code: None,
            message: None,
        }
    }

    /// Creates an applied response carrying the new server version.
    pub fn applied_at(version: u64) -> Self {
        Self {
            server_version: Some(version),
            ..Self::applied()
        }
    }

    /// Creates a conflict response.
    pub fn conflict(server_data: Value, server_version: u64) -> Self {
        Self {
            status: ExecuteStatus::Conflict,
            server_data: Some(server_data),
            server_version: Some(server_version),
            ..Self::applied()
        }
    }

    /// Creates an error response with a status code.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            status: ExecuteStatus::Error,
            error_code: Some(code),
            message: Some(message.into()),
            ..Self::applied()
        }
    }

    /// Returns true if the error code is worth retrying
    /// (missing code, 408, 429 or 5xx).
    pub fn is_transient_error(&self) -> bool {
        match self.error_code {
            None => true,
            Some(code) => code == 408 || code == 429 || (500..600).contains(&code),
        }
    }

    /// Returns true if the error code denotes a malformed request (400, 422).
    pub fn is_validation_error(&self) -> bool {
        matches!(self.error_code, Some(400) | Some(422))
    }
}
