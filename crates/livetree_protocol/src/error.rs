//! Error codes carried on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable failure reason reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Access rules forbid the read or write.
    PermissionDenied,
    /// The token could not be verified.
    InvalidToken,
    /// The token has expired.
    ExpiredToken,
    /// Email or password is wrong.
    InvalidCredentials,
    /// The server refused the write.
    WriteRejected,
    /// The request was malformed.
    InvalidRequest,
    /// An account with that email already exists.
    UserExists,
    /// No account with that email exists.
    UnknownUser,
    /// Client and server protocol versions differ.
    VersionMismatch,
    /// Unexpected server failure.
    Internal,
}

impl ErrorCode {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::ExpiredToken => "expired_token",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::WriteRejected => "write_rejected",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UserExists => "user_exists",
            ErrorCode::UnknownUser => "unknown_user",
            ErrorCode::VersionMismatch => "version_mismatch",
            ErrorCode::Internal => "internal",
        }
    }

    /// Whether the code describes an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidToken | ErrorCode::ExpiredToken | ErrorCode::InvalidCredentials
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of acknowledgements and revocations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ErrorBody {
    /// Failure reason.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorBody {
    /// Creates an error body.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Permission denied shortcut.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }
}
