//! Error types for the client.

use livetree_codec::CodecError;
use livetree_core::{CoreError, Path};
use livetree_protocol::{ErrorBody, ErrorCode};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by client operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Channel unreachable or dropped.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Invalid or expired credentials or token.
    #[error("authentication failed ({code}): {message}")]
    Auth {
        /// Failure reason.
        code: ErrorCode,
        /// Error message.
        message: String,
    },

    /// Server access rules forbid the operation.
    #[error("permission denied at {path}: {message}")]
    PermissionDenied {
        /// Location of the denied operation.
        path: String,
        /// Error message.
        message: String,
    },

    /// Malformed path, payload or query, detected before sending.
    #[error("validation error: {0}")]
    Validation(CoreError),

    /// The server refused a write.
    #[error("write rejected at {path}: {message}")]
    WriteRejected {
        /// Location of the write.
        path: String,
        /// Error message.
        message: String,
    },

    /// Other failure reported by the server.
    #[error("server error ({code}): {message}")]
    Server {
        /// Failure reason.
        code: ErrorCode,
        /// Error message.
        message: String,
    },

    /// The server spoke an incompatible protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation was abandoned before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an authentication error.
    pub fn auth(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Auth {
            code,
            message: message.into(),
        }
    }

    /// Maps a server error body to a client error for an operation at `path`.
    pub fn from_body(body: ErrorBody, path: &Path) -> Self {
        let ErrorBody { code, message } = body;
        match code {
            ErrorCode::PermissionDenied => Self::PermissionDenied {
                path: path.to_string(),
                message,
            },
            ErrorCode::InvalidToken | ErrorCode::ExpiredToken | ErrorCode::InvalidCredentials => {
                Self::Auth { code, message }
            }
            ErrorCode::WriteRejected => Self::WriteRejected {
                path: path.to_string(),
                message,
            },
            ErrorCode::VersionMismatch => Self::Protocol(message),
            code => Self::Server { code, message },
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { retryable, .. } => *retryable,
            ClientError::Server { code, .. } => *code == ErrorCode::Internal,
            _ => false,
        }
    }

    /// Returns true for permission failures.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ClientError::PermissionDenied { .. })
    }
}

impl From<CoreError> for ClientError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::PermissionDenied { path, reason } => Self::PermissionDenied {
                path,
                message: reason,
            },
            other => Self::Validation(other),
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        Self::Validation(CoreError::Codec(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ClientError::transport_retryable("connection lost").is_retryable());
        assert!(!ClientError::transport_fatal("bad url").is_retryable());
        assert!(ClientError::Server {
            code: ErrorCode::Internal,
            message: "oops".into()
        }
        .is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
    }

    #[test]
    fn maps_server_bodies() {
        let path = Path::parse("/a").unwrap();
        let err = ClientError::from_body(ErrorBody::permission_denied("no"), &path);
        assert!(err.is_permission_denied());
        assert!(err.to_string().contains("/a"));

        let err = ClientError::from_body(ErrorBody::new(ErrorCode::ExpiredToken, "old"), &path);
        assert!(matches!(err, ClientError::Auth { code: ErrorCode::ExpiredToken, .. }));

        let err = ClientError::from_body(ErrorBody::new(ErrorCode::WriteRejected, "bad"), &path);
        assert!(matches!(err, ClientError::WriteRejected { .. }));
    }

    #[test]
    fn core_errors_convert() {
        let err: ClientError = CoreError::permission_denied("/x", "rules").into();
        assert!(err.is_permission_denied());
        let err: ClientError = CoreError::invalid_key("a.b", "dot").into();
        assert!(matches!(err, ClientError::Validation(_)));
    }
}
