//! Authentication and account payloads.

use serde::{Deserialize, Serialize};

/// Credentials presented to authenticate a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credential {
    /// A previously issued token or a custom secret.
    Token {
        /// The token text.
        token: String,
    },
    /// Email and password.
    Password {
        /// Account email.
        email: String,
        /// Account password.
        password: String,
    },
}

impl Credential {
    /// Provider name reported for sessions created from this credential.
    pub fn provider(&self) -> &'static str {
        match self {
            Credential::Token { .. } => "custom",
            Credential::Password { .. } => "password",
        }
    }
}

/// A successful authentication, as issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// User id.
    pub uid: String,
    /// Provider that authenticated the user.
    pub provider: String,
    /// Token to present on reconnect.
    pub token: String,
    /// Expiry in milliseconds since the Unix epoch.
    pub expires: u64,
    /// Account email, for password sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl AuthInfo {
    /// Whether the session has expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires
    }
}

/// User management operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AccountAction {
    /// Create an email/password account.
    CreateUser {
        /// Account email.
        email: String,
        /// Initial password.
        password: String,
    },
    /// Delete an account.
    RemoveUser {
        /// Account email.
        email: String,
        /// Current password.
        password: String,
    },
    /// Change an account's password.
    ChangePassword {
        /// Account email.
        email: String,
        /// Current password.
        old_password: String,
        /// Replacement password.
        new_password: String,
    },
    /// Ask the server to send a password reset message.
    SendPasswordReset {
        /// Account email.
        email: String,
    },
}

impl AccountAction {
    /// Email the action applies to.
    pub fn email(&self) -> &str {
        match self {
            AccountAction::CreateUser { email, .. }
            | AccountAction::RemoveUser { email, .. }
            | AccountAction::ChangePassword { email, .. }
            | AccountAction::SendPasswordReset { email } => email,
        }
    }
}
