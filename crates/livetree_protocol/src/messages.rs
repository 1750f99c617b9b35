//! Protocol messages.
//!
//! Messages are serde-tagged enums. The binary form is CBOR, the text form
//! JSON; both carry the same `type` tag.

use crate::auth::{AccountAction, AuthInfo, Credential};
use crate::error::ErrorBody;
use livetree_codec::{from_cbor, from_json, to_cbor, to_json, CodecResult, Value};
use livetree_core::{Path, QueryParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Kind of write carried by a write or on-disconnect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    /// Replace the value at the path. The payload is in export form.
    Set,
    /// Merge a map of relative paths into the value at the path.
    Update,
    /// Delete the value at the path.
    Remove,
}

impl WriteOp {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOp::Set => "set",
            WriteOp::Update => "update",
            WriteOp::Remove => "remove",
        }
    }
}

/// Outcome reported in an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// The request succeeded.
    Ok,
    /// The request failed; see the error body.
    Error,
}

/// Data carried by a patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchData {
    /// The full new value at the path, in export form (order keys included).
    Set(Value),
    /// Relative path to new value, each in export form.
    Merge(BTreeMap<String, Value>),
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message after the transport opens.
    Handshake {
        /// Client protocol version.
        protocol_version: u16,
        /// Database namespace the client addresses.
        namespace: String,
    },
    /// Start listening to a location.
    Subscribe {
        /// Correlates the acknowledgement.
        request_id: u64,
        /// Location.
        path: Path,
        /// Query criteria.
        query: QueryParams,
        /// Canonical query identifier.
        query_id: String,
    },
    /// Stop listening to a location.
    Unsubscribe {
        /// Location.
        path: Path,
        /// Canonical query identifier.
        query_id: String,
    },
    /// Write data.
    Write {
        /// Correlates the acknowledgement.
        request_id: u64,
        /// Target location.
        path: Path,
        /// Kind of write.
        op: WriteOp,
        /// Value, merge map, or null.
        payload: Value,
    },
    /// Authenticate the session.
    Auth {
        /// Correlates the result.
        request_id: u64,
        /// Credentials.
        credential: Credential,
    },
    /// Drop the session's authentication.
    Unauth {
        /// Correlates the acknowledgement, if one is wanted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    /// User management.
    Account {
        /// Correlates the acknowledgement.
        request_id: u64,
        /// Operation to perform.
        action: AccountAction,
    },
    /// Stage a write the server runs when this session disconnects.
    DisconnectAction {
        /// Correlates the acknowledgement.
        request_id: u64,
        /// Target location.
        path: Path,
        /// Kind of write.
        op: WriteOp,
        /// Value, merge map, or null.
        payload: Value,
    },
    /// Drop staged writes at a location and below.
    CancelDisconnectAction {
        /// Correlates the acknowledgement.
        request_id: u64,
        /// Location.
        path: Path,
    },
}

impl ClientMessage {
    /// Message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Handshake { .. } => "handshake",
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::Write { .. } => "write",
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Unauth { .. } => "unauth",
            ClientMessage::Account { .. } => "account",
            ClientMessage::DisconnectAction { .. } => "disconnect_action",
            ClientMessage::CancelDisconnectAction { .. } => "cancel_disconnect_action",
        }
    }

    /// Request id awaiting an acknowledgement, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ClientMessage::Subscribe { request_id, .. }
            | ClientMessage::Write { request_id, .. }
            | ClientMessage::Auth { request_id, .. }
            | ClientMessage::Account { request_id, .. }
            | ClientMessage::DisconnectAction { request_id, .. }
            | ClientMessage::CancelDisconnectAction { request_id, .. } => Some(*request_id),
            ClientMessage::Unauth { request_id } => *request_id,
            ClientMessage::Handshake { .. } | ClientMessage::Unsubscribe { .. } => None,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }

    /// Encodes to JSON text.
    pub fn to_json(&self) -> CodecResult<String> {
        to_json(self)
    }

    /// Decodes from JSON text.
    pub fn from_json(text: &str) -> CodecResult<Self> {
        from_json(text)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to the handshake; the connection is usable afterwards.
    Welcome {
        /// Server protocol version.
        protocol_version: u16,
        /// Server-assigned session id.
        session_id: String,
        /// Server clock in milliseconds since the Unix epoch.
        server_time: u64,
    },
    /// Acknowledgement of a request.
    Ack {
        /// Request being acknowledged.
        request_id: u64,
        /// Outcome.
        status: AckStatus,
        /// Failure detail when `status` is `Error`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
        /// Extra result data (e.g. the uid of a created user).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Authoritative data for a listened location.
    Patch {
        /// Location the data applies to.
        path: Path,
        /// New data.
        data: PatchData,
    },
    /// Result of an auth request.
    AuthResult {
        /// Request being answered.
        request_id: u64,
        /// Session details on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthInfo>,
        /// Failure detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    /// The server invalidated the session's authentication.
    AuthRevoked {
        /// Why.
        reason: ErrorBody,
    },
    /// The server stopped serving a listened location.
    ListenRevoked {
        /// Location.
        path: Path,
        /// Canonical query identifier.
        query_id: String,
        /// Why.
        error: ErrorBody,
    },
    /// The server is closing the connection.
    Goodbye {
        /// Why.
        reason: String,
    },
}

impl ServerMessage {
    /// Successful acknowledgement.
    pub fn ack_ok(request_id: u64) -> Self {
        ServerMessage::Ack {
            request_id,
            status: AckStatus::Ok,
            error: None,
            data: None,
        }
    }

    /// Failed acknowledgement.
    pub fn ack_error(request_id: u64, error: ErrorBody) -> Self {
        ServerMessage::Ack {
            request_id,
            status: AckStatus::Error,
            error: Some(error),
            data: None,
        }
    }

    /// Message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Patch { .. } => "patch",
            ServerMessage::AuthResult { .. } => "auth_result",
            ServerMessage::AuthRevoked { .. } => "auth_revoked",
            ServerMessage::ListenRevoked { .. } => "listen_revoked",
            ServerMessage::Goodbye { .. } => "goodbye",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }

    /// Encodes to JSON text.
    pub fn to_json(&self) -> CodecResult<String> {
        to_json(self)
    }

    /// Decodes from JSON text.
    pub fn from_json(text: &str) -> CodecResult<Self> {
        from_json(text)
    }
}
