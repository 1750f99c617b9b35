//! # LiveTree Protocol
//!
//! Message types exchanged between a LiveTree client and its server.
//!
//! This crate provides:
//! - [`ClientMessage`]: handshake, subscribe/unsubscribe, writes, auth,
//!   account management and on-disconnect registration
//! - [`ServerMessage`]: welcome, acknowledgements, data patches, auth
//!   results and revocations
//! - [`ErrorBody`] and [`ErrorCode`] for failures reported by the server
//! - CBOR and JSON encoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod error;
mod messages;

pub use auth::{AccountAction, AuthInfo, Credential};
pub use error::{ErrorBody, ErrorCode};
pub use messages::{AckStatus, ClientMessage, PatchData, ServerMessage, WriteOp, PROTOCOL_VERSION};
