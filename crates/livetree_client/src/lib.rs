//! # LiveTree Client
//!
//! Realtime client for a tree-structured database reached by path.
//!
//! This crate provides:
//! - [`Database`], the shared connection, and [`Reference`]/[`Query`]
//!   handles to locations
//! - live listeners for value and child events, one-shot reads
//! - optimistic writes (`set`, `update`, `remove`, `push`) reconciled
//!   against the server, each returning a [`Completion`]
//! - on-disconnect writes staged with the server via [`OnDisconnect`]
//! - token and email/password authentication with session resumption
//! - automatic reconnection with backoff, re-subscribing listeners and
//!   re-registering on-disconnect writes
//!
//! ## Architecture
//!
//! All state sits in one engine behind one lock. Caller operations and
//! server messages mutate it and queue callbacks; nothing runs a callback
//! while the engine is locked. The engine performs no I/O: a [`Driver`] (or a
//! test harness) executes its [`Command`]s against a [`Connector`] and feeds
//! back what the server sends.
//!
//! ## Example
//!
//! ```no_run
//! use livetree_client::{ClientConfig, Database, Driver, EventType, OfflineConnector};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), livetree_client::ClientError> {
//! let db = Database::new(ClientConfig::new("https://demo.example.com"));
//! let _driver = Driver::spawn(db.clone(), Arc::new(OfflineConnector));
//!
//! let scores = db.reference("scores")?;
//! scores.on(EventType::ChildAdded, |snapshot, prev_key| {
//!     println!("{:?} after {prev_key:?}: {}", snapshot.key(), snapshot.value());
//! });
//! let (_child, written) = scores.push(42);
//! written.await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod clock;
mod completion;
mod config;
mod database;
mod driver;
mod engine;
mod error;
mod on_disconnect;
mod push_id;
mod reference;
mod session;
mod transport;
mod writes;

pub use auth::{AuthCancelCallback, MemorySessionStore, SessionStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::Completion;
pub use config::{ClientConfig, RetryConfig};
pub use database::Database;
pub use driver::Driver;
pub use error::{ClientError, ClientResult};
pub use push_id::{PushIdGenerator, PUSH_ID_LEN};
pub use reference::{OnDisconnect, Query, Reference};
pub use session::SessionState;
pub use transport::{BoxFuture, Channel, Command, Connector, OfflineConnector};

pub use livetree_codec::Value;
pub use livetree_core::{EventType, ListenerId, Path, Priority, Snapshot};
pub use livetree_protocol::{AuthInfo, Credential, ErrorCode};
