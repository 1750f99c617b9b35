//! # LiveTree Testkit
//!
//! Test utilities for LiveTree.
//!
//! This crate provides:
//! - [`LoopbackServer`], an authoritative in-memory server with access
//!   rules, signed tokens, accounts and on-disconnect writes
//! - [`LoopbackLink`], a deterministic single-threaded pump between a
//!   client and the server
//! - [`LoopbackConnector`], for tests that run the real driver on tokio
//! - Property-based test generators using proptest
//! - Event recorders and tracing setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livetree_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_server() {
//!     let server = LoopbackServer::shared();
//!     let mut link = LoopbackLink::connect(server.clone());
//!     let done = link.database().reference("a").unwrap().set(1);
//!     link.pump();
//!     assert_eq!(server.value("a"), 1.into());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connector;
pub mod fixtures;
pub mod generators;
pub mod link;
pub mod server;
pub mod token;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connector::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::link::*;
    pub use crate::server::*;
}

pub use connector::LoopbackConnector;
pub use fixtures::*;
pub use link::{default_config, pump_all, LoopbackLink, LOOPBACK_URL};
pub use server::{LoopbackConfig, LoopbackServer, SessionId};
pub use token::{Claims, TokenIssuer};
