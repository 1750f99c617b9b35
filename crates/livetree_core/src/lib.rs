//! # LiveTree Core
//!
//! Local cache engine for LiveTree. No I/O happens here.
//!
//! This crate provides:
//! - [`Path`] and key rules for addressing locations
//! - [`PathTree`], the persistent in-memory tree of [`Node`]s
//! - [`QueryParams`] for ordered and filtered child views
//! - [`Snapshot`], immutable captures handed to listeners
//! - [`EventDispatcher`], which diffs views and produces child and value events
//! - [`EventQueue`], which runs callbacks in order outside of engine locks
//!
//! ## Usage
//!
//! ```
//! use livetree_codec::Value;
//! use livetree_core::{
//!     EventDispatcher, EventQueue, EventType, Listener, Path, PathTree, QueryParams, Snapshot,
//! };
//! use std::sync::Arc;
//!
//! let mut tree = PathTree::new();
//! let mut events = EventDispatcher::new();
//! let queue = EventQueue::new();
//!
//! let listener = Listener {
//!     event_type: EventType::Value,
//!     callback: Arc::new(|snapshot: &Snapshot, _: Option<&str>| println!("{}", snapshot.value())),
//!     cancel: None,
//!     once: false,
//! };
//! let root = Path::root();
//! let (_id, dispatch) = events.register(&root, &QueryParams::new(), listener, &tree);
//! queue.extend(dispatch.tasks);
//!
//! tree.set_value(&root, &Value::map([("a", 1)])).unwrap();
//! events.mark_complete(&root);
//! queue.extend(events.changed(&root, &tree).tasks);
//! assert_eq!(queue.drain(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod events;
mod node;
mod path;
mod query;
mod queue;
mod snapshot;
mod tree;

pub use error::{CoreError, CoreResult};
pub use events::{
    CancelCallback, Dispatch, Event, EventCallback, EventDispatcher, EventType, Listener,
    ListenerId, ViewKey,
};
pub use node::{compare_priorities, Node, Priority, PRIORITY_KEY, VALUE_KEY};
pub use path::{compare_keys, validate_key, Path, MAX_KEY_BYTES};
pub use query::{Bound, Limit, OrderBy, QueryParams, DEFAULT_QUERY_ID};
pub use queue::{EventQueue, Task};
pub use snapshot::Snapshot;
pub use tree::{resolve_merge, ChildChange, PathTree};

pub use livetree_codec::Value;
