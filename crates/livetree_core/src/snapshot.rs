//! Immutable captures of a location.

use crate::error::CoreResult;
use crate::node::{Node, Priority};
use crate::path::Path;
use crate::query::OrderBy;
use livetree_codec::Value;
use std::sync::Arc;

/// Read-only view of a node and its subtree at one instant.
///
/// Cloning is cheap; the subtree is shared and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    path: Path,
    node: Arc<Node>,
    order: OrderBy,
}

impl Snapshot {
    /// Captures `node` at `path`, iterating children in default order.
    pub fn new(path: Path, node: Arc<Node>) -> Self {
        Self::with_order(path, node, OrderBy::Priority)
    }

    /// Captures `node` at `path`, iterating children in `order`.
    pub fn with_order(path: Path, node: Arc<Node>, order: OrderBy) -> Self {
        Self { path, node, order }
    }

    /// Location of the snapshot.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last key of the location, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }

    /// The captured node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Plain value, without priorities. Null when nothing exists.
    pub fn value(&self) -> Value {
        self.node.to_value()
    }

    /// Value in export form, including priorities.
    pub fn export(&self) -> Value {
        self.node.export()
    }

    /// Priority of the captured node.
    pub fn priority(&self) -> Option<&Priority> {
        self.node.priority()
    }

    /// Whether any data exists at the location.
    pub fn exists(&self) -> bool {
        !self.node.is_empty()
    }

    /// Whether the node has children.
    pub fn has_children(&self) -> bool {
        self.node.num_children() > 0
    }

    /// Number of direct children.
    pub fn num_children(&self) -> usize {
        self.node.num_children()
    }

    /// Snapshot of a relative location. Missing data yields an empty snapshot.
    pub fn child(&self, relative: &str) -> CoreResult<Snapshot> {
        let rel = Path::parse(relative)?;
        Ok(Snapshot::new(self.path.join(&rel), self.node.get(&rel)))
    }

    /// Whether data exists at a relative location.
    pub fn has_child(&self, relative: &str) -> CoreResult<bool> {
        let rel = Path::parse(relative)?;
        Ok(self.node.descendant(&rel).is_some())
    }

    fn ordered_children(&self) -> Vec<(String, Arc<Node>)> {
        let mut children: Vec<(String, Arc<Node>)> = self
            .node
            .children()
            .map(|(k, n)| (k.to_string(), Arc::clone(n)))
            .collect();
        self.order.sort(&mut children);
        children
    }

    /// Direct children as snapshots, in this snapshot's order.
    pub fn children(&self) -> Vec<Snapshot> {
        self.ordered_children()
            .into_iter()
            .map(|(k, n)| Snapshot::new(self.path.push_key(&k), n))
            .collect()
    }

    /// Calls `f` on each child in order until it returns `true`.
    ///
    /// Returns `true` if iteration stopped early.
    pub fn for_each<F>(&self, mut f: F) -> bool
    where
        F: FnMut(&Snapshot) -> bool,
    {
        self.ordered_children()
            .into_iter()
            .any(|(k, n)| f(&Snapshot::new(self.path.push_key(&k), n)))
    }
}
