//! The path-addressed cache tree.

use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::path::Path;
use livetree_codec::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One child replacement in an ordered child diff.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChange {
    /// Key of the child below the diff location.
    pub key: String,
    /// New child, or `None` to remove it.
    pub node: Option<Node>,
}

/// In-memory tree of nodes addressed by [`Path`].
///
/// Every mutation builds the new tree off to the side and swaps the root in
/// one step, so a reader holding an older root never sees a half-applied
/// change.
#[derive(Debug, Clone, Default)]
pub struct PathTree {
    root: Arc<Node>,
}

impl PathTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current root node.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Node at `path`; the empty node if nothing is stored there.
    pub fn get(&self, path: &Path) -> Arc<Node> {
        self.root.get(path)
    }

    /// Plain value at `path`.
    pub fn value(&self, path: &Path) -> Value {
        self.get(path).to_value()
    }

    /// Replaces the node at `path`, discarding whatever was there.
    pub fn set(&mut self, path: &Path, node: Node) {
        self.root = Arc::new(self.root.with_descendant(path, Arc::new(node)));
    }

    /// Parses `value` (export form) and replaces the node at `path`.
    pub fn set_value(&mut self, path: &Path, value: &Value) -> CoreResult<()> {
        let node = Node::from_value(value)?;
        self.set(path, node);
        Ok(())
    }

    /// Writes each entry of `changes` relative to `path`, leaving other
    /// children alone. Keys may be multi-segment relative paths.
    ///
    /// All entries are validated before anything is written.
    pub fn merge(&mut self, path: &Path, changes: &BTreeMap<String, Value>) -> CoreResult<()> {
        let resolved = resolve_merge(path, changes)?;
        let mut root = Arc::clone(&self.root);
        for (target, node) in resolved {
            root = Arc::new(root.with_descendant(&target, Arc::new(node)));
        }
        self.root = root;
        Ok(())
    }

    /// Removes the node at `path` with its whole subtree.
    pub fn remove(&mut self, path: &Path) {
        self.set(path, Node::empty());
    }

    /// Applies a batch of direct-child replacements under `path` in order.
    pub fn apply_ordered_child_diff(&mut self, path: &Path, diff: &[ChildChange]) {
        let mut parent = (*self.get(path)).clone();
        for change in diff {
            let child = change.node.clone().unwrap_or_default();
            parent = parent.with_child(&change.key, Arc::new(child));
        }
        self.set(path, parent);
    }
}

/// Validates a merge payload and resolves it into absolute targets.
///
/// Rejects entries whose paths overlap, since their application order would
/// be ambiguous.
pub fn resolve_merge(
    path: &Path,
    changes: &BTreeMap<String, Value>,
) -> CoreResult<Vec<(Path, Node)>> {
    let mut resolved: Vec<(Path, Node)> = Vec::with_capacity(changes.len());
    for (relative, value) in changes {
        let rel = Path::parse(relative)?;
        if rel.is_root() {
            return Err(CoreError::invalid_payload(format!(
                "update key {relative:?} does not name a child"
            )));
        }
        let node = Node::from_value(value)?;
        resolved.push((path.join(&rel), node));
    }
    for (i, (a, _)) in resolved.iter().enumerate() {
        if let Some((b, _)) = resolved[i + 1..]
            .iter()
            .find(|(b, _)| a.contains(b) || b.contains(a))
        {
            return Err(CoreError::invalid_payload(format!(
                "update paths {a} and {b} overlap"
            )));
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn set_creates_intermediate_nodes() {
        let mut tree = PathTree::new();
        tree.set_value(&p("/a/b/c"), &Value::from(1)).unwrap();
        assert_eq!(tree.value(&p("/a/b/c")), Value::from(1));
        assert_eq!(
            tree.value(&p("/a")),
            Value::map([("b", Value::map([("c", 1)]))])
        );
    }

    #[test]
    fn set_scalar_discards_children() {
        let mut tree = PathTree::new();
        tree.set_value(&p("/a"), &Value::map([("x", 1), ("y", 2)]))
            .unwrap();
        tree.set_value(&p("/a"), &Value::from("leaf")).unwrap();
        assert_eq!(tree.value(&p("/a")), Value::from("leaf"));
        assert!(tree.get(&p("/a/x")).is_empty());
    }

    #[test]
    fn merge_keeps_siblings() {
        let mut tree = PathTree::new();
        tree.set_value(&Path::root(), &Value::map([("a", 1), ("b", 2)]))
            .unwrap();
        let changes = BTreeMap::from([
            ("b".to_string(), Value::from(3)),
            ("c/d".to_string(), Value::from(4)),
        ]);
        tree.merge(&Path::root(), &changes).unwrap();
        assert_eq!(
            tree.value(&Path::root()),
            Value::map([
                ("a", Value::from(1)),
                ("b", Value::from(3)),
                ("c", Value::map([("d", 4)])),
            ])
        );
    }

    #[test]
    fn merge_is_all_or_nothing() {
        let mut tree = PathTree::new();
        tree.set_value(&Path::root(), &Value::map([("a", 1)])).unwrap();
        let changes = BTreeMap::from([
            ("b".to_string(), Value::from(2)),
            ("bad.key".to_string(), Value::from(3)),
        ]);
        assert!(tree.merge(&Path::root(), &changes).is_err());
        assert_eq!(tree.value(&Path::root()), Value::map([("a", 1)]));
    }

    #[test]
    fn merge_rejects_overlapping_paths() {
        let changes = BTreeMap::from([
            ("a".to_string(), Value::from(1)),
            ("a/b".to_string(), Value::from(2)),
        ]);
        assert!(resolve_merge(&Path::root(), &changes).is_err());
    }

    #[test]
    fn remove_drops_subtree_and_empty_parents() {
        let mut tree = PathTree::new();
        tree.set_value(&p("/a/b/c"), &Value::from(1)).unwrap();
        tree.remove(&p("/a/b"));
        assert!(tree.get(&p("/a")).is_empty());
        assert!(tree.root().is_empty());
    }

    #[test]
    fn readers_keep_old_root() {
        let mut tree = PathTree::new();
        tree.set_value(&p("/a"), &Value::from(1)).unwrap();
        let before = Arc::clone(tree.root());
        tree.set_value(&p("/a"), &Value::from(2)).unwrap();
        assert_eq!(before.to_value(), Value::map([("a", 1)]));
        assert_eq!(tree.value(&p("/a")), Value::from(2));
    }

    #[test]
    fn ordered_child_diff() {
        let mut tree = PathTree::new();
        tree.set_value(&p("/list"), &Value::map([("a", 1), ("b", 2)]))
            .unwrap();
        tree.apply_ordered_child_diff(
            &p("/list"),
            &[
                ChildChange {
                    key: "a".into(),
                    node: None,
                },
                ChildChange {
                    key: "c".into(),
                    node: Some(Node::leaf(Value::from(3)).unwrap()),
                },
            ],
        );
        assert_eq!(tree.value(&p("/list")), Value::map([("b", 2), ("c", 3)]));
    }
}
