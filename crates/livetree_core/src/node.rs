//! Immutable tree nodes.
//!
//! Nodes are persistent: every mutation returns a new node that shares all
//! untouched subtrees with the old one through `Arc`. A node is exactly one
//! of empty, a scalar leaf, or a branch with at least one child.

use crate::error::{CoreError, CoreResult};
use crate::path::{compare_keys, validate_key, Path};
use livetree_codec::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Map key carrying a node's priority in export form.
pub const PRIORITY_KEY: &str = ".priority";
/// Map key carrying a prioritized scalar in export form.
pub const VALUE_KEY: &str = ".value";

/// Ordering key attached to a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Priority {
    /// Numeric priority.
    Number(f64),
    /// String priority.
    Text(String),
}

impl Priority {
    /// Reads a priority from a value. Null means no priority.
    pub fn from_value(value: &Value) -> CoreResult<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) if n.is_finite() => Ok(Some(Priority::Number(*n))),
            Value::Text(s) => Ok(Some(Priority::Text(s.clone()))),
            other => Err(CoreError::invalid_payload(format!(
                "priority must be a number, a string or null, got {other}"
            ))),
        }
    }

    /// Converts back to a value.
    pub fn to_value(&self) -> Value {
        match self {
            Priority::Number(n) => Value::Number(*n),
            Priority::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl From<f64> for Priority {
    fn from(n: f64) -> Self {
        Priority::Number(n)
    }
}

impl From<&str> for Priority {
    fn from(s: &str) -> Self {
        Priority::Text(s.to_string())
    }
}

/// Compares optional priorities: none, then numbers, then strings.
pub fn compare_priorities(a: Option<&Priority>, b: Option<&Priority>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Priority::Number(x)), Some(Priority::Number(y))) => x.total_cmp(y),
        (Some(Priority::Number(_)), Some(Priority::Text(_))) => Ordering::Less,
        (Some(Priority::Text(_)), Some(Priority::Number(_))) => Ordering::Greater,
        (Some(Priority::Text(x)), Some(Priority::Text(y))) => x.cmp(y),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NodeKind {
    Empty,
    Leaf(Value),
    Branch(BTreeMap<String, Arc<Node>>),
}

/// A node of the cache tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: NodeKind,
    priority: Option<Priority>,
}

impl Default for Node {
    fn default() -> Self {
        Self::empty()
    }
}

impl Node {
    /// The empty node (no data).
    pub fn empty() -> Self {
        Self {
            kind: NodeKind::Empty,
            priority: None,
        }
    }

    /// A leaf holding a scalar. Null yields the empty node.
    pub fn leaf(value: Value) -> CoreResult<Self> {
        match value {
            Value::Null => Ok(Self::empty()),
            Value::Number(n) if !n.is_finite() => {
                Err(livetree_codec::CodecError::NonFiniteNumber.into())
            }
            Value::Map(_) => Err(CoreError::invalid_payload("leaf value cannot be a map")),
            scalar => Ok(Self {
                kind: NodeKind::Leaf(scalar),
                priority: None,
            }),
        }
    }

    /// Builds a node from a value in export form.
    ///
    /// Validates every key, drops null children and collapses empty maps,
    /// and reads `.priority`/`.value` meta keys.
    pub fn from_value(value: &Value) -> CoreResult<Self> {
        let map = match value {
            Value::Map(map) => map,
            scalar => return Self::leaf(scalar.clone()),
        };

        let priority = match map.get(PRIORITY_KEY) {
            Some(p) => Priority::from_value(p)?,
            None => None,
        };

        if let Some(inner) = map.get(VALUE_KEY) {
            if map.keys().any(|k| k != PRIORITY_KEY && k != VALUE_KEY) {
                return Err(CoreError::invalid_payload(
                    "\".value\" cannot be combined with child keys",
                ));
            }
            if !inner.is_scalar() {
                return Err(CoreError::invalid_payload("\".value\" must be a scalar"));
            }
            return Ok(Self::leaf(inner.clone())?.with_priority(priority));
        }

        let mut children = BTreeMap::new();
        for (key, child) in map {
            if key == PRIORITY_KEY {
                continue;
            }
            validate_key(key)?;
            let node = Self::from_value(child)?;
            if !node.is_empty() {
                children.insert(key.clone(), Arc::new(node));
            }
        }
        Ok(Self::branch(children).with_priority(priority))
    }

    fn branch(children: BTreeMap<String, Arc<Node>>) -> Self {
        if children.is_empty() {
            Self::empty()
        } else {
            Self {
                kind: NodeKind::Branch(children),
                priority: None,
            }
        }
    }

    /// Returns a copy with the given priority. Empty nodes never carry one.
    pub fn with_priority(mut self, priority: Option<Priority>) -> Self {
        if !self.is_empty() {
            self.priority = priority;
        }
        self
    }

    /// Whether the node holds no data.
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, NodeKind::Empty)
    }

    /// Whether the node is a scalar leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    /// The node's priority.
    pub fn priority(&self) -> Option<&Priority> {
        self.priority.as_ref()
    }

    /// The scalar held by a leaf.
    pub fn leaf_value(&self) -> Option<&Value> {
        match &self.kind {
            NodeKind::Leaf(v) => Some(v),
            _ => None,
        }
    }

    /// Value used when this node is ordered by value.
    ///
    /// Branches are represented by an empty map since all maps order equal.
    pub fn order_value(&self) -> Value {
        match &self.kind {
            NodeKind::Empty => Value::Null,
            NodeKind::Leaf(v) => v.clone(),
            NodeKind::Branch(_) => Value::Map(BTreeMap::new()),
        }
    }

    /// Number of direct children.
    pub fn num_children(&self) -> usize {
        match &self.kind {
            NodeKind::Branch(children) => children.len(),
            _ => 0,
        }
    }

    /// Direct child by key.
    pub fn child(&self, key: &str) -> Option<&Arc<Node>> {
        match &self.kind {
            NodeKind::Branch(children) => children.get(key),
            _ => None,
        }
    }

    /// Direct children in storage order (not child order).
    pub fn children(&self) -> impl Iterator<Item = (&str, &Arc<Node>)> {
        let iter = match &self.kind {
            NodeKind::Branch(children) => Some(children.iter()),
            _ => None,
        };
        iter.into_iter().flatten().map(|(k, v)| (k.as_str(), v))
    }

    /// Direct children sorted by priority, then key.
    pub fn children_by_priority(&self) -> Vec<(String, Arc<Node>)> {
        let mut out: Vec<(String, Arc<Node>)> = self
            .children()
            .map(|(k, v)| (k.to_string(), Arc::clone(v)))
            .collect();
        out.sort_by(|(ka, a), (kb, b)| {
            compare_priorities(a.priority(), b.priority()).then_with(|| compare_keys(ka, kb))
        });
        out
    }

    /// Node at a relative path, or `None` when nothing is stored there.
    pub fn descendant(&self, path: &Path) -> Option<&Arc<Node>> {
        let (first, rest) = path.segments().split_first()?;
        let child = self.child(first)?;
        rest.iter().try_fold(child, |node, key| node.child(key))
    }

    /// Node at a relative path as an owned handle, empty when absent.
    pub fn get(self: &Arc<Self>, path: &Path) -> Arc<Node> {
        if path.is_root() {
            return Arc::clone(self);
        }
        self.descendant(path)
            .cloned()
            .unwrap_or_else(|| Arc::new(Node::empty()))
    }

    /// Replaces one direct child. An empty child removes the key.
    pub fn with_child(&self, key: &str, child: Arc<Node>) -> Self {
        let mut children = match &self.kind {
            NodeKind::Branch(children) => children.clone(),
            _ => BTreeMap::new(),
        };
        if child.is_empty() {
            children.remove(key);
        } else {
            children.insert(key.to_string(), child);
        }
        let priority = self.priority.clone();
        Self::branch(children).with_priority(priority)
    }

    /// Replaces the node at a relative path, creating intermediate branches.
    ///
    /// Writing below a leaf discards the leaf's scalar.
    pub fn with_descendant(&self, path: &Path, node: Arc<Node>) -> Self {
        let Some(first) = path.front() else {
            return (*node).clone();
        };
        let current = self
            .child(first)
            .cloned()
            .unwrap_or_else(|| Arc::new(Node::empty()));
        let replaced = current.with_descendant(&path.pop_front(), node);
        self.with_child(first, Arc::new(replaced))
    }

    /// Converts to a plain value, without priorities.
    pub fn to_value(&self) -> Value {
        match &self.kind {
            NodeKind::Empty => Value::Null,
            NodeKind::Leaf(v) => v.clone(),
            NodeKind::Branch(children) => Value::Map(
                children
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }

    /// Converts to export form, with `.priority` and `.value` meta keys.
    pub fn export(&self) -> Value {
        let Some(priority) = &self.priority else {
            return match &self.kind {
                NodeKind::Branch(children) => Value::Map(
                    children
                        .iter()
                        .map(|(k, v)| (k.clone(), v.export()))
                        .collect(),
                ),
                _ => self.to_value(),
            };
        };
        let mut map = BTreeMap::new();
        map.insert(PRIORITY_KEY.to_string(), priority.to_value());
        match &self.kind {
            NodeKind::Empty => return Value::Null,
            NodeKind::Leaf(v) => {
                map.insert(VALUE_KEY.to_string(), v.clone());
            }
            NodeKind::Branch(children) => {
                for (k, v) in children {
                    map.insert(k.clone(), v.export());
                }
            }
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for Node {
    type Error = CoreError;

    fn try_from(value: Value) -> CoreResult<Self> {
        Node::from_value(&value)
    }
}
