//! Property-based test generators using proptest.
//!
//! Keys come from a small alphabet so generated writes collide often.

use livetree_client::{Completion, Database};
use livetree_codec::Value;
use livetree_core::Path;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for keys: short words and small integers.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::string::string_regex("[a-d]{1,2}").expect("Invalid regex"),
        (0u32..12).prop_map(|n| n.to_string()),
    ]
}

/// Strategy for paths up to three keys deep, root included.
pub fn path_strategy() -> impl Strategy<Value = Path> {
    prop::collection::vec(key_strategy(), 0..3)
        .prop_map(|keys| Path::from_keys(keys).expect("generated keys are valid"))
}

/// Strategy for non-null scalars.
pub fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-100i32..100).prop_map(Value::from),
        prop::string::string_regex("[a-z]{0,5}")
            .expect("Invalid regex")
            .prop_map(Value::Text),
    ]
}

/// Strategy for values: scalars or maps nested up to three levels.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(3, 24, 4, |inner| {
        prop::collection::btree_map(key_strategy(), inner, 1..4).prop_map(Value::Map)
    })
}

/// One write a client can issue.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeWrite {
    /// Replace the value at a path.
    Set(Path, Value),
    /// Merge children into the value at a path.
    Update(Path, BTreeMap<String, Value>),
    /// Delete the value at a path.
    Remove(Path),
}

impl TreeWrite {
    /// Location the write targets.
    pub fn path(&self) -> &Path {
        match self {
            TreeWrite::Set(path, _) | TreeWrite::Update(path, _) | TreeWrite::Remove(path) => path,
        }
    }

    /// Issues the write through `db`.
    pub fn apply(&self, db: &Database) -> Completion<()> {
        let reference = db
            .reference(&self.path().to_string())
            .expect("generated paths are valid");
        match self {
            TreeWrite::Set(_, value) => reference.set(value.clone()),
            TreeWrite::Update(_, changes) => reference.update(Value::Map(changes.clone())),
            TreeWrite::Remove(_) => reference.remove(),
        }
    }
}

fn child_path_strategy() -> impl Strategy<Value = Path> {
    path_strategy().prop_filter("writes target a child", |p| !p.is_root())
}

/// Strategy for writes below the root.
pub fn write_strategy() -> impl Strategy<Value = TreeWrite> {
    prop_oneof![
        3 => (child_path_strategy(), value_strategy()).prop_map(|(p, v)| TreeWrite::Set(p, v)),
        2 => (
            child_path_strategy(),
            prop::collection::btree_map(key_strategy(), value_strategy(), 1..3)
        )
            .prop_map(|(p, c)| TreeWrite::Update(p, c)),
        1 => child_path_strategy().prop_map(TreeWrite::Remove),
    ]
}

/// Strategy for a sequence of writes.
pub fn writes_strategy(max: usize) -> impl Strategy<Value = Vec<TreeWrite>> {
    prop::collection::vec(write_strategy(), 1..max)
}
