//! Ordered and filtered views over a node's children.
//!
//! [`QueryParams`] is immutable: every builder method validates the new
//! constraint and returns a new value. Two parameter sets with the same
//! effective criteria produce the same [`QueryParams::identifier`].

use crate::error::{CoreError, CoreResult};
use crate::node::{compare_priorities, Node, Priority};
use crate::path::{compare_keys, Path};
use livetree_codec::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifier of a query that loads all data in default order.
pub const DEFAULT_QUERY_ID: &str = "default";

/// Child ordering criterion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "path")]
pub enum OrderBy {
    /// By priority, then key.
    #[default]
    Priority,
    /// By key.
    Key,
    /// By the child's own value.
    Value,
    /// By the value at a path inside each child.
    Child(Path),
}

impl OrderBy {
    /// Compares two children under this ordering. Ties break by key.
    pub fn compare(&self, a: (&str, &Node), b: (&str, &Node)) -> Ordering {
        let primary = match self {
            OrderBy::Priority => compare_priorities(a.1.priority(), b.1.priority()),
            OrderBy::Key => Ordering::Equal,
            OrderBy::Value => a.1.order_value().cmp_for_order(&b.1.order_value()),
            OrderBy::Child(path) => {
                child_order_value(a.1, path).cmp_for_order(&child_order_value(b.1, path))
            }
        };
        primary.then_with(|| compare_keys(a.0, b.0))
    }

    /// Compares a child's ordering value to a bound value, ignoring keys.
    fn compare_to_bound(&self, key: &str, node: &Node, bound: &Value) -> Ordering {
        match self {
            OrderBy::Priority => {
                let bound = Priority::from_value(bound).ok().flatten();
                compare_priorities(node.priority(), bound.as_ref())
            }
            OrderBy::Key => match bound {
                Value::Text(b) => compare_keys(key, b),
                _ => Ordering::Greater,
            },
            OrderBy::Value => node.order_value().cmp_for_order(bound),
            OrderBy::Child(path) => child_order_value(node, path).cmp_for_order(bound),
        }
    }

    /// Sorts children under this ordering.
    pub fn sort(&self, children: &mut [(String, Arc<Node>)]) {
        children.sort_by(|(ka, a), (kb, b)| {
            self.compare((ka.as_str(), a.as_ref()), (kb.as_str(), b.as_ref()))
        });
    }
}

fn child_order_value(node: &Node, path: &Path) -> Value {
    node.descendant(path)
        .map(|n| n.order_value())
        .unwrap_or(Value::Null)
}

/// A start or end bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    /// Ordering value of the bound.
    pub value: Value,
    /// Optional key refining the bound among equal values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Result size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    /// Keep the first `n` children.
    First(u32),
    /// Keep the last `n` children.
    Last(u32),
}

/// Ordering and filtering criteria of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end: Option<Bound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<Limit>,
}

impl QueryParams {
    /// Default parameters: every child, priority order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective ordering.
    pub fn order_by(&self) -> &OrderBy {
        static DEFAULT: OrderBy = OrderBy::Priority;
        self.order_by.as_ref().unwrap_or(&DEFAULT)
    }

    /// Start bound, if any.
    pub fn start(&self) -> Option<&Bound> {
        self.start.as_ref()
    }

    /// End bound, if any.
    pub fn end(&self) -> Option<&Bound> {
        self.end.as_ref()
    }

    /// Limit, if any.
    pub fn limit(&self) -> Option<Limit> {
        self.limit
    }

    fn with_order(&self, order: OrderBy) -> CoreResult<Self> {
        if self.order_by.is_some() {
            return Err(CoreError::invalid_query("an ordering was already chosen"));
        }
        let next = Self {
            order_by: Some(order),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    /// Orders by priority.
    pub fn order_by_priority(&self) -> CoreResult<Self> {
        self.with_order(OrderBy::Priority)
    }

    /// Orders by key.
    pub fn order_by_key(&self) -> CoreResult<Self> {
        self.with_order(OrderBy::Key)
    }

    /// Orders by each child's value.
    pub fn order_by_value(&self) -> CoreResult<Self> {
        self.with_order(OrderBy::Value)
    }

    /// Orders by the value at `path` within each child.
    pub fn order_by_child(&self, path: &str) -> CoreResult<Self> {
        let path = Path::parse(path)?;
        if path.is_root() {
            return Err(CoreError::invalid_query(
                "order_by_child needs a non-empty path",
            ));
        }
        self.with_order(OrderBy::Child(path))
    }

    /// Keeps children at or after the bound.
    pub fn start_at(&self, value: impl Into<Value>, key: Option<&str>) -> CoreResult<Self> {
        if self.start.is_some() {
            return Err(CoreError::invalid_query("start bound was already set"));
        }
        let next = Self {
            start: Some(Bound {
                value: value.into(),
                key: key.map(str::to_string),
            }),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    /// Keeps children at or before the bound.
    pub fn end_at(&self, value: impl Into<Value>, key: Option<&str>) -> CoreResult<Self> {
        if self.end.is_some() {
            return Err(CoreError::invalid_query("end bound was already set"));
        }
        let next = Self {
            end: Some(Bound {
                value: value.into(),
                key: key.map(str::to_string),
            }),
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }

    /// Keeps children equal to the bound.
    pub fn equal_to(&self, value: impl Into<Value>, key: Option<&str>) -> CoreResult<Self> {
        let value = value.into();
        self.start_at(value.clone(), key)?.end_at(value, key)
    }

    /// Keeps the first `n` children.
    pub fn limit_to_first(&self, n: u32) -> CoreResult<Self> {
        self.with_limit(Limit::First(n))
    }

    /// Keeps the last `n` children.
    pub fn limit_to_last(&self, n: u32) -> CoreResult<Self> {
        self.with_limit(Limit::Last(n))
    }

    fn with_limit(&self, limit: Limit) -> CoreResult<Self> {
        if self.limit.is_some() {
            return Err(CoreError::invalid_query("limit was already set"));
        }
        if matches!(limit, Limit::First(0) | Limit::Last(0)) {
            return Err(CoreError::invalid_query("limit must be greater than zero"));
        }
        Ok(Self {
            limit: Some(limit),
            ..self.clone()
        })
    }

    fn validate(&self) -> CoreResult<()> {
        let bounds = self.start.iter().chain(self.end.iter());
        for bound in bounds {
            if let Value::Number(n) = bound.value {
                if !n.is_finite() {
                    return Err(livetree_codec::CodecError::NonFiniteNumber.into());
                }
            }
            if let Some(key) = &bound.key {
                crate::path::validate_key(key)?;
            }
            match self.order_by() {
                OrderBy::Key => {
                    if !matches!(bound.value, Value::Text(_)) {
                        return Err(CoreError::invalid_query(
                            "key-ordered bounds must be strings",
                        ));
                    }
                    if bound.key.is_some() {
                        return Err(CoreError::invalid_query(
                            "key-ordered bounds cannot carry a secondary key",
                        ));
                    }
                }
                OrderBy::Priority => {
                    Priority::from_value(&bound.value).map_err(|_| {
                        CoreError::invalid_query(
                            "priority bounds must be numbers, strings or null",
                        )
                    })?;
                }
                OrderBy::Value | OrderBy::Child(_) => {
                    if !bound.value.is_scalar() {
                        return Err(CoreError::invalid_query("bounds must be scalar values"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether the query returns every child.
    pub fn loads_all_data(&self) -> bool {
        self.start.is_none() && self.end.is_none() && self.limit.is_none()
    }

    /// Whether this is the default query (all data, priority order).
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && *self.order_by() == OrderBy::Priority
    }

    /// Canonical identifier of the effective criteria.
    ///
    /// `"default"` for the default query, otherwise sorted-key JSON of the
    /// filter set.
    pub fn identifier(&self) -> String {
        if self.is_default() {
            return DEFAULT_QUERY_ID.to_string();
        }
        let effective = Self {
            order_by: match self.order_by() {
                OrderBy::Priority => None,
                other => Some(other.clone()),
            },
            ..self.clone()
        };
        // serde_json maps are sorted by key, which makes the text canonical.
        serde_json::to_value(&effective)
            .and_then(|v| serde_json::to_string(&v))
            .unwrap_or_else(|_| format!("{effective:?}"))
    }

    fn after_start(&self, key: &str, node: &Node) -> bool {
        let Some(start) = &self.start else {
            return true;
        };
        let ord = self
            .order_by()
            .compare_to_bound(key, node, &start.value)
            .then_with(|| match &start.key {
                Some(k) => compare_keys(key, k),
                None => Ordering::Equal,
            });
        ord != Ordering::Less
    }

    fn before_end(&self, key: &str, node: &Node) -> bool {
        let Some(end) = &self.end else {
            return true;
        };
        let ord = self
            .order_by()
            .compare_to_bound(key, node, &end.value)
            .then_with(|| match &end.key {
                Some(k) => compare_keys(key, k),
                None => Ordering::Equal,
            });
        ord != Ordering::Greater
    }

    /// Children of `node` that match, in query order.
    pub fn view(&self, node: &Node) -> Vec<(String, Arc<Node>)> {
        let mut children: Vec<(String, Arc<Node>)> = node
            .children()
            .filter(|(k, n)| self.after_start(k, n) && self.before_end(k, n))
            .map(|(k, n)| (k.to_string(), Arc::clone(n)))
            .collect();
        self.order_by().sort(&mut children);
        match self.limit {
            Some(Limit::First(n)) => children.truncate(n as usize),
            Some(Limit::Last(n)) => {
                let skip = children.len().saturating_sub(n as usize);
                children.drain(..skip);
            }
            None => {}
        }
        children
    }

    /// `node` reduced to the matching children.
    ///
    /// Returns `node` itself when nothing is filtered out.
    pub fn filter(&self, node: &Arc<Node>) -> Arc<Node> {
        if self.loads_all_data() || node.num_children() == 0 {
            return Arc::clone(node);
        }
        let kept = self.view(node);
        if kept.len() == node.num_children() {
            return Arc::clone(node);
        }
        let children: BTreeMap<String, Arc<Node>> = kept.into_iter().collect();
        let mut filtered = Node::empty();
        for (key, child) in children {
            filtered = filtered.with_child(&key, child);
        }
        Arc::new(filtered.with_priority(node.priority().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores() -> Node {
        Node::from_value(&Value::map([
            ("ada", Value::map([("score", 30)])),
            ("bob", Value::map([("score", 10)])),
            ("cy", Value::map([("score", 20)])),
            ("dee", Value::map([("score", 20)])),
        ]))
        .unwrap()
    }

    fn keys(view: Vec<(String, Arc<Node>)>) -> Vec<String> {
        view.into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn default_identifier() {
        assert_eq!(QueryParams::new().identifier(), "default");
        assert_eq!(
            QueryParams::new().order_by_priority().unwrap().identifier(),
            "default"
        );
        assert_ne!(QueryParams::new().order_by_key().unwrap().identifier(), "default");
    }

    #[test]
    fn identifier_is_construction_order_independent() {
        let a = QueryParams::new()
            .order_by_child("score")
            .unwrap()
            .limit_to_first(2)
            .unwrap()
            .start_at(10, None)
            .unwrap();
        let b = QueryParams::new()
            .start_at(10, None)
            .unwrap()
            .limit_to_first(2)
            .unwrap()
            .order_by_child("score")
            .unwrap();
        assert_eq!(a.identifier(), b.identifier());
        assert!(a.identifier().contains("score"));
    }

    #[test]
    fn order_by_child_with_ties_breaks_by_key() {
        let q = QueryParams::new().order_by_child("score").unwrap();
        assert_eq!(keys(q.view(&scores())), vec!["bob", "cy", "dee", "ada"]);
    }

    #[test]
    fn range_and_limit() {
        let q = QueryParams::new()
            .order_by_child("score")
            .unwrap()
            .start_at(20, Some("dee"))
            .unwrap();
        assert_eq!(keys(q.view(&scores())), vec!["dee", "ada"]);

        let q = QueryParams::new()
            .order_by_child("score")
            .unwrap()
            .equal_to(20, None)
            .unwrap();
        assert_eq!(keys(q.view(&scores())), vec!["cy", "dee"]);

        let q = QueryParams::new()
            .order_by_child("score")
            .unwrap()
            .limit_to_last(2)
            .unwrap();
        assert_eq!(keys(q.view(&scores())), vec!["dee", "ada"]);
    }

    #[test]
    fn key_order_bounds() {
        let q = QueryParams::new()
            .order_by_key()
            .unwrap()
            .start_at("b", None)
            .unwrap()
            .end_at("cz", None)
            .unwrap();
        assert_eq!(keys(q.view(&scores())), vec!["bob", "cy"]);
    }

    #[test]
    fn invalid_combinations() {
        let q = QueryParams::new().order_by_key().unwrap();
        assert!(q.order_by_value().is_err());
        assert!(q.start_at(1, None).is_err());
        assert!(q.start_at("a", Some("b")).is_err());
        assert!(QueryParams::new().limit_to_first(0).is_err());
        assert!(QueryParams::new()
            .limit_to_first(1)
            .unwrap()
            .limit_to_last(1)
            .is_err());
        assert!(QueryParams::new().start_at(1, None).unwrap().start_at(2, None).is_err());
        assert!(QueryParams::new().start_at(true, None).is_err());
        assert!(QueryParams::new()
            .order_by_value()
            .unwrap()
            .start_at(true, None)
            .is_ok());
        assert!(QueryParams::new().order_by_child("").is_err());
    }

    #[test]
    fn filter_builds_reduced_node() {
        let node = Arc::new(scores());
        let q = QueryParams::new().order_by_key().unwrap().limit_to_first(1).unwrap();
        let filtered = q.filter(&node);
        assert_eq!(filtered.num_children(), 1);
        assert!(filtered.child("ada").is_some());

        let all = QueryParams::new();
        assert!(Arc::ptr_eq(&all.filter(&node), &node));
    }

    #[test]
    fn value_order() {
        let node = Node::from_value(&Value::map([
            ("a", Value::from("x")),
            ("b", Value::from(3)),
            ("c", Value::from(true)),
            ("d", Value::map([("k", 1)])),
        ]))
        .unwrap();
        let q = QueryParams::new().order_by_value().unwrap();
        assert_eq!(keys(q.view(&node)), vec!["c", "b", "a", "d"]);
    }
}
