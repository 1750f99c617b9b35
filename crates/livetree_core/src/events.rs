//! Listener registry and diff-based event dispatch.
//!
//! Listeners are grouped into *views*, one per (location, query). Views live
//! in a trie keyed by path segments so a mutation at a path finds every view
//! at an ancestor, the path itself, or a descendant without walking the data
//! tree. Each view remembers the data it last delivered; a mutation
//! recomputes the view's data once, diffs it against that memory and fans
//! the resulting events out to the view's registrations.
//!
//! The dispatcher never invokes callbacks. Every delivery becomes a
//! [`Task`] for the caller to enqueue and run later.

use crate::error::CoreError;
use crate::node::Node;
use crate::path::Path;
use crate::query::{OrderBy, QueryParams, DEFAULT_QUERY_ID};
use crate::queue::Task;
use crate::snapshot::Snapshot;
use crate::tree::PathTree;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Kinds of events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// The whole value at the location.
    Value,
    /// A child appeared.
    ChildAdded,
    /// A child's data changed.
    ChildChanged,
    /// A child disappeared.
    ChildRemoved,
    /// A child's position among its siblings changed.
    ChildMoved,
}

impl EventType {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Value => "value",
            EventType::ChildAdded => "child_added",
            EventType::ChildChanged => "child_changed",
            EventType::ChildRemoved => "child_removed",
            EventType::ChildMoved => "child_moved",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener callback: snapshot plus the key of the preceding sibling.
pub type EventCallback = Arc<dyn Fn(&Snapshot, Option<&str>) + Send + Sync>;

/// Called once when the server revokes read access for a listener.
pub type CancelCallback = Arc<dyn Fn(&CoreError) + Send + Sync>;

/// Handle identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A listener to register.
#[derive(Clone)]
pub struct Listener {
    /// Event type to receive.
    pub event_type: EventType,
    /// Delivery callback.
    pub callback: EventCallback,
    /// Optional cancellation callback.
    pub cancel: Option<CancelCallback>,
    /// Remove after the first delivery.
    pub once: bool,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("event_type", &self.event_type)
            .field("has_cancel", &self.cancel.is_some())
            .field("once", &self.once)
            .finish()
    }
}

/// One computed event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Kind of event.
    pub event_type: EventType,
    /// Data delivered with the event.
    pub snapshot: Snapshot,
    /// Key of the preceding sibling, for child events.
    pub prev_key: Option<String>,
}

/// Identity of a view: location plus query.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewKey {
    /// Location.
    pub path: Path,
    /// Query criteria.
    pub query: QueryParams,
}

impl ViewKey {
    /// Canonical query identifier.
    pub fn query_id(&self) -> String {
        self.query.identifier()
    }
}

/// Side effects of a dispatcher operation.
#[derive(Default)]
pub struct Dispatch {
    /// Deliveries to enqueue, in order.
    pub tasks: Vec<Task>,
    /// Views that gained their first listener.
    pub subscribe: Vec<ViewKey>,
    /// Views that lost their last listener.
    pub unsubscribe: Vec<ViewKey>,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("tasks", &self.tasks.len())
            .field("subscribe", &self.subscribe)
            .field("unsubscribe", &self.unsubscribe)
            .finish()
    }
}

impl Dispatch {
    fn absorb(&mut self, other: Dispatch) {
        self.tasks.extend(other.tasks);
        self.subscribe.extend(other.subscribe);
        self.unsubscribe.extend(other.unsubscribe);
    }
}

struct Registration {
    id: ListenerId,
    listener: Listener,
}

struct View {
    query: QueryParams,
    registrations: Vec<Registration>,
    /// Filtered data last delivered to this view.
    data: Arc<Node>,
    complete: bool,
    synced: bool,
    value_fired: bool,
}

struct TrieNode {
    path: Path,
    children: BTreeMap<String, usize>,
    views: BTreeMap<String, View>,
}

impl TrieNode {
    fn new(path: Path) -> Self {
        Self {
            path,
            children: BTreeMap::new(),
            views: BTreeMap::new(),
        }
    }
}

/// Registry of listeners and the views they observe.
pub struct EventDispatcher {
    nodes: Vec<TrieNode>,
    /// Released trie slots, reused before the arena grows.
    free: Vec<usize>,
    locations: HashMap<ListenerId, (usize, String)>,
    complete_paths: BTreeSet<Path>,
    next_id: u64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.locations.len())
            .field("complete_paths", &self.complete_paths)
            .finish()
    }
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new(Path::root())],
            free: Vec::new(),
            locations: HashMap::new(),
            complete_paths: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Number of live registrations.
    pub fn listener_count(&self) -> usize {
        self.locations.len()
    }

    /// Every view that currently has listeners.
    pub fn views(&self) -> Vec<ViewKey> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.views.values().map(move |view| ViewKey {
                    path: node.path.clone(),
                    query: view.query.clone(),
                })
            })
            .collect()
    }

    /// Whether a view exists for `path` and `query_id`.
    pub fn has_view(&self, path: &Path, query_id: &str) -> bool {
        self.locate(path)
            .is_some_and(|idx| self.nodes[idx].views.contains_key(query_id))
    }

    /// Whether local data at `path` is known to be complete.
    pub fn is_covered(&self, path: &Path) -> bool {
        if self.complete_paths.contains(&Path::root()) {
            return true;
        }
        let mut prefix = Path::root();
        for key in path.segments() {
            prefix = prefix.push_key(key);
            if self.complete_paths.contains(&prefix) {
                return true;
            }
        }
        false
    }

    /// Records that the cache holds the full data at `path`, e.g. after a
    /// local `set`. Takes effect on the next [`changed`](Self::changed).
    pub fn mark_complete(&mut self, path: &Path) {
        if self.is_covered(path) {
            return;
        }
        let nested: Vec<Path> = self.complete_below(path).cloned().collect();
        for covered in nested {
            self.complete_paths.remove(&covered);
        }
        self.complete_paths.insert(path.clone());
    }

    /// Completeness records at or below `path`.
    fn complete_below<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a Path> + 'a {
        self.complete_paths
            .range(path.clone()..)
            .take_while(move |p| path.contains(p))
    }

    /// Drops completeness records at or below `path` whose data is gone.
    fn forget_absent(&mut self, path: &Path, tree: &PathTree) {
        let stale: Vec<Path> = self
            .complete_below(path)
            .filter(|p| tree.get(p).is_empty())
            .cloned()
            .collect();
        for p in stale {
            self.complete_paths.remove(&p);
        }
    }

    fn locate(&self, path: &Path) -> Option<usize> {
        let mut idx = 0;
        for key in path.segments() {
            idx = *self.nodes[idx].children.get(key)?;
        }
        Some(idx)
    }

    fn locate_or_insert(&mut self, path: &Path) -> usize {
        let mut idx = 0;
        for key in path.segments() {
            idx = match self.nodes[idx].children.get(key) {
                Some(&child) => child,
                None => {
                    let node = TrieNode::new(self.nodes[idx].path.push_key(key));
                    let child = match self.free.pop() {
                        Some(slot) => {
                            self.nodes[slot] = node;
                            slot
                        }
                        None => {
                            self.nodes.push(node);
                            self.nodes.len() - 1
                        }
                    };
                    self.nodes[idx].children.insert(key.clone(), child);
                    child
                }
            };
        }
        idx
    }

    /// Releases `idx` and its ancestors while they hold neither views nor
    /// children. The root is never released.
    fn prune(&mut self, mut idx: usize) {
        while idx != 0 {
            let node = &self.nodes[idx];
            if !node.views.is_empty() || !node.children.is_empty() {
                return;
            }
            let Some(parent) = node.path.parent().and_then(|parent| self.locate(&parent)) else {
                return;
            };
            let path = std::mem::replace(&mut self.nodes[idx].path, Path::root());
            if let Some(key) = path.key() {
                self.nodes[parent].children.remove(key);
            }
            self.free.push(idx);
            idx = parent;
        }
    }

    /// Trie nodes at ancestors-or-self of `path`, then strict descendants.
    fn affected(&self, path: &Path) -> Vec<usize> {
        let mut out = vec![0];
        let mut idx = 0;
        for key in path.segments() {
            match self.nodes[idx].children.get(key) {
                Some(&child) => {
                    idx = child;
                    out.push(child);
                }
                None => return out,
            }
        }
        let mut stack: Vec<usize> = self.nodes[idx].children.values().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next].children.values().rev().copied());
        }
        out
    }

    /// Registers a listener and schedules its initial events.
    ///
    /// A new registration receives one `child_added` per existing child and,
    /// when the view's data is complete, a `value` event.
    pub fn register(
        &mut self,
        path: &Path,
        query: &QueryParams,
        listener: Listener,
        tree: &PathTree,
    ) -> (ListenerId, Dispatch) {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let covered = self.is_covered(path);
        let idx = self.locate_or_insert(path);
        let query_id = query.identifier();
        let mut dispatch = Dispatch::default();

        let created = !self.nodes[idx].views.contains_key(&query_id);
        let view = self.nodes[idx]
            .views
            .entry(query_id.clone())
            .or_insert_with(|| View {
                query: query.clone(),
                registrations: Vec::new(),
                data: query.filter(&tree.get(path)),
                complete: covered,
                synced: false,
                value_fired: covered,
            });

        let initial = initial_events(path, view);
        let mut consumed = false;
        for event in initial {
            if event.event_type != listener.event_type {
                continue;
            }
            dispatch.tasks.push(deliver(&listener.callback, event));
            if listener.once {
                consumed = true;
                break;
            }
        }

        if !consumed {
            view.registrations.push(Registration { id, listener });
            self.locations.insert(id, (idx, query_id.clone()));
        }

        let live = !self.nodes[idx]
            .views
            .get(&query_id)
            .is_some_and(|v| v.registrations.is_empty());
        let key = ViewKey {
            path: path.clone(),
            query: query.clone(),
        };
        if created && live {
            dispatch.subscribe.push(key);
        } else if created {
            self.nodes[idx].views.remove(&query_id);
            self.prune(idx);
        }
        (id, dispatch)
    }

    /// Removes one registration. Unknown ids are ignored.
    pub fn unregister(&mut self, id: ListenerId) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let Some((idx, query_id)) = self.locations.remove(&id) else {
            return dispatch;
        };
        if let Some(view) = self.nodes[idx].views.get_mut(&query_id) {
            view.registrations.retain(|r| r.id != id);
        }
        self.drop_if_empty(idx, &query_id, &mut dispatch);
        dispatch
    }

    /// Removes registrations of `event_type` (all types when `None`) for the
    /// query at `path`. The default query id addresses every query at the
    /// location. Idempotent.
    pub fn off(&mut self, path: &Path, query_id: &str, event_type: Option<EventType>) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let Some(idx) = self.locate(path) else {
            return dispatch;
        };
        let targets: Vec<String> = if query_id == DEFAULT_QUERY_ID {
            self.nodes[idx].views.keys().cloned().collect()
        } else {
            vec![query_id.to_string()]
        };
        for target in targets {
            let Some(view) = self.nodes[idx].views.get_mut(&target) else {
                continue;
            };
            let mut removed = Vec::new();
            view.registrations.retain(|r| {
                let hit = event_type.map_or(true, |t| r.listener.event_type == t);
                if hit {
                    removed.push(r.id);
                }
                !hit
            });
            for id in removed {
                self.locations.remove(&id);
            }
            self.drop_if_empty(idx, &target, &mut dispatch);
        }
        dispatch
    }

    fn drop_if_empty(&mut self, idx: usize, query_id: &str, dispatch: &mut Dispatch) {
        let empty = self.nodes[idx]
            .views
            .get(query_id)
            .is_some_and(|v| v.registrations.is_empty());
        if !empty {
            return;
        }
        if let Some(view) = self.nodes[idx].views.remove(query_id) {
            let path = self.nodes[idx].path.clone();
            if view.synced && view.query.loads_all_data() {
                self.complete_paths.remove(&path);
            }
            dispatch.unsubscribe.push(ViewKey {
                path,
                query: view.query,
            });
        }
        self.prune(idx);
    }

    /// Recomputes every view affected by a mutation at `path`.
    pub fn changed(&mut self, path: &Path, tree: &PathTree) -> Dispatch {
        let mut dispatch = Dispatch::default();
        for idx in self.affected(path) {
            let query_ids: Vec<String> = self.nodes[idx].views.keys().cloned().collect();
            for query_id in query_ids {
                dispatch.absorb(self.refresh_view(idx, &query_id, tree));
            }
        }
        self.forget_absent(path, tree);
        dispatch
    }

    /// Marks a view as holding the server's full data (subscription
    /// acknowledged) and fires its pending `value` event.
    pub fn view_synced(&mut self, path: &Path, query_id: &str, tree: &PathTree) -> Dispatch {
        let Some(idx) = self.locate(path) else {
            return Dispatch::default();
        };
        let Some(view) = self.nodes[idx].views.get_mut(query_id) else {
            return Dispatch::default();
        };
        view.synced = true;
        view.complete = true;
        if view.query.loads_all_data() {
            self.complete_paths.insert(path.clone());
        }
        self.refresh_view(idx, query_id, tree)
    }

    /// Forgets that views are synced, e.g. after the connection dropped.
    ///
    /// Local completeness from writes is kept.
    pub fn reset_sync(&mut self) {
        for node in &mut self.nodes {
            for view in node.views.values_mut() {
                if view.synced && view.query.loads_all_data() {
                    self.complete_paths.remove(&node.path);
                }
                view.synced = false;
            }
        }
    }

    /// Cancels the view for `query_id` at `path`: each registration's cancel
    /// callback runs once and the registrations are removed.
    pub fn cancel(&mut self, path: &Path, query_id: &str, error: &CoreError) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let Some(idx) = self.locate(path) else {
            return dispatch;
        };
        let Some(view) = self.nodes[idx].views.remove(query_id) else {
            return dispatch;
        };
        self.prune(idx);
        let mut silent = 0usize;
        for registration in view.registrations {
            self.locations.remove(&registration.id);
            match registration.listener.cancel {
                Some(cancel) => {
                    let error = error.clone();
                    dispatch.tasks.push(Box::new(move || cancel(&error)));
                }
                None => silent += 1,
            }
        }
        if silent > 0 {
            tracing::warn!(
                path = %path,
                query = query_id,
                listeners = silent,
                "listeners cancelled without a cancel callback: {error}"
            );
        }
        dispatch
    }

    fn refresh_view(&mut self, idx: usize, query_id: &str, tree: &PathTree) -> Dispatch {
        let mut dispatch = Dispatch::default();
        let path = self.nodes[idx].path.clone();
        let covered = self.is_covered(&path);
        let Some(view) = self.nodes[idx].views.get_mut(query_id) else {
            return dispatch;
        };
        if covered {
            view.complete = true;
        }

        let data = view.query.filter(&tree.get(&path));
        let order = view.query.order_by().clone();
        let data_changed = !Arc::ptr_eq(&data, &view.data) && *data != *view.data;

        let mut events = if data_changed {
            diff_children(&path, &order, &view.data, &data)
        } else {
            Vec::new()
        };
        if view.complete && (data_changed || !view.value_fired) {
            events.push(Event {
                event_type: EventType::Value,
                snapshot: Snapshot::with_order(path.clone(), Arc::clone(&data), order),
                prev_key: None,
            });
            view.value_fired = true;
        }
        view.data = data;

        let mut consumed = Vec::new();
        for event in events {
            for registration in &view.registrations {
                if registration.listener.event_type != event.event_type
                    || consumed.contains(&registration.id)
                {
                    continue;
                }
                dispatch
                    .tasks
                    .push(deliver(&registration.listener.callback, event.clone()));
                if registration.listener.once {
                    consumed.push(registration.id);
                }
            }
        }
        if !consumed.is_empty() {
            view.registrations.retain(|r| !consumed.contains(&r.id));
            for id in &consumed {
                self.locations.remove(id);
            }
            self.drop_if_empty(idx, query_id, &mut dispatch);
        }
        dispatch
    }
}

fn deliver(callback: &EventCallback, event: Event) -> Task {
    let callback = Arc::clone(callback);
    Box::new(move || callback(&event.snapshot, event.prev_key.as_deref()))
}

fn ordered(order: &OrderBy, node: &Node) -> Vec<(String, Arc<Node>)> {
    let mut children: Vec<(String, Arc<Node>)> = node
        .children()
        .map(|(k, n)| (k.to_string(), Arc::clone(n)))
        .collect();
    order.sort(&mut children);
    children
}

fn initial_events(path: &Path, view: &View) -> Vec<Event> {
    let order = view.query.order_by();
    let mut events = Vec::new();
    let mut prev: Option<String> = None;
    for (key, child) in ordered(order, &view.data) {
        events.push(Event {
            event_type: EventType::ChildAdded,
            snapshot: Snapshot::new(path.push_key(&key), child),
            prev_key: prev.clone(),
        });
        prev = Some(key);
    }
    if view.complete {
        events.push(Event {
            event_type: EventType::Value,
            snapshot: Snapshot::with_order(path.clone(), Arc::clone(&view.data), order.clone()),
            prev_key: None,
        });
    }
    events
}

fn prev_in(list: &[(String, Arc<Node>)], i: usize) -> Option<String> {
    i.checked_sub(1).map(|p| list[p].0.clone())
}

/// Child events turning `old` into `new`: removed, added, moved, changed.
fn diff_children(path: &Path, order: &OrderBy, old: &Node, new: &Node) -> Vec<Event> {
    let old_list = ordered(order, old);
    let new_list = ordered(order, new);
    let old_pos: HashMap<&str, usize> = old_list
        .iter()
        .enumerate()
        .map(|(i, (k, _))| (k.as_str(), i))
        .collect();
    let new_pos: HashMap<&str, usize> = new_list
        .iter()
        .enumerate()
        .map(|(i, (k, _))| (k.as_str(), i))
        .collect();

    let mut removed = Vec::new();
    for (key, child) in &old_list {
        if !new_pos.contains_key(key.as_str()) {
            removed.push(Event {
                event_type: EventType::ChildRemoved,
                snapshot: Snapshot::new(path.push_key(key), Arc::clone(child)),
                prev_key: None,
            });
        }
    }

    let mut added = Vec::new();
    let mut moved = Vec::new();
    let mut changed = Vec::new();
    for (i, (key, child)) in new_list.iter().enumerate() {
        let snapshot = Snapshot::new(path.push_key(key), Arc::clone(child));
        let prev_key = prev_in(&new_list, i);
        let Some(&j) = old_pos.get(key.as_str()) else {
            added.push(Event {
                event_type: EventType::ChildAdded,
                snapshot,
                prev_key,
            });
            continue;
        };
        let old_child = &old_list[j].1;
        if Arc::ptr_eq(old_child, child) || **old_child == **child {
            continue;
        }
        let reordered = order
            .compare((key.as_str(), old_child.as_ref()), (key.as_str(), child.as_ref()))
            .is_ne();
        if reordered && prev_in(&old_list, j) != prev_key {
            moved.push(Event {
                event_type: EventType::ChildMoved,
                snapshot: snapshot.clone(),
                prev_key: prev_key.clone(),
            });
        }
        changed.push(Event {
            event_type: EventType::ChildChanged,
            snapshot,
            prev_key,
        });
    }

    removed.extend(added);
    removed.extend(moved);
    removed.extend(changed);
    removed
}
