//! Location handles: [`Reference`], [`Query`] and [`OnDisconnect`].

use crate::completion::{Completion, Resolver};
use crate::database::Database;
use crate::error::{ClientError, ClientResult};
use livetree_codec::Value;
use livetree_core::{
    CancelCallback, CoreError, EventCallback, EventType, Listener, ListenerId, Node, Path,
    Priority, QueryParams, Snapshot, DEFAULT_QUERY_ID,
};
use livetree_protocol::WriteOp;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A location in the database.
///
/// References are cheap to clone and share the database's connection.
#[derive(Clone)]
pub struct Reference {
    db: Database,
    path: Path,
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reference").field(&self.to_url()).finish()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.db.url() == other.db.url()
    }
}

impl Reference {
    pub(crate) fn new(db: Database, path: Path) -> Self {
        Self { db, path }
    }

    /// The owning database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Location of this reference.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last key of the location, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.path.key()
    }

    /// Reference to a relative location, e.g. `"users/ada"`.
    pub fn child(&self, relative: &str) -> ClientResult<Reference> {
        Ok(Self::new(self.db.clone(), self.path.child(relative)?))
    }

    /// Reference to the parent location, `None` at the root.
    pub fn parent(&self) -> Option<Reference> {
        self.path
            .parent()
            .map(|path| Self::new(self.db.clone(), path))
    }

    /// Reference to the root location.
    pub fn root(&self) -> Reference {
        Self::new(self.db.clone(), Path::root())
    }

    /// Absolute URL of the location, keys percent-encoded.
    pub fn to_url(&self) -> String {
        format!("{}{}", self.db.url(), self.path.to_url_path())
    }

    /// Unfiltered query at this location.
    pub fn query(&self) -> Query {
        Query {
            reference: self.clone(),
            params: QueryParams::new(),
        }
    }

    // ----- queries -----

    /// Orders children by priority.
    pub fn order_by_priority(&self) -> ClientResult<Query> {
        self.query().order_by_priority()
    }

    /// Orders children by key.
    pub fn order_by_key(&self) -> ClientResult<Query> {
        self.query().order_by_key()
    }

    /// Orders children by value.
    pub fn order_by_value(&self) -> ClientResult<Query> {
        self.query().order_by_value()
    }

    /// Orders children by the value at a relative path below each child.
    pub fn order_by_child(&self, path: &str) -> ClientResult<Query> {
        self.query().order_by_child(path)
    }

    /// Keeps the first `n` children.
    pub fn limit_to_first(&self, n: u32) -> ClientResult<Query> {
        self.query().limit_to_first(n)
    }

    /// Keeps the last `n` children.
    pub fn limit_to_last(&self, n: u32) -> ClientResult<Query> {
        self.query().limit_to_last(n)
    }

    // ----- listeners -----

    /// Calls `callback` for every `event` at this location.
    pub fn on<F>(&self, event: EventType, callback: F) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
    {
        self.query().on(event, callback)
    }

    /// Like [`on`](Self::on); `cancel` runs once if the server stops serving
    /// the location, after which the listener is gone.
    pub fn on_with_cancel<F, C>(&self, event: EventType, callback: F, cancel: C) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
        C: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.query().on_with_cancel(event, callback, cancel)
    }

    /// Calls `callback` for the next `event` only.
    pub fn once<F>(&self, event: EventType, callback: F) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
    {
        self.query().once(event, callback)
    }

    /// Like [`once`](Self::once), with a cancel callback.
    pub fn once_with_cancel<F, C>(&self, event: EventType, callback: F, cancel: C) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
        C: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.query().once_with_cancel(event, callback, cancel)
    }

    /// Removes every `event` listener at this location, queries included.
    pub fn off(&self, event: EventType) {
        self.query().off(event);
    }

    /// Removes every listener at this location, queries included.
    pub fn off_all(&self) {
        self.query().off_all();
    }

    /// Removes one listener.
    pub fn off_listener(&self, id: ListenerId) {
        self.db.with_engine(|e| e.unregister(id));
    }

    /// Reads the value once, from the server when it is not cached.
    pub fn get(&self) -> Completion<Snapshot> {
        self.query().get()
    }

    /// Whatever the local cache holds now, complete or not.
    pub fn cached(&self) -> Snapshot {
        let path = self.path.clone();
        self.db.with_engine(|e| e.cached(&path))
    }

    // ----- writes -----

    /// Replaces the value at this location.
    pub fn set(&self, value: impl Into<Value>) -> Completion<()> {
        let value = value.into();
        self.db
            .with_engine(|e| e.write(&self.path, WriteOp::Set, value, "set"))
    }

    /// Replaces the value and priority at this location.
    pub fn set_with_priority(
        &self,
        value: impl Into<Value>,
        priority: impl Into<Value>,
    ) -> Completion<()> {
        match with_priority(&value.into(), &priority.into()) {
            Ok(payload) => self
                .db
                .with_engine(|e| e.write(&self.path, WriteOp::Set, payload, "set_with_priority")),
            Err(error) => Completion::failed("set_with_priority", error.into()),
        }
    }

    /// Replaces the priority at this location, keeping the cached value.
    pub fn set_priority(&self, priority: impl Into<Value>) -> Completion<()> {
        let priority = priority.into();
        self.db.with_engine(|e| e.set_priority(&self.path, &priority))
    }

    /// Writes each entry of `changes` (relative path to value) below this
    /// location, leaving other children alone.
    pub fn update(&self, changes: impl Into<Value>) -> Completion<()> {
        let changes = changes.into();
        self.db
            .with_engine(|e| e.write(&self.path, WriteOp::Update, changes, "update"))
    }

    /// Deletes the value at this location.
    pub fn remove(&self) -> Completion<()> {
        self.db
            .with_engine(|e| e.write(&self.path, WriteOp::Remove, Value::Null, "remove"))
    }

    /// Reference to a new child with a chronologically ordered unique key.
    pub fn push_ref(&self) -> Reference {
        let key = self.db.with_engine(|e| e.next_push_key());
        Self::new(self.db.clone(), self.path.push_key(&key))
    }

    /// Writes `value` to a new child with a chronologically ordered unique
    /// key. Returns the child's reference and the write's completion.
    pub fn push(&self, value: impl Into<Value>) -> (Reference, Completion<()>) {
        let child = self.push_ref();
        let done = child.set(value);
        (child, done)
    }

    /// Writes staged with the server for when this client disconnects.
    pub fn on_disconnect(&self) -> OnDisconnect {
        OnDisconnect {
            db: self.db.clone(),
            path: self.path.clone(),
        }
    }
}

fn with_priority(value: &Value, priority: &Value) -> Result<Value, CoreError> {
    let priority = Priority::from_value(priority)?;
    Ok(Node::from_value(value)?.with_priority(priority).export())
}

/// Ordered and filtered view of a location's children.
///
/// Builders return a new query and fail on conflicting constraints.
#[derive(Clone, Debug)]
pub struct Query {
    reference: Reference,
    params: QueryParams,
}

impl Query {
    /// The queried location.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Query criteria.
    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// Canonical identifier of the criteria.
    pub fn identifier(&self) -> String {
        self.params.identifier()
    }

    fn with(&self, params: Result<QueryParams, CoreError>) -> ClientResult<Query> {
        Ok(Query {
            reference: self.reference.clone(),
            params: params?,
        })
    }

    /// Orders children by priority.
    pub fn order_by_priority(&self) -> ClientResult<Query> {
        self.with(self.params.order_by_priority())
    }

    /// Orders children by key.
    pub fn order_by_key(&self) -> ClientResult<Query> {
        self.with(self.params.order_by_key())
    }

    /// Orders children by value.
    pub fn order_by_value(&self) -> ClientResult<Query> {
        self.with(self.params.order_by_value())
    }

    /// Orders children by the value at a relative path below each child.
    pub fn order_by_child(&self, path: &str) -> ClientResult<Query> {
        self.with(self.params.order_by_child(path))
    }

    /// Starts at `value` (and, on ties, at `key`).
    pub fn start_at(&self, value: impl Into<Value>, key: Option<&str>) -> ClientResult<Query> {
        self.with(self.params.start_at(value, key))
    }

    /// Ends at `value` (and, on ties, at `key`).
    pub fn end_at(&self, value: impl Into<Value>, key: Option<&str>) -> ClientResult<Query> {
        self.with(self.params.end_at(value, key))
    }

    /// Keeps children equal to `value`.
    pub fn equal_to(&self, value: impl Into<Value>, key: Option<&str>) -> ClientResult<Query> {
        self.with(self.params.equal_to(value, key))
    }

    /// Keeps the first `n` children.
    pub fn limit_to_first(&self, n: u32) -> ClientResult<Query> {
        self.with(self.params.limit_to_first(n))
    }

    /// Keeps the last `n` children.
    pub fn limit_to_last(&self, n: u32) -> ClientResult<Query> {
        self.with(self.params.limit_to_last(n))
    }

    fn listen(
        &self,
        event_type: EventType,
        callback: EventCallback,
        cancel: Option<CancelCallback>,
        once: bool,
    ) -> ListenerId {
        let listener = Listener {
            event_type,
            callback,
            cancel,
            once,
        };
        let path = &self.reference.path;
        self.reference
            .db
            .with_engine(|e| e.listen(path, &self.params, listener))
    }

    /// Calls `callback` for every `event` in this query.
    pub fn on<F>(&self, event: EventType, callback: F) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
    {
        self.listen(event, Arc::new(callback), None, false)
    }

    /// Like [`on`](Self::on), with a cancel callback.
    pub fn on_with_cancel<F, C>(&self, event: EventType, callback: F, cancel: C) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
        C: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.listen(event, Arc::new(callback), Some(client_cancel(cancel)), false)
    }

    /// Calls `callback` for the next `event` only.
    pub fn once<F>(&self, event: EventType, callback: F) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
    {
        self.listen(event, Arc::new(callback), None, true)
    }

    /// Like [`once`](Self::once), with a cancel callback.
    pub fn once_with_cancel<F, C>(&self, event: EventType, callback: F, cancel: C) -> ListenerId
    where
        F: Fn(&Snapshot, Option<&str>) + Send + Sync + 'static,
        C: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.listen(event, Arc::new(callback), Some(client_cancel(cancel)), true)
    }

    /// Removes `event` listeners of this query.
    ///
    /// On the unfiltered query this covers every query at the location.
    pub fn off(&self, event: EventType) {
        self.off_matching(Some(event));
    }

    /// Removes all listeners of this query.
    pub fn off_all(&self) {
        self.off_matching(None);
    }

    fn off_matching(&self, event: Option<EventType>) {
        let query_id = if self.params.is_default() {
            DEFAULT_QUERY_ID.to_string()
        } else {
            self.identifier()
        };
        let path = &self.reference.path;
        self.reference
            .db
            .with_engine(|e| e.off(path, &query_id, event));
    }

    /// Reads the query's value once.
    pub fn get(&self) -> Completion<Snapshot> {
        let (resolver, completion) = Completion::channel("get");
        let slot: Arc<Mutex<Option<Resolver<Snapshot>>>> = Arc::new(Mutex::new(Some(resolver)));
        let on_value = Arc::clone(&slot);
        let on_cancel = slot;
        self.listen(
            EventType::Value,
            Arc::new(move |snapshot: &Snapshot, _: Option<&str>| {
                if let Some(resolver) = on_value.lock().take() {
                    resolver.send(Ok(snapshot.clone()));
                }
            }),
            Some(Arc::new(move |error: &CoreError| {
                if let Some(resolver) = on_cancel.lock().take() {
                    resolver.send(Err(error.clone().into()));
                }
            })),
            true,
        );
        completion
    }
}

fn client_cancel<C>(cancel: C) -> CancelCallback
where
    C: Fn(&ClientError) + Send + Sync + 'static,
{
    Arc::new(move |error: &CoreError| cancel(&ClientError::from(error.clone())))
}

/// Writes the server runs at a location when this client disconnects.
///
/// Each location holds at most one staged write; staging again replaces it.
#[derive(Clone, Debug)]
pub struct OnDisconnect {
    db: Database,
    path: Path,
}

impl OnDisconnect {
    /// Stages replacing the value.
    pub fn set(&self, value: impl Into<Value>) -> Completion<()> {
        let value = value.into();
        self.db
            .with_engine(|e| e.on_disconnect_write(&self.path, WriteOp::Set, value))
    }

    /// Stages replacing the value and priority.
    pub fn set_with_priority(
        &self,
        value: impl Into<Value>,
        priority: impl Into<Value>,
    ) -> Completion<()> {
        match with_priority(&value.into(), &priority.into()) {
            Ok(payload) => self
                .db
                .with_engine(|e| e.on_disconnect_write(&self.path, WriteOp::Set, payload)),
            Err(error) => Completion::failed("on_disconnect", error.into()),
        }
    }

    /// Stages a merge of `changes` into the value.
    pub fn update(&self, changes: impl Into<Value>) -> Completion<()> {
        let changes = changes.into();
        self.db
            .with_engine(|e| e.on_disconnect_write(&self.path, WriteOp::Update, changes))
    }

    /// Stages removing the value.
    pub fn remove(&self) -> Completion<()> {
        self.db
            .with_engine(|e| e.on_disconnect_write(&self.path, WriteOp::Remove, Value::Null))
    }

    /// Drops staged writes at this location and below.
    pub fn cancel(&self) -> Completion<()> {
        self.db.with_engine(|e| e.cancel_on_disconnect(&self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Command;

    fn db() -> Database {
        let db = Database::from_url("https://demo.example.com");
        db.take_commands();
        db
    }

    #[test]
    fn navigation() {
        let db = db();
        let users = db.reference("users").unwrap();
        let ada = users.child("ada/profile").unwrap();
        assert_eq!(ada.key(), Some("profile"));
        assert_eq!(ada.parent().unwrap().key(), Some("ada"));
        assert_eq!(ada.root().path(), &Path::root());
        assert!(db.root().parent().is_none());
        assert!(users.child("bad.key").is_err());
    }

    #[test]
    fn urls() {
        let db = db();
        assert_eq!(db.root().to_url(), "https://demo.example.com/");
        let r = db.reference("/a b/c").unwrap();
        assert_eq!(r.to_string(), "https://demo.example.com/a%20b/c");
        assert_eq!(db.reference_from_url(&r.to_url()).unwrap(), r);
    }

    #[test]
    fn writes_apply_locally_while_offline() {
        let db = db();
        let r = db.reference("/a").unwrap();
        let _set = r.set(Value::map([("x", 1), ("y", 2)]));
        let _update = r.update(Value::map([("y", 3)]));
        assert_eq!(r.cached().value(), Value::map([("x", 1), ("y", 3)]));
        let _remove = r.child("x").unwrap().remove();
        assert_eq!(r.cached().value(), Value::map([("y", 3)]));
        assert_eq!(db.pending_writes(), 3);
    }

    #[test]
    fn update_requires_a_map() {
        let db = db();
        let mut done = db.root().update(5);
        assert!(matches!(done.try_take(), Some(Err(ClientError::Validation(_)))));
    }

    #[test]
    fn priority_round_trips_through_export() {
        let db = db();
        let r = db.reference("/p").unwrap();
        let _done = r.set_with_priority("v", 3);
        let snapshot = r.cached();
        assert_eq!(snapshot.value(), Value::from("v"));
        assert_eq!(snapshot.priority(), Some(&Priority::Number(3.0)));

        let _done = r.set_priority("z");
        assert_eq!(r.cached().priority(), Some(&Priority::Text("z".into())));
        assert_eq!(r.cached().value(), Value::from("v"));
    }

    #[test]
    fn push_keys_sort_in_call_order() {
        let db = db();
        let list = db.reference("/list").unwrap();
        let (a, _) = list.push("x");
        let (b, _) = list.push("y");
        assert!(a.key().unwrap() < b.key().unwrap());
        assert_eq!(a.parent().unwrap(), list);
    }

    #[test]
    fn get_resolves_from_complete_cache() {
        let db = db();
        let r = db.reference("/a").unwrap();
        let _set = r.set(1);
        let mut value = r.get();
        assert!(value.try_take().is_none());
        db.process_events();
        assert_eq!(value.try_take().unwrap().unwrap().value(), Value::from(1));
    }

    #[test]
    fn on_disconnect_queues_until_ready() {
        let db = db();
        let r = db.reference("/presence").unwrap();
        let _staged = r.on_disconnect().set("offline");
        assert!(!db
            .take_commands()
            .iter()
            .any(|c| matches!(c, Command::Send(_))));
        let mut cancelled = r.on_disconnect().cancel();
        db.process_events();
        assert_eq!(cancelled.try_take(), Some(Ok(())));
    }

    #[test]
    fn query_builders_validate() {
        let db = db();
        let r = db.reference("/scores").unwrap();
        let q = r.order_by_child("points").unwrap().limit_to_last(3).unwrap();
        assert_ne!(q.identifier(), r.query().identifier());
        assert!(q.limit_to_first(2).is_err());
        assert!(r.limit_to_first(0).is_err());
        assert!(r.order_by_key().unwrap().start_at(1, None).is_err());
    }
}
