//! End-to-end listener and write scenarios against the loopback server.

use livetree_client::{EventType, Value};
use livetree_testkit::prelude::*;
use std::sync::Arc;

fn some(key: &str) -> Option<String> {
    Some(key.to_string())
}

#[test]
fn value_listener_follows_set_update_remove() {
    init_tracing();
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let root = link.database().root();
    let recorder = Recorder::new();

    let mut set = root.set(Value::map([("a", 1)]));
    root.on(EventType::Value, recorder.callback(EventType::Value));
    link.pump();
    assert_eq!(set.try_take(), Some(Ok(())));
    assert_eq!(recorder.values(), vec![Value::map([("a", 1)])]);

    let mut update = root.update(Value::map([("b", 2)]));
    link.pump();
    assert_eq!(update.try_take(), Some(Ok(())));
    assert_eq!(
        recorder.values(),
        vec![Value::map([("a", 1)]), Value::map([("a", 1), ("b", 2)])]
    );

    let mut remove = root.remove();
    link.pump();
    assert_eq!(remove.try_take(), Some(Ok(())));
    assert_eq!(recorder.values().last(), Some(&Value::Null));
    assert_eq!(recorder.len(), 3);
    assert_eq!(server.value("/"), Value::Null);
}

#[test]
fn pushes_arrive_in_order_with_prev_keys() {
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let list = link.database().reference("list").unwrap();
    let recorder = Recorder::new();
    list.on(EventType::ChildAdded, recorder.callback(EventType::ChildAdded));
    link.pump();

    let (x, _x_done) = list.push("x");
    let (y, _y_done) = list.push("y");
    link.pump();

    let x_key = x.key().map(str::to_string);
    let y_key = y.key().map(str::to_string);
    assert!(x_key < y_key);
    assert_eq!(
        recorder.keys(),
        vec![
            (EventType::ChildAdded, x_key.clone(), None),
            (EventType::ChildAdded, y_key, x_key),
        ]
    );
    assert_eq!(
        recorder.values(),
        vec![Value::from("x"), Value::from("y")]
    );
    assert_eq!(server.value("list").as_map().map(|m| m.len()), Some(2));
}

#[test]
fn child_added_prev_keys_follow_key_order() {
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let list = link.database().reference("list").unwrap();
    let recorder = Recorder::new();
    list.on(EventType::ChildAdded, recorder.callback(EventType::ChildAdded));
    link.pump();

    for key in ["m", "n", "a", "5", "1", "3"] {
        let _done = list.child(key).unwrap().set(true);
        link.pump();
    }

    let added: Vec<(Option<String>, Option<String>)> = recorder
        .events()
        .into_iter()
        .map(|e| (e.key, e.prev_key))
        .collect();
    assert_eq!(
        added,
        vec![
            (some("m"), None),
            (some("n"), some("m")),
            (some("a"), None),
            (some("5"), None),
            (some("1"), None),
            (some("3"), some("1")),
        ]
    );

    let order: Vec<String> = list
        .cached()
        .children()
        .iter()
        .filter_map(|c| c.key().map(str::to_string))
        .collect();
    assert_eq!(order, vec!["1", "3", "5", "a", "m", "n"]);
}

#[test]
fn mutations_are_observed_in_order() {
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let counter = link.database().reference("counter").unwrap();
    let recorder = Recorder::new();
    counter.on(EventType::Value, recorder.callback(EventType::Value));
    link.pump();

    let _first = counter.set(1);
    let _second = counter.set(2);
    link.pump();

    assert_eq!(
        recorder.values(),
        vec![Value::Null, Value::from(1), Value::from(2)]
    );
    assert_eq!(server.value("counter"), Value::from(2));
}

#[test]
fn update_keeps_siblings_and_set_replaces() {
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let user = link.database().reference("users/ada").unwrap();

    let _set = user.set(Value::map([("name", "Ada"), ("lang", "en")]));
    let _update = user.update(Value::map([("lang", "fr")]));
    link.pump();
    assert_eq!(
        server.value("users/ada"),
        Value::map([("name", "Ada"), ("lang", "fr")])
    );

    let _replace = user.set(Value::map([("lang", "de")]));
    link.pump();
    assert_eq!(server.value("users/ada"), Value::map([("lang", "de")]));
    assert_eq!(user.cached().value(), Value::map([("lang", "de")]));
}

#[test]
fn other_clients_see_writes() {
    let server = LoopbackServer::shared();
    let mut alice = LoopbackLink::connect(Arc::clone(&server));
    let mut bob = LoopbackLink::connect(Arc::clone(&server));
    let recorder = Recorder::new();
    let room = bob.database().reference("rooms/lobby").unwrap();
    room.on(EventType::ChildAdded, recorder.callback(EventType::ChildAdded));
    room.on(EventType::ChildChanged, recorder.callback(EventType::ChildChanged));
    room.on(EventType::ChildRemoved, recorder.callback(EventType::ChildRemoved));
    pump_all(&mut [&mut alice, &mut bob]);

    let lobby = alice.database().reference("rooms/lobby").unwrap();
    let _hello = lobby.child("greeting").unwrap().set("hello");
    pump_all(&mut [&mut alice, &mut bob]);
    let _edit = lobby.child("greeting").unwrap().set("hi");
    pump_all(&mut [&mut alice, &mut bob]);
    let _gone = lobby.child("greeting").unwrap().remove();
    pump_all(&mut [&mut alice, &mut bob]);

    assert_eq!(
        recorder.keys(),
        vec![
            (EventType::ChildAdded, some("greeting"), None),
            (EventType::ChildChanged, some("greeting"), None),
            (EventType::ChildRemoved, some("greeting"), None),
        ]
    );
    assert_eq!(
        recorder.values(),
        vec![Value::from("hello"), Value::from("hi"), Value::from("hi")]
    );
}

#[test]
fn get_reads_from_the_server() {
    let server = LoopbackServer::shared();
    server
        .set("config", Value::map([("theme", "dark")]))
        .unwrap();
    let mut link = LoopbackLink::connect(Arc::clone(&server));

    let mut read = link.database().reference("config").unwrap().get();
    assert_eq!(read.try_take(), None);
    link.pump();
    let snapshot = read.try_take().unwrap().unwrap();
    assert_eq!(snapshot.value(), Value::map([("theme", "dark")]));
    assert!(server.listens(link.session().unwrap()).is_empty());
}

#[test]
fn limited_query_tracks_last_children() {
    let server = LoopbackServer::shared();
    for (key, score) in [("ann", 5), ("bob", 9), ("cy", 7)] {
        server
            .set(&format!("scores/{key}"), Value::from(score))
            .unwrap();
    }
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let scores = link.database().reference("scores").unwrap();
    let top = scores.order_by_value().unwrap().limit_to_last(2).unwrap();
    let recorder = Recorder::new();
    top.on(EventType::Value, recorder.callback(EventType::Value));
    link.pump();

    assert_eq!(
        recorder.values().last(),
        Some(&Value::map([("bob", 9), ("cy", 7)]))
    );

    server.set("scores/ann", Value::from(10)).unwrap();
    link.pump();
    assert_eq!(
        recorder.values().last(),
        Some(&Value::map([("ann", 10), ("bob", 9)]))
    );
}

#[test]
fn priorities_order_children() {
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let tasks = link.database().reference("tasks").unwrap();
    let _a = tasks.child("a").unwrap().set_with_priority("later", 2);
    let _b = tasks.child("b").unwrap().set_with_priority("sooner", 1);
    link.pump();

    let keys: Vec<String> = tasks
        .cached()
        .children()
        .iter()
        .filter_map(|c| c.key().map(str::to_string))
        .collect();
    assert_eq!(keys, vec!["b", "a"]);
    assert_eq!(
        server.export("tasks/b"),
        Value::map([(".priority", Value::from(1)), (".value", Value::from("sooner"))])
    );
}
