//! Connection loss, reconnection and on-disconnect writes.

use livetree_client::{ClientError, EventType, Path, RetryConfig, SessionState, Value};
use livetree_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn path(text: &str) -> Path {
    Path::parse(text).unwrap()
}

#[test]
fn listeners_and_on_disconnect_survive_reconnects() {
    init_tracing();
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let db = link.database().clone();

    let recorder = Recorder::new();
    db.reference("room")
        .unwrap()
        .on(EventType::Value, recorder.callback(EventType::Value));
    let presence = db.reference("presence/ada").unwrap();
    let mut staged = presence.on_disconnect().set("offline");
    let _online = presence.set("online");
    link.pump();

    assert_eq!(staged.try_take(), Some(Ok(())));
    let first = link.session().unwrap();
    assert_eq!(server.count_received(first, "disconnect_action"), 1);
    assert_eq!(server.count_received(first, "subscribe"), 1);
    assert_eq!(server.value("presence/ada"), Value::from("online"));

    server.set_refusing(true);
    link.drop_connection();
    assert_eq!(db.state(), SessionState::Disconnected);
    assert_eq!(server.value("presence/ada"), Value::from("offline"));

    server.set("room", "changed while away").unwrap();
    server.set_refusing(false);
    link.reconnect();

    let second = link.session().unwrap();
    assert_ne!(first, second);
    assert_eq!(db.state(), SessionState::Ready);
    assert_eq!(server.count_received(second, "disconnect_action"), 1);
    assert_eq!(server.count_received(second, "subscribe"), 1);
    assert_eq!(
        server.staged_on_disconnect(second),
        vec![path("presence/ada")]
    );
    assert_eq!(
        recorder.values(),
        vec![Value::Null, Value::from("changed while away")]
    );

    // A second drop reconnects on its own and re-registers once more.
    link.drop_connection();
    let third = link.session().unwrap();
    assert_ne!(second, third);
    assert_eq!(server.count_received(third, "disconnect_action"), 1);
    assert_eq!(server.count_received(third, "subscribe"), 1);
    assert_eq!(recorder.len(), 2);
}

#[test]
fn consumed_on_disconnect_is_not_rearmed() {
    let server = LoopbackServer::shared();
    let config = default_config().with_rearm_on_disconnect(false);
    let mut link = LoopbackLink::connect_with(Arc::clone(&server), config);
    let db = link.database().clone();

    let _first = db.reference("a").unwrap().on_disconnect().set(1);
    link.pump();

    server.set_refusing(true);
    link.drop_connection();
    assert_eq!(server.value("a"), Value::from(1));

    let mut queued = db.reference("b").unwrap().on_disconnect().set(2);
    server.set_refusing(false);
    link.reconnect();

    let session = link.session().unwrap();
    assert_eq!(server.count_received(session, "disconnect_action"), 1);
    assert_eq!(server.staged_on_disconnect(session), vec![path("b")]);
    assert_eq!(queued.try_take(), Some(Ok(())));
}

#[test]
fn cancelled_on_disconnect_is_not_run() {
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let db = link.database().clone();

    let _a = db.reference("flags/a").unwrap().on_disconnect().set(true);
    let _b = db.reference("flags/b").unwrap().on_disconnect().remove();
    link.pump();
    let mut cancelled = db.reference("flags").unwrap().on_disconnect().cancel();
    link.pump();
    assert_eq!(cancelled.try_take(), Some(Ok(())));

    let session = link.session().unwrap();
    assert!(server.staged_on_disconnect(session).is_empty());
    link.drop_connection();
    assert_eq!(server.value("flags/a"), Value::Null);
    assert!(server
        .staged_on_disconnect(link.session().unwrap())
        .is_empty());
}

#[test]
fn offline_writes_flush_on_connect() {
    let server = LoopbackServer::shared();
    server.set_refusing(true);
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let db = link.database().clone();
    assert_eq!(db.state(), SessionState::Disconnected);

    let note = db.reference("notes/1").unwrap();
    let mut done = note.set("written offline");
    link.pump();
    assert_eq!(note.cached().value(), Value::from("written offline"));
    assert_eq!(db.pending_writes(), 1);
    assert_eq!(done.try_take(), None);

    server.set_refusing(false);
    link.reconnect();
    assert_eq!(done.try_take(), Some(Ok(())));
    assert_eq!(db.pending_writes(), 0);
    assert_eq!(server.value("notes/1"), Value::from("written offline"));
}

#[test]
fn go_offline_and_back_online() {
    let server = LoopbackServer::shared();
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    let db = link.database().clone();
    let _staged = db.reference("status").unwrap().on_disconnect().set("away");
    link.pump();

    db.go_offline();
    link.pump();
    assert!(server.sessions().is_empty());
    assert_eq!(server.value("status"), Value::from("away"));

    let mut done = db.reference("status").unwrap().set("back");
    link.pump();
    assert_eq!(done.try_take(), None);
    assert!(link.scheduled_delays().is_empty());

    db.go_online();
    link.pump();
    assert_eq!(db.state(), SessionState::Ready);
    assert_eq!(done.try_take(), Some(Ok(())));
    assert_eq!(server.value("status"), Value::from("back"));
}

#[test]
fn exhausted_retries_fail_pending_work() {
    let server = LoopbackServer::shared();
    server.set_refusing(true);
    let config = default_config().with_retry(
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
    );
    let mut link = LoopbackLink::connect_with(Arc::clone(&server), config);
    let db = link.database().clone();

    let mut write = db.reference("x").unwrap().set(1);
    let mut staged = db.reference("y").unwrap().on_disconnect().set(2);
    link.reconnect();

    assert_eq!(link.scheduled_delays(), &[Duration::from_millis(10)]);
    for result in [write.try_take(), staged.try_take()] {
        match result {
            Some(Err(ClientError::Transport { retryable, .. })) => assert!(!retryable),
            other => panic!("expected a fatal transport error, got {other:?}"),
        }
    }

    server.set_refusing(false);
    link.reconnect();
    assert_eq!(db.state(), SessionState::Disconnected);

    db.go_online();
    link.pump();
    assert_eq!(db.state(), SessionState::Ready);
}

#[test]
fn backoff_grows_between_attempts() {
    let server = LoopbackServer::shared();
    server.set_refusing(true);
    let mut link = LoopbackLink::connect(Arc::clone(&server));
    link.reconnect();
    link.reconnect();
    let delays = link.scheduled_delays().to_vec();
    assert_eq!(delays.len(), 3);
    assert!(delays[0] < delays[1] && delays[1] < delays[2]);
}
