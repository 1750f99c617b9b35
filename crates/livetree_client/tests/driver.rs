//! The tokio driver against an in-process server.

use livetree_client::{Database, Driver, SessionState, Value};
use livetree_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn spawn(server: &Arc<LoopbackServer>) -> Driver {
    let connector = Arc::new(LoopbackConnector::new(Arc::clone(server)));
    Driver::spawn(Database::new(default_config()), connector)
}

async fn wait_for(db: &Database, state: SessionState) {
    let mut states = db.watch_state();
    timeout(WAIT, states.wait_for(|current| *current == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

#[tokio::test]
async fn writes_complete_through_the_driver() {
    init_tracing();
    let server = LoopbackServer::shared();
    let driver = spawn(&server);
    let db = driver.database().clone();

    let done = db.reference("greeting").unwrap().set("hello");
    timeout(WAIT, done).await.unwrap().unwrap();
    assert_eq!(server.value("greeting"), Value::from("hello"));

    let other = spawn(&server);
    let read = other.database().reference("greeting").unwrap().get();
    let snapshot = timeout(WAIT, read).await.unwrap().unwrap();
    assert_eq!(snapshot.value(), Value::from("hello"));
}

#[tokio::test]
async fn driver_reconnects_after_server_drop() {
    let server = LoopbackServer::shared();
    let driver = spawn(&server);
    let db = driver.database().clone();
    wait_for(&db, SessionState::Ready).await;

    server.drop_all();
    let done = db.reference("after").unwrap().set(true);
    timeout(WAIT, done).await.unwrap().unwrap();
    assert_eq!(server.value("after"), Value::from(true));
    assert_eq!(server.sessions().len(), 1);
}

#[tokio::test]
async fn shutdown_runs_on_disconnect() {
    let server = LoopbackServer::shared();
    let driver = spawn(&server);
    let db = driver.database().clone();

    let staged = db.reference("status").unwrap().on_disconnect().set("gone");
    timeout(WAIT, staged).await.unwrap().unwrap();
    driver.shutdown();

    timeout(WAIT, async {
        while server.value("status") != Value::from("gone") {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("on-disconnect write did not run");
}
