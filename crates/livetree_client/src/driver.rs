//! Tokio task that runs a [`Database`] against a [`Connector`].

use crate::database::Database;
use crate::transport::{Channel, Command, Connector};
use livetree_protocol::ServerMessage;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Background task executing a database's commands.
///
/// It opens connections, forwards messages both ways, sleeps through
/// reconnect delays, checks auth expiry and delivers callbacks. Dropping the
/// driver stops it.
#[derive(Debug)]
pub struct Driver {
    db: Database,
    handle: JoinHandle<()>,
}

impl Driver {
    /// Spawns the driver on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(db: Database, connector: Arc<dyn Connector>) -> Self {
        let handle = tokio::spawn(run(db.clone(), connector));
        Self { db, handle }
    }

    /// The driven database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Stops the driver. The transport is dropped, which the server sees as
    /// a disconnect.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

enum Wake {
    Notified,
    Inbound(Option<ServerMessage>),
    Reconnect,
    Tick,
}

async fn run(db: Database, connector: Arc<dyn Connector>) {
    let mut channel: Option<Channel> = None;
    let mut reconnect_at: Option<Instant> = None;
    let mut ticker = tokio::time::interval(db.config().expiry_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        for command in db.take_commands() {
            match command {
                Command::Connect => match connector.connect(db.url()).await {
                    Ok(opened) => {
                        channel = Some(opened);
                        db.handle_transport_open();
                    }
                    Err(error) => {
                        tracing::debug!("connect failed: {error}");
                        db.handle_transport_closed(&error.to_string());
                    }
                },
                Command::Send(message) => match &channel {
                    Some(open) => {
                        if open.outbound.send(message).is_err() {
                            channel = None;
                            db.handle_transport_closed("outbound channel closed");
                        }
                    }
                    None => tracing::debug!(message = message.name(), "no transport, dropping"),
                },
                Command::Disconnect => channel = None,
                Command::ScheduleReconnect(delay) => reconnect_at = Some(Instant::now() + delay),
            }
        }

        db.process_events();
        if db.has_commands() {
            continue;
        }

        let woke = {
            let inbound = async {
                match channel.as_mut() {
                    Some(open) => open.inbound.recv().await,
                    None => std::future::pending().await,
                }
            };
            let reconnect = async {
                match reconnect_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = db.wake().notified() => Wake::Notified,
                message = inbound => Wake::Inbound(message),
                _ = reconnect => Wake::Reconnect,
                _ = ticker.tick() => Wake::Tick,
            }
        };

        match woke {
            Wake::Notified => {}
            Wake::Inbound(Some(message)) => db.handle_message(message),
            Wake::Inbound(None) => {
                channel = None;
                db.handle_transport_closed("connection closed by server");
            }
            Wake::Reconnect => {
                reconnect_at = None;
                db.reconnect_now();
            }
            Wake::Tick => db.tick(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, RetryConfig};
    use crate::session::SessionState;
    use crate::transport::OfflineConnector;
    use std::time::Duration;

    #[tokio::test]
    async fn refused_connections_exhaust_retries() {
        let config = ClientConfig::new("https://demo.example.com").with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        );
        let db = Database::new(config);
        let root = db.root();
        let driver = Driver::spawn(db, Arc::new(OfflineConnector));

        let result = tokio::time::timeout(Duration::from_secs(5), root.set(1)).await;
        let err = result.expect("write should fail").unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(driver.database().state(), SessionState::Disconnected);
        driver.shutdown();
    }
}
