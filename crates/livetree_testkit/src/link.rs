//! Synchronous pump between a client and a [`LoopbackServer`].
//!
//! The link runs a client's commands against the server and feeds the
//! replies back until nothing moves. Tests stay single-threaded and
//! deterministic: every step happens inside [`LoopbackLink::pump`].

use crate::server::{LoopbackServer, SessionId};
use livetree_client::{ClientConfig, Command, Database, RetryConfig};
use livetree_protocol::ServerMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// URL clients use to address the loopback server.
pub const LOOPBACK_URL: &str = "https://loopback.test";

/// Connects one [`Database`] to a [`LoopbackServer`].
#[derive(Debug)]
pub struct LoopbackLink {
    db: Database,
    server: Arc<LoopbackServer>,
    session: Option<(SessionId, mpsc::UnboundedReceiver<ServerMessage>)>,
    auto_reconnect: bool,
    scheduled: Vec<Duration>,
}

impl LoopbackLink {
    /// Links `db` to `server`. Nothing happens until [`pump`](Self::pump).
    pub fn new(db: Database, server: Arc<LoopbackServer>) -> Self {
        Self {
            db,
            server,
            session: None,
            auto_reconnect: true,
            scheduled: Vec::new(),
        }
    }

    /// Creates a client for `server` with a deterministic retry policy and
    /// pumps it until it settles.
    pub fn connect(server: Arc<LoopbackServer>) -> Self {
        Self::connect_with(server, default_config())
    }

    /// Like [`connect`](Self::connect) with a custom configuration.
    pub fn connect_with(server: Arc<LoopbackServer>, config: ClientConfig) -> Self {
        let mut link = Self::new(Database::new(config), server);
        link.pump();
        link
    }

    /// The linked client.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The server.
    pub fn server(&self) -> &Arc<LoopbackServer> {
        &self.server
    }

    /// Server-side id of the open connection.
    pub fn session(&self) -> Option<SessionId> {
        self.session.as_ref().map(|(id, _)| *id)
    }

    /// Whether scheduled reconnects run immediately (the default). When
    /// off they are only recorded; call [`reconnect`](Self::reconnect).
    pub fn set_auto_reconnect(&mut self, auto: bool) {
        self.auto_reconnect = auto;
    }

    /// Delays of every reconnect the client scheduled, in order.
    pub fn scheduled_delays(&self) -> &[Duration] {
        &self.scheduled
    }

    /// Runs a scheduled reconnect now and pumps.
    pub fn reconnect(&mut self) -> usize {
        self.db.reconnect_now();
        self.pump()
    }

    /// Drops the connection from the server side and pumps.
    pub fn drop_connection(&mut self) -> usize {
        if let Some(id) = self.session() {
            self.server.drop_session(id);
        }
        self.pump()
    }

    /// Moves commands, messages and callbacks until nothing is left.
    /// Returns the number of steps taken.
    pub fn pump(&mut self) -> usize {
        let mut steps = 0;
        while self.step() {
            steps += 1;
        }
        steps
    }

    fn step(&mut self) -> bool {
        let mut progress = false;

        for command in self.db.take_commands() {
            progress = true;
            self.execute(command);
        }

        let mut inbound = Vec::new();
        let mut closed = false;
        if let Some((_, rx)) = self.session.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(message) => inbound.push(message),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        for message in inbound {
            progress = true;
            self.db.handle_message(message);
        }
        if closed {
            progress = true;
            self.session = None;
            self.db.handle_transport_closed("connection closed by server");
        }

        if self.db.process_events() > 0 {
            progress = true;
        }
        progress
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect => match self.server.open_session() {
                Some(session) => {
                    self.session = Some(session);
                    self.db.handle_transport_open();
                }
                None => self.db.handle_transport_closed("connection refused"),
            },
            Command::Send(message) => match self.session() {
                Some(id) => self.server.receive(id, message),
                None => tracing::debug!(message = message.name(), "send without a connection"),
            },
            Command::Disconnect => {
                if let Some((id, _)) = self.session.take() {
                    self.server.close_session(id);
                }
            }
            Command::ScheduleReconnect(delay) => {
                self.scheduled.push(delay);
                if self.auto_reconnect && self.server.is_accepting() {
                    self.db.reconnect_now();
                }
            }
        }
    }
}

/// Pumps several links until none of them moves.
pub fn pump_all(links: &mut [&mut LoopbackLink]) -> usize {
    let mut total = 0;
    loop {
        let steps: usize = links.iter_mut().map(|link| link.pump()).sum();
        if steps == 0 {
            return total;
        }
        total += steps;
    }
}

/// Client configuration for loopback tests: no jitter, short delays.
pub fn default_config() -> ClientConfig {
    ClientConfig::new(LOOPBACK_URL).with_retry(
        RetryConfig::unlimited()
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetree_client::SessionState;

    #[test]
    fn connect_reaches_ready() {
        let server = LoopbackServer::shared();
        let link = LoopbackLink::connect(Arc::clone(&server));
        assert_eq!(link.database().state(), SessionState::Ready);
        assert_eq!(server.sessions(), vec![link.session().unwrap()]);
        assert_eq!(
            link.database().session_id(),
            Some(format!("loopback-{}", link.session().unwrap()))
        );
    }

    #[test]
    fn refused_connection_schedules_retry() {
        let server = LoopbackServer::shared();
        server.set_refusing(true);
        let link = LoopbackLink::connect(Arc::clone(&server));
        assert_eq!(link.database().state(), SessionState::Disconnected);
        assert_eq!(link.scheduled_delays().len(), 1);
        assert!(link.session().is_none());
    }

    #[test]
    fn server_drop_reconnects() {
        let server = LoopbackServer::shared();
        let mut link = LoopbackLink::connect(Arc::clone(&server));
        let first = link.session().unwrap();
        link.drop_connection();
        let second = link.session().unwrap();
        assert_ne!(first, second);
        assert_eq!(link.database().state(), SessionState::Ready);
    }

    #[test]
    fn go_offline_closes_session() {
        let server = LoopbackServer::shared();
        let mut link = LoopbackLink::connect(Arc::clone(&server));
        link.database().go_offline();
        link.pump();
        assert!(server.sessions().is_empty());
        link.database().go_online();
        link.pump();
        assert_eq!(server.sessions().len(), 1);
    }
}
