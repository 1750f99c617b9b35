//! Connection state machine.

use crate::config::RetryConfig;
use crate::error::{ClientError, ClientResult};
use crate::transport::Command;
use livetree_protocol::{ClientMessage, PROTOCOL_VERSION};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// The current state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport. A reconnect may be scheduled.
    Disconnected,
    /// Waiting for the transport to open.
    Connecting,
    /// Transport open, handshake sent.
    Connected,
    /// Handshake done, waiting for the auth result.
    Authenticating,
    /// Listening, writing and account requests flow.
    Ready,
}

impl SessionState {
    /// Returns true if requests can be sent.
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    /// Returns true if a transport is open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Authenticating | SessionState::Ready
        )
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened after the transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
    /// A reconnect was scheduled after the delay.
    Retry(Duration),
    /// The retry budget ran out; nothing is scheduled.
    Exhausted,
    /// Retrying is disabled (offline).
    Offline,
}

/// Connection lifecycle, request ids and the command outbox.
pub(crate) struct ConnectionSession {
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    retry: RetryConfig,
    attempts: u32,
    retry_enabled: bool,
    namespace: String,
    session_id: Option<String>,
    server_offset_ms: i64,
    next_request_id: u64,
    commands: Vec<Command>,
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .field("retry_enabled", &self.retry_enabled)
            .field("session_id", &self.session_id)
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl ConnectionSession {
    pub(crate) fn new(
        retry: RetryConfig,
        namespace: impl Into<String>,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let session = Self {
            state: SessionState::Disconnected,
            state_tx,
            retry,
            attempts: 0,
            retry_enabled: true,
            namespace: namespace.into(),
            session_id: None,
            server_offset_ms: 0,
            next_request_id: 1,
            commands: Vec::new(),
        };
        (session, state_rx)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "session state");
        self.state = state;
        self.state_tx.send_replace(state);
    }

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    pub(crate) fn send(&mut self, message: ClientMessage) {
        tracing::trace!(message = message.name(), "queue send");
        self.commands.push(Command::Send(message));
    }

    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub(crate) fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Starts a connection attempt.
    pub(crate) fn connect(&mut self) {
        self.set_state(SessionState::Connecting);
        self.commands.push(Command::Connect);
    }

    /// The transport opened: greet the server.
    pub(crate) fn on_open(&mut self) {
        self.set_state(SessionState::Connected);
        let namespace = self.namespace.clone();
        self.send(ClientMessage::Handshake {
            protocol_version: PROTOCOL_VERSION,
            namespace,
        });
    }

    /// The server accepted the handshake.
    pub(crate) fn on_welcome(
        &mut self,
        protocol_version: u16,
        session_id: String,
        server_time: u64,
        local_now: u64,
    ) -> ClientResult<()> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(ClientError::Protocol(format!(
                "server speaks protocol {protocol_version}, client speaks {PROTOCOL_VERSION}"
            )));
        }
        tracing::info!(session = %session_id, "connected");
        self.session_id = Some(session_id);
        self.server_offset_ms = i64::try_from(server_time)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(local_now).unwrap_or(i64::MAX));
        self.attempts = 0;
        Ok(())
    }

    /// The transport closed. Schedules a reconnect unless retrying is off or
    /// exhausted.
    pub(crate) fn on_closed(&mut self, reason: &str) -> CloseOutcome {
        self.set_state(SessionState::Disconnected);
        self.session_id = None;
        if !self.retry_enabled {
            tracing::debug!(reason, "connection closed while offline");
            return CloseOutcome::Offline;
        }
        self.attempts = self.attempts.saturating_add(1);
        if self.retry.is_exhausted(self.attempts) {
            self.retry_enabled = false;
            tracing::warn!(attempts = self.attempts, reason, "giving up reconnecting");
            return CloseOutcome::Exhausted;
        }
        let delay = self.retry.delay_for_attempt(self.attempts);
        tracing::info!(attempt = self.attempts, ?delay, reason, "scheduling reconnect");
        self.commands.push(Command::ScheduleReconnect(delay));
        CloseOutcome::Retry(delay)
    }

    /// Closes the transport from this side and reconnects right away.
    pub(crate) fn restart(&mut self) {
        self.commands.push(Command::Disconnect);
        self.set_state(SessionState::Disconnected);
        self.session_id = None;
        if self.retry_enabled {
            self.commands.push(Command::ScheduleReconnect(Duration::ZERO));
        }
    }

    /// Closes the transport and stops retrying.
    pub(crate) fn go_offline(&mut self) {
        self.retry_enabled = false;
        if self.state != SessionState::Disconnected {
            self.commands.push(Command::Disconnect);
            self.set_state(SessionState::Disconnected);
            self.session_id = None;
        }
    }

    /// Re-enables retrying and connects if needed.
    pub(crate) fn go_online(&mut self) {
        self.retry_enabled = true;
        self.attempts = 0;
        if self.state == SessionState::Disconnected {
            self.connect();
        }
    }

    /// Runs a scheduled reconnect. Ignored unless disconnected and retrying.
    pub(crate) fn reconnect_now(&mut self) {
        if self.state == SessionState::Disconnected && self.retry_enabled {
            self.connect();
        }
    }

    /// Local time corrected by the offset measured at the last welcome.
    pub(crate) fn server_now(&self, local_now: u64) -> u64 {
        let local = i64::try_from(local_now).unwrap_or(i64::MAX);
        u64::try_from(local.saturating_add(self.server_offset_ms)).unwrap_or(0)
    }
}
