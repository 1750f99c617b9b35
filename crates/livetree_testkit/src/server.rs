//! In-memory LiveTree server.
//!
//! Holds the authoritative tree, answers every client message the way a real
//! server would, and exposes knobs for tests: access rules, forced drops,
//! refusing connections and revoking auth or listens.

use crate::token::{Claims, TokenIssuer};
use livetree_client::{Clock, SystemClock};
use livetree_codec::Value;
use livetree_core::{resolve_merge, CoreError, Node, Path, PathTree};
use livetree_protocol::{
    AccountAction, AuthInfo, ClientMessage, Credential, ErrorBody, ErrorCode, PatchData,
    ServerMessage, WriteOp, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifies one connection to the server.
pub type SessionId = u64;

/// Server configuration.
#[derive(Clone)]
pub struct LoopbackConfig {
    /// Secret used to sign tokens. Presenting it as a token authenticates
    /// as `admin`.
    pub secret: String,
    /// Lifetime of issued tokens.
    pub token_ttl: Duration,
    /// Server clock.
    pub clock: Arc<dyn Clock>,
    /// Version announced in the welcome.
    pub protocol_version: u16,
}

impl std::fmt::Debug for LoopbackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConfig")
            .field("token_ttl", &self.token_ttl)
            .field("now_ms", &self.clock.now_ms())
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self::new("loopback-secret")
    }
}

impl LoopbackConfig {
    /// Creates a configuration signing with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            token_ttl: Duration::from_secs(3600),
            clock: Arc::new(SystemClock),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Sets the token lifetime.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Sets the server clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Announces a different protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }
}

struct Session {
    tx: mpsc::UnboundedSender<ServerMessage>,
    auth: Option<AuthInfo>,
    listens: BTreeSet<(Path, String)>,
    on_disconnect: BTreeMap<Path, (WriteOp, Value)>,
}

struct Account {
    uid: String,
    password: String,
}

#[derive(Default)]
struct ServerState {
    tree: PathTree,
    sessions: BTreeMap<SessionId, Session>,
    next_session: SessionId,
    refusing: bool,
    read_rules: Vec<Path>,
    write_rules: Vec<Path>,
    accounts: BTreeMap<String, Account>,
    next_uid: u64,
    password_resets: Vec<String>,
    received: Vec<(SessionId, ClientMessage)>,
}

impl ServerState {
    fn send(&self, session: SessionId, message: ServerMessage) {
        if let Some(entry) = self.sessions.get(&session) {
            // A dropped receiver means the client is gone; the close is
            // reported separately.
            let _ = entry.tx.send(message);
        }
    }

    fn read_denied(&self, path: &Path) -> bool {
        self.read_rules.iter().any(|rule| rule.contains(path))
    }

    fn write_denied(&self, path: &Path) -> bool {
        self.write_rules.iter().any(|rule| rule.contains(path))
    }

    fn apply_write(&mut self, path: &Path, op: WriteOp, payload: &Value) -> Result<(), ErrorBody> {
        let applied = match op {
            WriteOp::Set => self.tree.set_value(path, payload),
            WriteOp::Update => match payload.as_map() {
                Some(changes) => self.tree.merge(path, changes),
                None => Err(CoreError::invalid_payload("update payload must be a map")),
            },
            WriteOp::Remove => {
                self.tree.remove(path);
                Ok(())
            }
        };
        applied.map_err(invalid_request)?;
        self.broadcast(path, op, payload);
        Ok(())
    }

    /// Sends each listening session the data a write at `path` changed.
    fn broadcast(&self, path: &Path, op: WriteOp, payload: &Value) {
        let merge = match op {
            WriteOp::Update => payload.as_map(),
            _ => None,
        };
        for session in self.sessions.values() {
            for (path, data) in self.patches_for(session, path, merge) {
                let _ = session.tx.send(ServerMessage::Patch { path, data });
            }
        }
    }

    /// Sends `session` the authoritative data around `path`, overriding an
    /// optimistic write the server refused.
    fn resync(&self, session: SessionId, path: &Path) {
        let Some(entry) = self.sessions.get(&session) else {
            return;
        };
        for (path, data) in self.patches_for(entry, path, None) {
            let _ = entry.tx.send(ServerMessage::Patch { path, data });
        }
    }

    /// Patches a session needs after data at `path` changed. A merge is
    /// forwarded as is to listens at or above `path`.
    fn patches_for(
        &self,
        session: &Session,
        path: &Path,
        merge: Option<&BTreeMap<String, Value>>,
    ) -> BTreeMap<Path, PatchData> {
        let mut patches = BTreeMap::new();
        for (listened, _) in &session.listens {
            if listened.contains(path) {
                let data = match merge {
                    Some(changes) => PatchData::Merge(changes.clone()),
                    None => PatchData::Set(self.tree.get(path).export()),
                };
                patches.insert(path.clone(), data);
            } else if path.contains(listened) {
                patches.insert(
                    listened.clone(),
                    PatchData::Set(self.tree.get(listened).export()),
                );
            }
        }
        patches
    }

    /// Removes a session and runs its on-disconnect writes.
    fn end_session(&mut self, id: SessionId) -> bool {
        let Some(session) = self.sessions.remove(&id) else {
            return false;
        };
        for (path, (op, payload)) in session.on_disconnect {
            if let Err(error) = self.apply_write(&path, op, &payload) {
                tracing::warn!(session = id, path = %path, "on-disconnect write failed: {error}");
            }
        }
        tracing::debug!(session = id, "session ended");
        true
    }

    fn handle_account(&mut self, action: AccountAction) -> Result<Option<Value>, ErrorBody> {
        match action {
            AccountAction::CreateUser { email, password } => {
                if self.accounts.contains_key(&email) {
                    return Err(ErrorBody::new(
                        ErrorCode::UserExists,
                        format!("{email} is already registered"),
                    ));
                }
                self.next_uid += 1;
                let uid = format!("user-{}", self.next_uid);
                self.accounts.insert(
                    email,
                    Account {
                        uid: uid.clone(),
                        password,
                    },
                );
                Ok(Some(Value::map([("uid", uid)])))
            }
            AccountAction::RemoveUser { email, password } => {
                self.check_password(&email, &password)?;
                self.accounts.remove(&email);
                Ok(None)
            }
            AccountAction::ChangePassword {
                email,
                old_password,
                new_password,
            } => {
                self.check_password(&email, &old_password)?;
                if let Some(account) = self.accounts.get_mut(&email) {
                    account.password = new_password;
                }
                Ok(None)
            }
            AccountAction::SendPasswordReset { email } => {
                if !self.accounts.contains_key(&email) {
                    return Err(unknown_user(&email));
                }
                self.password_resets.push(email);
                Ok(None)
            }
        }
    }

    fn check_password(&self, email: &str, password: &str) -> Result<&Account, ErrorBody> {
        let account = self.accounts.get(email).ok_or_else(|| unknown_user(email))?;
        if account.password != password {
            return Err(ErrorBody::new(
                ErrorCode::InvalidCredentials,
                "the password is incorrect",
            ));
        }
        Ok(account)
    }
}

fn unknown_user(email: &str) -> ErrorBody {
    ErrorBody::new(ErrorCode::UnknownUser, format!("no account for {email}"))
}

fn invalid_request(error: CoreError) -> ErrorBody {
    ErrorBody::new(ErrorCode::InvalidRequest, error.to_string())
}

fn parse(path: &str) -> Path {
    Path::parse(path).expect("invalid path")
}

/// An authoritative LiveTree server living in the test process.
pub struct LoopbackServer {
    config: LoopbackConfig,
    tokens: TokenIssuer,
    state: Mutex<ServerState>,
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("config", &self.config)
            .field("sessions", &self.sessions())
            .finish_non_exhaustive()
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl LoopbackServer {
    /// Creates a server with an empty tree.
    pub fn new(config: LoopbackConfig) -> Self {
        let tokens = TokenIssuer::new(config.secret.clone());
        Self {
            config,
            tokens,
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Creates a shared server with the default configuration.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Server configuration.
    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    /// Server clock reading.
    pub fn now_ms(&self) -> u64 {
        self.config.clock.now_ms()
    }

    // ----- connections -----

    /// Accepts a connection. `None` while refusing connections.
    pub fn open_session(&self) -> Option<(SessionId, mpsc::UnboundedReceiver<ServerMessage>)> {
        let mut state = self.state.lock();
        if state.refusing {
            return None;
        }
        state.next_session += 1;
        let id = state.next_session;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            Session {
                tx,
                auth: None,
                listens: BTreeSet::new(),
                on_disconnect: BTreeMap::new(),
            },
        );
        tracing::debug!(session = id, "session opened");
        Some((id, rx))
    }

    /// The client closed its connection. Runs on-disconnect writes.
    pub fn close_session(&self, session: SessionId) {
        self.state.lock().end_session(session);
    }

    /// Drops a connection from the server side, as a network failure or
    /// server restart would. Runs on-disconnect writes.
    pub fn drop_session(&self, session: SessionId) {
        let mut state = self.state.lock();
        state.send(
            session,
            ServerMessage::Goodbye {
                reason: "connection dropped".into(),
            },
        );
        state.end_session(session);
    }

    /// Drops every open connection.
    pub fn drop_all(&self) {
        for session in self.sessions() {
            self.drop_session(session);
        }
    }

    /// Refuses (or accepts again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.state.lock().refusing = refusing;
    }

    /// Whether new connections are accepted.
    pub fn is_accepting(&self) -> bool {
        !self.state.lock().refusing
    }

    /// Open sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.state.lock().sessions.keys().copied().collect()
    }

    // ----- message handling -----

    /// Handles one message from `session`.
    pub fn receive(&self, session: SessionId, message: ClientMessage) {
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session) {
            tracing::debug!(session, message = message.name(), "message for closed session");
            return;
        }
        tracing::trace!(session, message = message.name(), "received");
        state.received.push((session, message.clone()));

        match message {
            ClientMessage::Handshake { .. } => {
                let welcome = ServerMessage::Welcome {
                    protocol_version: self.config.protocol_version,
                    session_id: format!("loopback-{session}"),
                    server_time: self.now_ms(),
                };
                state.send(session, welcome);
            }
            ClientMessage::Subscribe {
                request_id,
                path,
                query_id,
                ..
            } => {
                if state.read_denied(&path) {
                    let error = ErrorBody::permission_denied(format!("read denied at {path}"));
                    state.send(session, ServerMessage::ack_error(request_id, error));
                    return;
                }
                let data = PatchData::Set(state.tree.get(&path).export());
                if let Some(entry) = state.sessions.get_mut(&session) {
                    entry.listens.insert((path.clone(), query_id));
                }
                state.send(session, ServerMessage::Patch { path, data });
                state.send(session, ServerMessage::ack_ok(request_id));
            }
            ClientMessage::Unsubscribe { path, query_id } => {
                if let Some(entry) = state.sessions.get_mut(&session) {
                    entry.listens.remove(&(path, query_id));
                }
            }
            ClientMessage::Write {
                request_id,
                path,
                op,
                payload,
            } => {
                let outcome = if state.write_denied(&path) {
                    Err(ErrorBody::permission_denied(format!(
                        "write denied at {path}"
                    )))
                } else {
                    state.apply_write(&path, op, &payload)
                };
                match outcome {
                    Ok(()) => state.send(session, ServerMessage::ack_ok(request_id)),
                    Err(error) => {
                        state.send(session, ServerMessage::ack_error(request_id, error));
                        state.resync(session, &path);
                    }
                }
            }
            ClientMessage::Auth {
                request_id,
                credential,
            } => {
                let reply = match self.authenticate(&state, &credential) {
                    Ok(info) => {
                        if let Some(entry) = state.sessions.get_mut(&session) {
                            entry.auth = Some(info.clone());
                        }
                        ServerMessage::AuthResult {
                            request_id,
                            auth: Some(info),
                            error: None,
                        }
                    }
                    Err(error) => {
                        if let Some(entry) = state.sessions.get_mut(&session) {
                            entry.auth = None;
                        }
                        ServerMessage::AuthResult {
                            request_id,
                            auth: None,
                            error: Some(error),
                        }
                    }
                };
                state.send(session, reply);
            }
            ClientMessage::Unauth { request_id } => {
                if let Some(entry) = state.sessions.get_mut(&session) {
                    entry.auth = None;
                }
                if let Some(request_id) = request_id {
                    state.send(session, ServerMessage::ack_ok(request_id));
                }
            }
            ClientMessage::Account { request_id, action } => {
                let reply = match state.handle_account(action) {
                    Ok(data) => ServerMessage::Ack {
                        request_id,
                        status: livetree_protocol::AckStatus::Ok,
                        error: None,
                        data,
                    },
                    Err(error) => ServerMessage::ack_error(request_id, error),
                };
                state.send(session, reply);
            }
            ClientMessage::DisconnectAction {
                request_id,
                path,
                op,
                payload,
            } => {
                let reply = if state.write_denied(&path) {
                    ServerMessage::ack_error(
                        request_id,
                        ErrorBody::permission_denied(format!("write denied at {path}")),
                    )
                } else {
                    match validate_write(&path, op, &payload) {
                        Ok(()) => {
                            if let Some(entry) = state.sessions.get_mut(&session) {
                                entry.on_disconnect.insert(path, (op, payload));
                            }
                            ServerMessage::ack_ok(request_id)
                        }
                        Err(error) => ServerMessage::ack_error(request_id, error),
                    }
                };
                state.send(session, reply);
            }
            ClientMessage::CancelDisconnectAction { request_id, path } => {
                if let Some(entry) = state.sessions.get_mut(&session) {
                    entry.on_disconnect.retain(|staged, _| !path.contains(staged));
                }
                state.send(session, ServerMessage::ack_ok(request_id));
            }
        }
    }

    fn authenticate(
        &self,
        state: &ServerState,
        credential: &Credential,
    ) -> Result<AuthInfo, ErrorBody> {
        let now = self.now_ms();
        match credential {
            Credential::Token { token } if self.tokens.is_secret(token) => {
                Ok(self.issue("admin", "custom", None))
            }
            Credential::Token { token } => {
                let claims = self.tokens.verify(token, now).map_err(|code| {
                    ErrorBody::new(code, "the token was rejected")
                })?;
                Ok(AuthInfo {
                    uid: claims.uid,
                    provider: claims.provider,
                    token: token.clone(),
                    expires: claims.expires,
                    email: claims.email,
                })
            }
            Credential::Password { email, password } => {
                let account = state.check_password(email, password)?;
                Ok(self.issue(&account.uid, "password", Some(email.clone())))
            }
        }
    }

    fn issue(&self, uid: &str, provider: &str, email: Option<String>) -> AuthInfo {
        let expires = self.now_ms() + self.ttl_ms();
        let claims = Claims {
            uid: uid.to_string(),
            provider: provider.to_string(),
            expires,
            email: email.clone(),
        };
        AuthInfo {
            uid: uid.to_string(),
            provider: provider.to_string(),
            token: self.tokens.issue(&claims),
            expires,
            email,
        }
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.config.token_ttl.as_millis()).unwrap_or(u64::MAX)
    }

    // ----- tokens and accounts -----

    /// Issues a custom token for `uid` with the configured lifetime.
    pub fn issue_token(&self, uid: &str) -> String {
        self.issue(uid, "custom", None).token
    }

    /// Issues a custom token for `uid` expiring at `expires` (ms).
    pub fn issue_token_until(&self, uid: &str, expires: u64) -> String {
        self.tokens.issue(&Claims {
            uid: uid.to_string(),
            provider: "custom".to_string(),
            expires,
            email: None,
        })
    }

    /// Registers an email/password account. Returns its uid.
    pub fn add_user(&self, email: &str, password: &str) -> String {
        let mut state = self.state.lock();
        let created = state.handle_account(AccountAction::CreateUser {
            email: email.to_string(),
            password: password.to_string(),
        });
        match created {
            Ok(Some(data)) => data
                .get("uid")
                .and_then(Value::as_text)
                .unwrap_or_default()
                .to_string(),
            _ => state
                .accounts
                .get(email)
                .map(|a| a.uid.clone())
                .unwrap_or_default(),
        }
    }

    /// Whether an account exists for `email`.
    pub fn has_user(&self, email: &str) -> bool {
        self.state.lock().accounts.contains_key(email)
    }

    /// Whether `password` is the current password for `email`.
    pub fn password_matches(&self, email: &str, password: &str) -> bool {
        self.state.lock().check_password(email, password).is_ok()
    }

    /// Emails that asked for a password reset, in order.
    pub fn password_resets(&self) -> Vec<String> {
        self.state.lock().password_resets.clone()
    }

    /// Auth held by a session.
    pub fn session_auth(&self, session: SessionId) -> Option<AuthInfo> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .and_then(|s| s.auth.clone())
    }

    /// Invalidates a session's auth and tells the client.
    pub fn revoke_auth(&self, session: SessionId, code: ErrorCode) {
        let mut state = self.state.lock();
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.auth = None;
        }
        state.send(
            session,
            ServerMessage::AuthRevoked {
                reason: ErrorBody::new(code, "auth revoked by the server"),
            },
        );
    }

    // ----- access rules -----

    /// Denies reads at `prefix` and below. Listens already there are
    /// revoked.
    pub fn deny_read(&self, prefix: &str) {
        let prefix = parse(prefix);
        let mut state = self.state.lock();
        let mut revoked = Vec::new();
        for (id, session) in state.sessions.iter_mut() {
            let hit: Vec<(Path, String)> = session
                .listens
                .iter()
                .filter(|(path, _)| prefix.contains(path))
                .cloned()
                .collect();
            for key in hit {
                session.listens.remove(&key);
                revoked.push((*id, key));
            }
        }
        for (id, (path, query_id)) in revoked {
            let error = ErrorBody::permission_denied(format!("read denied at {path}"));
            state.send(
                id,
                ServerMessage::ListenRevoked {
                    path,
                    query_id,
                    error,
                },
            );
        }
        state.read_rules.push(prefix);
    }

    /// Denies writes at `prefix` and below.
    pub fn deny_write(&self, prefix: &str) {
        let prefix = parse(prefix);
        self.state.lock().write_rules.push(prefix);
    }

    /// Drops every access rule.
    pub fn allow_all(&self) {
        let mut state = self.state.lock();
        state.read_rules.clear();
        state.write_rules.clear();
    }

    // ----- data -----

    /// Plain value at `path`.
    pub fn value(&self, path: &str) -> Value {
        self.state.lock().tree.value(&parse(path))
    }

    /// Export form (with priorities) of the value at `path`.
    pub fn export(&self, path: &str) -> Value {
        self.state.lock().tree.get(&parse(path)).export()
    }

    /// Writes from the server side and notifies listeners.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<(), ErrorBody> {
        self.state
            .lock()
            .apply_write(&parse(path), WriteOp::Set, &value.into())
    }

    /// Merges from the server side and notifies listeners.
    pub fn update(&self, path: &str, changes: impl Into<Value>) -> Result<(), ErrorBody> {
        self.state
            .lock()
            .apply_write(&parse(path), WriteOp::Update, &changes.into())
    }

    // ----- inspection -----

    /// Every message received, in order.
    pub fn received(&self) -> Vec<(SessionId, ClientMessage)> {
        self.state.lock().received.clone()
    }

    /// How many messages called `name` a session sent.
    pub fn count_received(&self, session: SessionId, name: &str) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(id, m)| *id == session && m.name() == name)
            .count()
    }

    /// Locations a session listens to.
    pub fn listens(&self, session: SessionId) -> Vec<(Path, String)> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map(|s| s.listens.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Locations with on-disconnect writes staged by a session.
    pub fn staged_on_disconnect(&self, session: SessionId) -> Vec<Path> {
        self.state
            .lock()
            .sessions
            .get(&session)
            .map(|s| s.on_disconnect.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn validate_write(path: &Path, op: WriteOp, payload: &Value) -> Result<(), ErrorBody> {
    match op {
        WriteOp::Set => Node::from_value(payload).map(|_| ()),
        WriteOp::Update => match payload.as_map() {
            Some(changes) => resolve_merge(path, changes).map(|_| ()),
            None => Err(CoreError::invalid_payload("update payload must be a map")),
        },
        WriteOp::Remove => Ok(()),
    }
    .map_err(invalid_request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetree_client::ManualClock;
    use livetree_core::QueryParams;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn subscribe(request_id: u64, path: &str) -> ClientMessage {
        ClientMessage::Subscribe {
            request_id,
            path: p(path),
            query: QueryParams::new(),
            query_id: "default".into(),
        }
    }

    fn write(request_id: u64, path: &str, op: WriteOp, payload: Value) -> ClientMessage {
        ClientMessage::Write {
            request_id,
            path: p(path),
            op,
            payload,
        }
    }

    #[test]
    fn welcome_after_handshake() {
        let clock = Arc::new(ManualClock::new(5_000));
        let server = LoopbackServer::new(LoopbackConfig::default().with_clock(clock));
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(
            id,
            ClientMessage::Handshake {
                protocol_version: PROTOCOL_VERSION,
                namespace: "test".into(),
            },
        );
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Welcome {
                protocol_version: PROTOCOL_VERSION,
                session_id: format!("loopback-{id}"),
                server_time: 5_000,
            }]
        );
    }

    #[test]
    fn subscribe_sends_data_then_ack() {
        let server = LoopbackServer::default();
        server.set("a", Value::map([("x", 1)])).unwrap();
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(id, subscribe(1, "a"));
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], ServerMessage::Patch { path, .. } if *path == p("a")));
        assert_eq!(messages[1], ServerMessage::ack_ok(1));
    }

    #[test]
    fn writes_reach_listeners() {
        let server = LoopbackServer::default();
        let (listener, mut listener_rx) = server.open_session().unwrap();
        let (writer, mut writer_rx) = server.open_session().unwrap();
        server.receive(listener, subscribe(1, "room"));
        drain(&mut listener_rx);

        server.receive(writer, write(7, "room/msg", WriteOp::Set, Value::from("hi")));
        assert_eq!(drain(&mut writer_rx), vec![ServerMessage::ack_ok(7)]);
        assert_eq!(
            drain(&mut listener_rx),
            vec![ServerMessage::Patch {
                path: p("room/msg"),
                data: PatchData::Set(Value::from("hi")),
            }]
        );
        assert_eq!(server.value("room/msg"), Value::from("hi"));
    }

    #[test]
    fn write_above_listen_patches_listened_location() {
        let server = LoopbackServer::default();
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(id, subscribe(1, "a/b"));
        drain(&mut rx);
        server
            .set("a", Value::map([("b", Value::map([("c", 1)])), ("z", Value::from(2))]))
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Patch {
                path: p("a/b"),
                data: PatchData::Set(Value::map([("c", 1)])),
            }]
        );
    }

    #[test]
    fn denied_read_and_write() {
        let server = LoopbackServer::default();
        server.deny_read("secret");
        server.deny_write("locked");
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(id, subscribe(1, "secret/x"));
        server.receive(id, write(2, "locked", WriteOp::Set, Value::from(1)));
        let messages = drain(&mut rx);
        for (message, id) in messages.iter().zip([1, 2]) {
            match message {
                ServerMessage::Ack {
                    request_id, error, ..
                } => {
                    assert_eq!(*request_id, id);
                    assert_eq!(error.as_ref().unwrap().code, ErrorCode::PermissionDenied);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(server.value("locked"), Value::Null);
    }

    #[test]
    fn deny_read_revokes_existing_listens() {
        let server = LoopbackServer::default();
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(id, subscribe(1, "a/b"));
        drain(&mut rx);
        server.deny_read("a");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::ListenRevoked { path, .. }] if *path == p("a/b")
        ));
        assert!(server.listens(id).is_empty());
    }

    #[test]
    fn on_disconnect_runs_when_session_ends() {
        let server = LoopbackServer::default();
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(
            id,
            ClientMessage::DisconnectAction {
                request_id: 1,
                path: p("presence/ada"),
                op: WriteOp::Set,
                payload: Value::from("offline"),
            },
        );
        assert_eq!(drain(&mut rx), vec![ServerMessage::ack_ok(1)]);
        assert_eq!(server.staged_on_disconnect(id), vec![p("presence/ada")]);

        server.drop_session(id);
        assert_eq!(server.value("presence/ada"), Value::from("offline"));
        assert!(server.sessions().is_empty());
        assert!(matches!(drain(&mut rx).as_slice(), [ServerMessage::Goodbye { .. }]));
    }

    #[test]
    fn cancelled_on_disconnect_does_not_run() {
        let server = LoopbackServer::default();
        let (id, _rx) = server.open_session().unwrap();
        server.receive(
            id,
            ClientMessage::DisconnectAction {
                request_id: 1,
                path: p("a/b"),
                op: WriteOp::Set,
                payload: Value::from(1),
            },
        );
        server.receive(
            id,
            ClientMessage::CancelDisconnectAction {
                request_id: 2,
                path: p("a"),
            },
        );
        server.close_session(id);
        assert_eq!(server.value("a/b"), Value::Null);
    }

    #[test]
    fn refusing_connections() {
        let server = LoopbackServer::default();
        server.set_refusing(true);
        assert!(server.open_session().is_none());
        server.set_refusing(false);
        assert!(server.open_session().is_some());
    }

    #[test]
    fn password_and_token_auth() {
        let clock = Arc::new(ManualClock::new(1_000));
        let server = LoopbackServer::new(
            LoopbackConfig::default()
                .with_clock(clock.clone())
                .with_token_ttl(Duration::from_secs(10)),
        );
        let uid = server.add_user("ada@example.com", "pw");
        let (id, mut rx) = server.open_session().unwrap();

        server.receive(
            id,
            ClientMessage::Auth {
                request_id: 1,
                credential: Credential::Password {
                    email: "ada@example.com".into(),
                    password: "pw".into(),
                },
            },
        );
        let token = match drain(&mut rx).pop() {
            Some(ServerMessage::AuthResult {
                auth: Some(info), ..
            }) => {
                assert_eq!(info.uid, uid);
                assert_eq!(info.expires, 11_000);
                assert_eq!(info.email.as_deref(), Some("ada@example.com"));
                info.token
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(server.session_auth(id).map(|a| a.uid), Some(uid.clone()));

        server.receive(
            id,
            ClientMessage::Auth {
                request_id: 2,
                credential: Credential::Token {
                    token: token.clone(),
                },
            },
        );
        assert!(matches!(
            drain(&mut rx).pop(),
            Some(ServerMessage::AuthResult { auth: Some(_), .. })
        ));

        clock.advance(10_000);
        server.receive(
            id,
            ClientMessage::Auth {
                request_id: 3,
                credential: Credential::Token { token },
            },
        );
        match drain(&mut rx).pop() {
            Some(ServerMessage::AuthResult {
                error: Some(error), ..
            }) => assert_eq!(error.code, ErrorCode::ExpiredToken),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn secret_authenticates_as_admin() {
        let server = LoopbackServer::new(LoopbackConfig::new("s3cret"));
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(
            id,
            ClientMessage::Auth {
                request_id: 1,
                credential: Credential::Token {
                    token: "s3cret".into(),
                },
            },
        );
        match drain(&mut rx).pop() {
            Some(ServerMessage::AuthResult {
                auth: Some(info), ..
            }) => assert_eq!(info.uid, "admin"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn account_lifecycle() {
        let server = LoopbackServer::default();
        let (id, mut rx) = server.open_session().unwrap();
        let account = |request_id, action| ClientMessage::Account { request_id, action };

        server.receive(
            id,
            account(
                1,
                AccountAction::CreateUser {
                    email: "a@b.c".into(),
                    password: "one".into(),
                },
            ),
        );
        server.receive(
            id,
            account(
                2,
                AccountAction::CreateUser {
                    email: "a@b.c".into(),
                    password: "two".into(),
                },
            ),
        );
        server.receive(
            id,
            account(
                3,
                AccountAction::ChangePassword {
                    email: "a@b.c".into(),
                    old_password: "one".into(),
                    new_password: "two".into(),
                },
            ),
        );
        server.receive(
            id,
            account(
                4,
                AccountAction::SendPasswordReset {
                    email: "a@b.c".into(),
                },
            ),
        );
        server.receive(
            id,
            account(
                5,
                AccountAction::RemoveUser {
                    email: "a@b.c".into(),
                    password: "one".into(),
                },
            ),
        );

        let codes: Vec<Option<ErrorCode>> = drain(&mut rx)
            .into_iter()
            .map(|m| match m {
                ServerMessage::Ack { error, .. } => error.map(|e| e.code),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                None,
                Some(ErrorCode::UserExists),
                None,
                None,
                Some(ErrorCode::InvalidCredentials),
            ]
        );
        assert!(server.password_matches("a@b.c", "two"));
        assert_eq!(server.password_resets(), vec!["a@b.c".to_string()]);
    }

    #[test]
    fn invalid_update_is_rejected() {
        let server = LoopbackServer::default();
        let (id, mut rx) = server.open_session().unwrap();
        server.receive(id, write(1, "a", WriteOp::Update, Value::from(3)));
        match drain(&mut rx).pop() {
            Some(ServerMessage::Ack {
                error: Some(error), ..
            }) => assert_eq!(error.code, ErrorCode::InvalidRequest),
            other => panic!("unexpected {other:?}"),
        }
    }
}
