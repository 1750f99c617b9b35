//! The single owner of all client state.
//!
//! Every caller operation and every inbound message is applied to the
//! [`Engine`] under one lock. It mutates the cache, records outbound
//! [`Command`]s and collects callback [`Task`]s; it never performs I/O and
//! never runs a callback itself.

use crate::auth::{AuthCancelCallback, AuthState, PendingAuth, SessionStore};
use crate::clock::Clock;
use crate::completion::{Completion, Resolver};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::on_disconnect::OnDisconnectRegistry;
use crate::push_id::PushIdGenerator;
use crate::session::{CloseOutcome, ConnectionSession, SessionState};
use crate::transport::Command;
use crate::writes::WriteCoordinator;
use livetree_codec::Value;
use livetree_core::{
    resolve_merge, CoreError, Dispatch, EventDispatcher, EventType, Listener, ListenerId, Node,
    Path, PathTree, Priority, QueryParams, Snapshot, Task, ViewKey,
};
use livetree_protocol::{
    AccountAction, AckStatus, AuthInfo, ClientMessage, Credential, ErrorBody, ErrorCode,
    PatchData, ServerMessage, WriteOp,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

/// How an account request reports success.
pub(crate) enum AccountReply {
    /// Resolves with the uid in the acknowledgement data.
    Uid(Resolver<String>),
    /// Resolves with nothing.
    Done(Resolver<()>),
}

impl AccountReply {
    fn into_task(self, outcome: Result<Option<Value>, ClientError>) -> Task {
        match self {
            AccountReply::Uid(resolver) => {
                let uid = outcome.and_then(|data| {
                    data.as_ref()
                        .and_then(|d| d.get("uid"))
                        .and_then(Value::as_text)
                        .map(str::to_string)
                        .ok_or_else(|| ClientError::Protocol("account reply without uid".into()))
                });
                resolver.into_task(uid)
            }
            AccountReply::Done(resolver) => resolver.into_task(outcome.map(|_| ())),
        }
    }
}

struct AccountRequest {
    action: AccountAction,
    sent: bool,
    reply: AccountReply,
}

/// Client state machine.
pub(crate) struct Engine {
    clock: Arc<dyn Clock>,
    store: Arc<dyn SessionStore>,
    session: ConnectionSession,
    tree: PathTree,
    events: EventDispatcher,
    writes: WriteCoordinator,
    on_disconnect: OnDisconnectRegistry,
    auth: AuthState,
    accounts: BTreeMap<u64, AccountRequest>,
    listens: HashMap<u64, ViewKey>,
    push_ids: PushIdGenerator,
    tasks: Vec<Task>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session", &self.session)
            .field("auth", &self.auth)
            .field("pending_writes", &self.writes.len())
            .field("on_disconnect", &self.on_disconnect.len())
            .field("listeners", &self.events.listener_count())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub(crate) fn new(config: &ClientConfig) -> (Self, watch::Receiver<SessionState>) {
        let (session, state_rx) =
            ConnectionSession::new(config.retry.clone(), config.namespace());
        let engine = Self {
            clock: Arc::clone(&config.clock),
            store: Arc::clone(&config.session_store),
            session,
            tree: PathTree::new(),
            events: EventDispatcher::new(),
            writes: WriteCoordinator::default(),
            on_disconnect: OnDisconnectRegistry::new(config.rearm_on_disconnect),
            auth: AuthState::default(),
            accounts: BTreeMap::new(),
            listens: HashMap::new(),
            push_ids: PushIdGenerator::new(),
            tasks: Vec::new(),
        };
        (engine, state_rx)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.session.state()
    }

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session.session_id()
    }

    pub(crate) fn auth_info(&self) -> Option<AuthInfo> {
        self.auth.current.clone()
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub(crate) fn cached(&self, path: &Path) -> Snapshot {
        Snapshot::new(path.clone(), self.tree.get(path))
    }

    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        self.session.take_commands()
    }

    pub(crate) fn has_commands(&self) -> bool {
        self.session.has_commands()
    }

    pub(crate) fn take_tasks(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.tasks)
    }

    // ----- connection -----

    pub(crate) fn start(&mut self) {
        self.session.connect();
    }

    pub(crate) fn go_online(&mut self) {
        self.session.go_online();
    }

    pub(crate) fn go_offline(&mut self) {
        if self.session.state() != SessionState::Disconnected {
            self.connection_lost();
        }
        self.session.go_offline();
    }

    pub(crate) fn reconnect_now(&mut self) {
        self.session.reconnect_now();
    }

    pub(crate) fn tick(&mut self) {
        self.check_expiry();
    }

    pub(crate) fn handle_transport_open(&mut self) {
        if self.session.state() != SessionState::Connecting {
            tracing::debug!(state = %self.session.state(), "ignoring unexpected transport open");
            return;
        }
        self.session.on_open();
    }

    pub(crate) fn handle_transport_closed(&mut self, reason: &str) {
        if self.session.state() == SessionState::Disconnected {
            return;
        }
        self.connection_lost();
        if self.session.on_closed(reason) == CloseOutcome::Exhausted {
            let error = ClientError::transport_fatal(format!(
                "server unreachable after {} attempts",
                self.session.attempts()
            ));
            self.fail_pending(&error);
        }
    }

    /// Forgets everything tied to the dropped connection.
    fn connection_lost(&mut self) {
        self.events.reset_sync();
        self.writes.mark_unsent();
        self.tasks.extend(self.on_disconnect.reset());
        self.listens.clear();
        self.auth.in_flight = None;

        let sent: Vec<u64> = self
            .accounts
            .iter()
            .filter(|(_, request)| request.sent)
            .map(|(&id, _)| id)
            .collect();
        for id in sent {
            if let Some(request) = self.accounts.remove(&id) {
                let error = ClientError::transport_retryable("connection lost before reply");
                self.tasks.push(request.reply.into_task(Err(error)));
            }
        }
        // The server's session is gone, and with it its authentication.
        for (_, resolver) in std::mem::take(&mut self.auth.logouts) {
            self.tasks.push(resolver.into_task(Ok(())));
        }
    }

    /// Fails every operation still waiting for the server.
    fn fail_pending(&mut self, error: &ClientError) {
        self.tasks.extend(self.writes.fail_all(error));
        self.tasks.extend(self.on_disconnect.fail_pending(error));
        for (_, request) in std::mem::take(&mut self.accounts) {
            self.tasks.push(request.reply.into_task(Err(error.clone())));
        }
        if let Some(pending) = self.auth.pending.take() {
            self.tasks.push(pending.resolver.into_task(Err(error.clone())));
        }
    }

    fn on_ready(&mut self) {
        for view in self.events.views() {
            self.send_listen(view);
        }
        let session = &mut self.session;
        for message in self.on_disconnect.take_unsent(|| session.next_request_id()) {
            self.session.send(message);
        }
        self.flush_writes();
        self.flush_accounts();
    }

    fn flush_writes(&mut self) {
        for message in self.writes.take_unsent() {
            self.session.send(message);
        }
    }

    fn flush_accounts(&mut self) {
        for (&request_id, request) in self.accounts.iter_mut().filter(|(_, r)| !r.sent) {
            request.sent = true;
            self.session.send(ClientMessage::Account {
                request_id,
                action: request.action.clone(),
            });
        }
    }

    fn send_listen(&mut self, view: ViewKey) {
        let request_id = self.session.next_request_id();
        let query_id = view.query_id();
        self.session.send(ClientMessage::Subscribe {
            request_id,
            path: view.path.clone(),
            query: view.query.clone(),
            query_id,
        });
        self.listens.insert(request_id, view);
    }

    fn absorb(&mut self, dispatch: Dispatch) {
        self.tasks.extend(dispatch.tasks);
        let ready = self.session.state().is_ready();
        for view in dispatch.subscribe {
            if ready {
                self.send_listen(view);
            }
        }
        for view in dispatch.unsubscribe {
            let query_id = view.query_id();
            self.listens
                .retain(|_, listen| !(listen.path == view.path && listen.query_id() == query_id));
            if ready {
                self.session.send(ClientMessage::Unsubscribe {
                    path: view.path,
                    query_id,
                });
            }
        }
    }

    // ----- inbound -----

    pub(crate) fn handle_message(&mut self, message: ServerMessage) {
        let state = self.session.state();
        if !state.is_connected() {
            tracing::debug!(
                message = message.name(),
                %state,
                "dropping message while not connected"
            );
            return;
        }
        tracing::trace!(message = message.name(), "received");
        match message {
            ServerMessage::Welcome {
                protocol_version,
                session_id,
                server_time,
            } => self.on_welcome(protocol_version, session_id, server_time),
            ServerMessage::Ack {
                request_id,
                status,
                error,
                data,
            } => {
                let outcome = match status {
                    AckStatus::Ok => Ok(data),
                    AckStatus::Error => Err(error.unwrap_or_else(|| {
                        ErrorBody::new(ErrorCode::Internal, "request failed")
                    })),
                };
                self.on_ack(request_id, outcome);
            }
            ServerMessage::Patch { path, data } => self.apply_patch(&path, data),
            ServerMessage::AuthResult {
                request_id,
                auth,
                error,
            } => self.on_auth_result(request_id, auth, error),
            ServerMessage::AuthRevoked { reason } => {
                tracing::info!(reason = %reason, "authentication revoked by server");
                let cancel = self.auth.clear_session();
                self.store.clear();
                self.fire_auth_cancel(cancel, ClientError::from_body(reason, &Path::root()));
            }
            ServerMessage::ListenRevoked {
                path,
                query_id,
                error,
            } => {
                self.listens
                    .retain(|_, listen| !(listen.path == path && listen.query_id() == query_id));
                self.cancel_view(&path, &query_id, &error);
            }
            ServerMessage::Goodbye { reason } => {
                tracing::info!(reason = %reason, "server closing connection");
            }
        }
    }

    fn on_welcome(&mut self, protocol_version: u16, session_id: String, server_time: u64) {
        if self.session.state() != SessionState::Connected {
            tracing::warn!(state = %self.session.state(), "unexpected welcome");
            return;
        }
        let now = self.clock.now_ms();
        if let Err(error) = self
            .session
            .on_welcome(protocol_version, session_id, server_time, now)
        {
            tracing::error!("{error}");
            self.connection_lost();
            self.session.go_offline();
            self.fail_pending(&error);
            return;
        }
        self.check_expiry();
        if self.auth.wants_auth() {
            self.session.set_state(SessionState::Authenticating);
            self.send_auth();
        } else {
            self.session.set_state(SessionState::Ready);
            self.on_ready();
        }
    }

    fn on_ack(&mut self, request_id: u64, outcome: Result<Option<Value>, ErrorBody>) {
        if let Some(write) = self.writes.acknowledge(request_id) {
            let result = match outcome {
                Ok(_) => {
                    tracing::debug!(
                        request_id,
                        path = %write.path,
                        op = write.op.as_str(),
                        "write acknowledged"
                    );
                    Ok(())
                }
                Err(body) => {
                    tracing::warn!(
                        request_id,
                        path = %write.path,
                        op = write.op.as_str(),
                        "write failed: {body}"
                    );
                    Err(ClientError::from_body(body, &write.path))
                }
            };
            self.tasks.push(write.resolver.into_task(result));
        } else if self.on_disconnect.owns_request(request_id) {
            let tasks = self
                .on_disconnect
                .acknowledge(request_id, outcome.map(|_| ()));
            self.tasks.extend(tasks);
        } else if let Some(view) = self.listens.remove(&request_id) {
            let query_id = view.query_id();
            match outcome {
                Ok(_) => {
                    let dispatch = self.events.view_synced(&view.path, &query_id, &self.tree);
                    self.absorb(dispatch);
                }
                Err(body) => self.cancel_view(&view.path, &query_id, &body),
            }
        } else if let Some(request) = self.accounts.remove(&request_id) {
            let outcome = outcome.map_err(|body| ClientError::from_body(body, &Path::root()));
            self.tasks.push(request.reply.into_task(outcome));
        } else if let Some(resolver) = self.auth.logouts.remove(&request_id) {
            let outcome = outcome
                .map(|_| ())
                .map_err(|body| ClientError::from_body(body, &Path::root()));
            self.tasks.push(resolver.into_task(outcome));
        } else {
            tracing::debug!(request_id, "ack for unknown request");
        }
    }

    fn cancel_view(&mut self, path: &Path, query_id: &str, body: &ErrorBody) {
        tracing::warn!(path = %path, query = query_id, "listen cancelled: {body}");
        let error = CoreError::permission_denied(path.to_string(), body.to_string());
        let dispatch = self.events.cancel(path, query_id, &error);
        self.absorb(dispatch);
    }

    /// Server data replaces the cached state. Writes still awaiting their
    /// acknowledgement are layered back on top, so the server wins once it
    /// has answered them.
    fn apply_patch(&mut self, path: &Path, data: PatchData) {
        let applied = match &data {
            PatchData::Set(value) => self.tree.set_value(path, value),
            PatchData::Merge(changes) => self.tree.merge(path, changes),
        };
        if let Err(error) = applied {
            tracing::warn!(path = %path, "dropping malformed patch: {error}");
            return;
        }
        let overlay = self.writes.overlay(path);
        for (target, op, payload) in &overlay {
            if let Err(error) = self.apply_local(target, *op, payload) {
                tracing::warn!(path = %target, "cannot re-apply pending write: {error}");
            }
        }
        let dispatch = self.events.changed(path, &self.tree);
        self.absorb(dispatch);
        for (target, _, _) in overlay {
            if !path.contains(&target) {
                let dispatch = self.events.changed(&target, &self.tree);
                self.absorb(dispatch);
            }
        }
    }

    // ----- auth -----

    fn send_auth(&mut self) {
        if let Some(credential) = self.auth.next_credential() {
            let request_id = self.session.next_request_id();
            self.auth.in_flight = Some(request_id);
            self.session
                .send(ClientMessage::Auth { request_id, credential });
        }
    }

    fn fire_auth_cancel(&mut self, cancel: Option<AuthCancelCallback>, error: ClientError) {
        match cancel {
            Some(cancel) => self.tasks.push(Box::new(move || cancel(&error))),
            None => tracing::debug!("session ended without a cancel callback: {error}"),
        }
    }

    fn on_auth_result(
        &mut self,
        request_id: u64,
        auth: Option<AuthInfo>,
        error: Option<ErrorBody>,
    ) {
        if self.auth.in_flight != Some(request_id) {
            tracing::debug!(request_id, "ignoring stale auth result");
            return;
        }
        self.auth.in_flight = None;
        let authenticating = self.session.state() == SessionState::Authenticating;

        let result = match (auth, error) {
            (Some(info), _) => Ok(info),
            (None, Some(body)) => Err(ClientError::from_body(body, &Path::root())),
            (None, None) => Err(ClientError::Protocol("empty auth result".into())),
        };

        match result {
            Ok(info) => {
                tracing::info!(uid = %info.uid, provider = %info.provider, "authenticated");
                if let Some(pending) = self.auth.pending.take() {
                    if pending.remember {
                        self.store.save(&info);
                    }
                    self.auth.cancel = pending.cancel;
                    self.tasks.push(pending.resolver.into_task(Ok(info.clone())));
                } else if self
                    .store
                    .load()
                    .is_some_and(|remembered| remembered.uid == info.uid)
                {
                    self.store.save(&info);
                }
                self.auth.current = Some(info);
                if authenticating {
                    self.session.set_state(SessionState::Ready);
                    self.on_ready();
                }
            }
            Err(error) => {
                tracing::warn!("authentication failed: {error}");
                let cancel = self.auth.clear_session();
                if let Some(pending) = self.auth.pending.take() {
                    self.tasks.push(pending.resolver.into_task(Err(error.clone())));
                    if !authenticating {
                        self.fire_auth_cancel(cancel, error);
                    }
                } else {
                    self.fire_auth_cancel(cancel, error);
                }
                if authenticating {
                    self.connection_lost();
                    self.session.restart();
                }
            }
        }
    }

    /// Ends the live session if its token has expired.
    fn check_expiry(&mut self) {
        let now = self.clock.now_ms();
        if !self.auth.is_expired(now) {
            return;
        }
        tracing::info!("authentication expired");
        let cancel = self.auth.clear_session();
        self.store.clear();
        self.fire_auth_cancel(
            cancel,
            ClientError::auth(ErrorCode::ExpiredToken, "session expired"),
        );
        if self.session.state().is_ready() {
            self.session.send(ClientMessage::Unauth { request_id: None });
        }
    }

    pub(crate) fn authenticate(
        &mut self,
        credential: Credential,
        remember: bool,
        cancel: Option<AuthCancelCallback>,
    ) -> Completion<AuthInfo> {
        self.check_expiry();
        let (resolver, completion) = Completion::channel("auth");
        if let Some(previous) = self.auth.pending.take() {
            self.tasks
                .push(previous.resolver.into_task(Err(ClientError::Cancelled)));
        }
        self.auth.pending = Some(PendingAuth {
            credential,
            remember,
            cancel,
            resolver,
        });
        if matches!(
            self.session.state(),
            SessionState::Ready | SessionState::Authenticating
        ) {
            self.send_auth();
        }
        completion
    }

    pub(crate) fn resume(&mut self, cancel: Option<AuthCancelCallback>) -> Completion<AuthInfo> {
        let now = self.clock.now_ms();
        if let Some(current) = self.auth.current.clone().filter(|s| !s.is_expired(now)) {
            let (resolver, completion) = Completion::channel("resume");
            self.tasks.push(resolver.into_task(Ok(current)));
            return completion;
        }
        match self.store.load() {
            Some(remembered) if !remembered.is_expired(now) => self.authenticate(
                Credential::Token {
                    token: remembered.token,
                },
                true,
                cancel,
            ),
            Some(_) => {
                self.store.clear();
                Completion::failed(
                    "resume",
                    ClientError::auth(ErrorCode::ExpiredToken, "remembered session has expired"),
                )
            }
            None => Completion::failed(
                "resume",
                ClientError::auth(ErrorCode::InvalidToken, "no remembered session"),
            ),
        }
    }

    /// Drops the live session. `forget` also clears the remembered one.
    pub(crate) fn unauth(&mut self, forget: bool) -> Completion<()> {
        let (resolver, completion) = Completion::channel(if forget { "logout" } else { "unauth" });
        if let Some(pending) = self.auth.pending.take() {
            self.tasks
                .push(pending.resolver.into_task(Err(ClientError::Cancelled)));
        }
        if let Some(session) = &self.auth.current {
            tracing::info!(uid = %session.uid, "signing out");
        }
        self.auth.clear_session();
        self.auth.in_flight = None;
        if forget {
            self.store.clear();
        }
        match self.session.state() {
            SessionState::Ready | SessionState::Authenticating => {
                let request_id = self.session.next_request_id();
                self.auth.logouts.insert(request_id, resolver);
                self.session.send(ClientMessage::Unauth {
                    request_id: Some(request_id),
                });
                if self.session.state() == SessionState::Authenticating {
                    self.session.set_state(SessionState::Ready);
                    self.on_ready();
                }
            }
            _ => self.tasks.push(resolver.into_task(Ok(()))),
        }
        completion
    }

    pub(crate) fn account(&mut self, action: AccountAction, reply: AccountReply) {
        self.check_expiry();
        let request_id = self.session.next_request_id();
        self.accounts.insert(
            request_id,
            AccountRequest {
                action,
                sent: false,
                reply,
            },
        );
        if self.session.state().is_ready() {
            self.flush_accounts();
        }
    }

    // ----- listeners -----

    pub(crate) fn listen(
        &mut self,
        path: &Path,
        query: &QueryParams,
        listener: Listener,
    ) -> ListenerId {
        self.check_expiry();
        let (id, dispatch) = self.events.register(path, query, listener, &self.tree);
        self.absorb(dispatch);
        id
    }

    pub(crate) fn off(&mut self, path: &Path, query_id: &str, event_type: Option<EventType>) {
        let dispatch = self.events.off(path, query_id, event_type);
        self.absorb(dispatch);
    }

    pub(crate) fn unregister(&mut self, id: ListenerId) {
        let dispatch = self.events.unregister(id);
        self.absorb(dispatch);
    }

    // ----- writes -----

    /// Applies a write locally, then queues it for the server.
    pub(crate) fn write(
        &mut self,
        path: &Path,
        op: WriteOp,
        payload: Value,
        operation: &'static str,
    ) -> Completion<()> {
        if let Err(error) = self.apply_local(path, op, &payload) {
            return Completion::failed(operation, error.into());
        }
        self.check_expiry();
        let dispatch = self.events.changed(path, &self.tree);
        self.absorb(dispatch);

        let request_id = self.session.next_request_id();
        let (resolver, completion) = Completion::channel(operation);
        self.writes
            .stage(request_id, path.clone(), op, payload, resolver);
        if self.session.state().is_ready() {
            self.flush_writes();
        }
        completion
    }

    fn apply_local(&mut self, path: &Path, op: WriteOp, payload: &Value) -> Result<(), CoreError> {
        match op {
            WriteOp::Set => {
                let node = Node::from_value(payload)?;
                self.tree.set(path, node);
                self.events.mark_complete(path);
            }
            WriteOp::Update => {
                let changes = payload
                    .as_map()
                    .ok_or_else(|| CoreError::invalid_payload("update needs a map of children"))?;
                for (target, node) in resolve_merge(path, changes)? {
                    self.tree.set(&target, node);
                    self.events.mark_complete(&target);
                }
            }
            WriteOp::Remove => {
                self.tree.remove(path);
                self.events.mark_complete(path);
            }
        }
        Ok(())
    }

    /// Replaces the priority of the cached node at `path`, keeping its value.
    pub(crate) fn set_priority(&mut self, path: &Path, priority: &Value) -> Completion<()> {
        let payload = Priority::from_value(priority).map(|priority| {
            (*self.tree.get(path))
                .clone()
                .with_priority(priority)
                .export()
        });
        match payload {
            Ok(payload) => self.write(path, WriteOp::Set, payload, "set_priority"),
            Err(error) => Completion::failed("set_priority", error.into()),
        }
    }

    /// Next push key, ordered by corrected server time.
    pub(crate) fn next_push_key(&mut self) -> String {
        let now = self.session.server_now(self.clock.now_ms());
        self.push_ids.next_id(now)
    }

    // ----- on-disconnect -----

    pub(crate) fn on_disconnect_write(
        &mut self,
        path: &Path,
        op: WriteOp,
        payload: Value,
    ) -> Completion<()> {
        let operation = "on_disconnect";
        let valid = match op {
            WriteOp::Set => Node::from_value(&payload).map(|_| ()),
            WriteOp::Update => payload
                .as_map()
                .ok_or_else(|| CoreError::invalid_payload("update needs a map of children"))
                .and_then(|changes| resolve_merge(path, changes).map(|_| ())),
            WriteOp::Remove => Ok(()),
        };
        if let Err(error) = valid {
            return Completion::failed(operation, error.into());
        }
        self.check_expiry();
        let (resolver, completion) = Completion::channel(operation);
        let tasks = self.on_disconnect.stage(path.clone(), op, payload, resolver);
        self.tasks.extend(tasks);
        if self.session.state().is_ready() {
            let session = &mut self.session;
            for message in self.on_disconnect.take_unsent(|| session.next_request_id()) {
                self.session.send(message);
            }
        }
        completion
    }

    pub(crate) fn cancel_on_disconnect(&mut self, path: &Path) -> Completion<()> {
        let (resolver, completion) = Completion::channel("on_disconnect_cancel");
        if self.session.state().is_ready() {
            let request_id = self.session.next_request_id();
            let tasks = self.on_disconnect.cancel(path, Some(request_id), resolver);
            self.tasks.extend(tasks);
            self.session.send(ClientMessage::CancelDisconnectAction {
                request_id,
                path: path.clone(),
            });
        } else {
            let tasks = self.on_disconnect.cancel(path, None, resolver);
            self.tasks.extend(tasks);
        }
        completion
    }
}
