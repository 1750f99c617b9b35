//! The database handle shared by every reference.

use crate::auth::AuthCancelCallback;
use crate::completion::Completion;
use crate::config::ClientConfig;
use crate::engine::{AccountReply, Engine};
use crate::error::{ClientError, ClientResult};
use crate::reference::Reference;
use crate::session::SessionState;
use crate::transport::Command;
use livetree_core::{CoreError, EventQueue, Path};
use livetree_protocol::{AccountAction, AuthInfo, Credential, ServerMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{watch, Notify};

struct Inner {
    config: ClientConfig,
    engine: Mutex<Engine>,
    queue: EventQueue,
    wake: Notify,
    state_rx: watch::Receiver<SessionState>,
}

/// A connection to one database, shared by all references derived from it.
///
/// Cloning is cheap. The handle itself performs no I/O: a
/// [`Driver`](crate::Driver) executes the [`Command`]s it produces and feeds
/// the server's messages back in. Callbacks and completions are delivered by
/// [`process_events`](Self::process_events), which the driver calls.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Database {
    /// Creates a handle and queues the first connection attempt.
    pub fn new(config: ClientConfig) -> Self {
        let (mut engine, state_rx) = Engine::new(&config);
        engine.start();
        Self {
            inner: Arc::new(Inner {
                config,
                engine: Mutex::new(engine),
                queue: EventQueue::new(),
                wake: Notify::new(),
                state_rx,
            }),
        }
    }

    /// Creates a handle with the default configuration for `url`.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self::new(ClientConfig::new(url))
    }

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Root URL.
    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Reference to the root location.
    pub fn root(&self) -> Reference {
        Reference::new(self.clone(), Path::root())
    }

    /// Reference to a slash-separated location.
    pub fn reference(&self, path: &str) -> ClientResult<Reference> {
        Ok(Reference::new(self.clone(), Path::parse(path)?))
    }

    /// Reference to an absolute location URL of this database.
    pub fn reference_from_url(&self, url: &str) -> ClientResult<Reference> {
        let rest = url
            .strip_prefix(self.url())
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .ok_or_else(|| CoreError::invalid_path(url, "URL belongs to another database"))?;
        Ok(Reference::new(self.clone(), Path::from_url_path(rest)?))
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    /// Receiver notified on every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    /// Server-assigned id of the current connection.
    pub fn session_id(&self) -> Option<String> {
        self.inner.engine.lock().session_id().map(str::to_string)
    }

    /// The live authenticated session, if any.
    pub fn auth_info(&self) -> Option<AuthInfo> {
        self.inner.engine.lock().auth_info()
    }

    /// Number of writes not yet acknowledged by the server.
    pub fn pending_writes(&self) -> usize {
        self.inner.engine.lock().pending_writes()
    }

    /// Runs `f` on the engine, then moves the callbacks it produced to the
    /// event queue and wakes the driver if there is work.
    pub(crate) fn with_engine<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let mut engine = self.inner.engine.lock();
        let out = f(&mut engine);
        // Enqueue under the engine lock so tasks keep mutation order.
        self.inner.queue.extend(engine.take_tasks());
        let wake = engine.has_commands() || !self.inner.queue.is_empty();
        drop(engine);
        if wake {
            self.inner.wake.notify_one();
        }
        out
    }

    pub(crate) fn wake(&self) -> &Notify {
        &self.inner.wake
    }

    // ----- authentication -----

    /// Authenticates with a token or custom secret.
    pub fn auth_with_token(
        &self,
        token: impl Into<String>,
        remember_me: bool,
    ) -> Completion<AuthInfo> {
        let credential = Credential::Token {
            token: token.into(),
        };
        self.with_engine(|e| e.authenticate(credential, remember_me, None))
    }

    /// Authenticates with an email and password.
    pub fn auth_with_password(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
        remember_me: bool,
    ) -> Completion<AuthInfo> {
        let credential = Credential::Password {
            email: email.into(),
            password: password.into(),
        };
        self.with_engine(|e| e.authenticate(credential, remember_me, None))
    }

    /// Authenticates, calling `cancel` if the session later ends without
    /// being asked to (revoked, expired, or rejected on reconnect).
    pub fn auth_with_cancel<C>(
        &self,
        credential: Credential,
        remember_me: bool,
        cancel: C,
    ) -> Completion<AuthInfo>
    where
        C: Fn(&ClientError) + Send + Sync + 'static,
    {
        let cancel: AuthCancelCallback = Arc::new(cancel);
        self.with_engine(|e| e.authenticate(credential, remember_me, Some(cancel)))
    }

    /// Drops the live session. A remembered session stays available to
    /// [`resume`](Self::resume).
    pub fn unauth(&self) -> Completion<()> {
        self.with_engine(|e| e.unauth(false))
    }

    /// Drops the live session and forgets the remembered one.
    pub fn logout(&self) -> Completion<()> {
        self.with_engine(|e| e.unauth(true))
    }

    /// Restores the live session, or the remembered one while its token is
    /// unexpired.
    pub fn resume(&self) -> Completion<AuthInfo> {
        self.with_engine(|e| e.resume(None))
    }

    /// Like [`resume`](Self::resume), with a cancel callback for the
    /// restored session.
    pub fn resume_with_cancel<C>(&self, cancel: C) -> Completion<AuthInfo>
    where
        C: Fn(&ClientError) + Send + Sync + 'static,
    {
        let cancel: AuthCancelCallback = Arc::new(cancel);
        self.with_engine(|e| e.resume(Some(cancel)))
    }

    // ----- accounts -----

    /// Creates an email/password account. Resolves with the new uid.
    pub fn create_user(&self, email: &str, password: &str) -> Completion<String> {
        if let Err(error) = check_email(email) {
            return Completion::failed("create_user", error);
        }
        let (resolver, completion) = Completion::channel("create_user");
        let action = AccountAction::CreateUser {
            email: email.to_string(),
            password: password.to_string(),
        };
        self.with_engine(|e| e.account(action, AccountReply::Uid(resolver)));
        completion
    }

    /// Deletes an email/password account.
    pub fn remove_user(&self, email: &str, password: &str) -> Completion<()> {
        self.account(
            "remove_user",
            AccountAction::RemoveUser {
                email: email.to_string(),
                password: password.to_string(),
            },
        )
    }

    /// Changes an account's password.
    pub fn change_password(
        &self,
        email: &str,
        old_password: &str,
        new_password: &str,
    ) -> Completion<()> {
        self.account(
            "change_password",
            AccountAction::ChangePassword {
                email: email.to_string(),
                old_password: old_password.to_string(),
                new_password: new_password.to_string(),
            },
        )
    }

    /// Asks the server to send a password reset to `email`.
    pub fn send_password_reset(&self, email: &str) -> Completion<()> {
        self.account(
            "send_password_reset",
            AccountAction::SendPasswordReset {
                email: email.to_string(),
            },
        )
    }

    fn account(&self, operation: &'static str, action: AccountAction) -> Completion<()> {
        if let Err(error) = check_email(action.email()) {
            return Completion::failed(operation, error);
        }
        let (resolver, completion) = Completion::channel(operation);
        self.with_engine(|e| e.account(action, AccountReply::Done(resolver)));
        completion
    }

    // ----- connection -----

    /// Re-enables automatic reconnection and connects if needed.
    pub fn go_online(&self) {
        self.with_engine(Engine::go_online);
    }

    /// Closes the connection and disables automatic reconnection.
    ///
    /// Writes keep applying locally and are sent after
    /// [`go_online`](Self::go_online).
    pub fn go_offline(&self) {
        self.with_engine(Engine::go_offline);
    }

    // ----- driver interface -----

    /// The transport opened.
    pub fn handle_transport_open(&self) {
        self.with_engine(Engine::handle_transport_open);
    }

    /// A message arrived from the server.
    pub fn handle_message(&self, message: ServerMessage) {
        self.with_engine(|e| e.handle_message(message));
    }

    /// The transport closed or could not be opened.
    pub fn handle_transport_closed(&self, reason: &str) {
        self.with_engine(|e| e.handle_transport_closed(reason));
    }

    /// Runs a reconnect scheduled by [`Command::ScheduleReconnect`].
    pub fn reconnect_now(&self) {
        self.with_engine(Engine::reconnect_now);
    }

    /// Periodic housekeeping: detects expired sessions.
    pub fn tick(&self) {
        self.with_engine(Engine::tick);
    }

    /// Takes the commands produced so far, in order.
    pub fn take_commands(&self) -> Vec<Command> {
        self.inner.engine.lock().take_commands()
    }

    /// Whether commands are waiting.
    pub fn has_commands(&self) -> bool {
        self.inner.engine.lock().has_commands()
    }

    /// Runs queued callbacks and completions. Returns how many ran.
    ///
    /// Never call this while holding a lock a callback might need. Calls
    /// from inside a callback return 0.
    pub fn process_events(&self) -> usize {
        self.inner.queue.drain()
    }
}

fn check_email(email: &str) -> ClientResult<()> {
    let valid = email
        .split_once('@')
        .is_some_and(|(user, host)| !user.is_empty() && !host.is_empty());
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid_payload(format!("{email:?} is not an email address")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_database_wants_to_connect() {
        let db = Database::from_url("https://demo.example.com/");
        assert_eq!(db.url(), "https://demo.example.com");
        assert_eq!(db.state(), SessionState::Connecting);
        assert_eq!(db.take_commands(), vec![Command::Connect]);
        assert!(!db.has_commands());
    }

    #[test]
    fn references_from_urls() {
        let db = Database::from_url("https://demo.example.com");
        let r = db
            .reference_from_url("https://demo.example.com/users/ada%20l")
            .unwrap();
        assert_eq!(r.path().to_string(), "/users/ada l");
        assert!(db.reference_from_url("https://demo.example.com").unwrap().path().is_root());
        assert!(db.reference_from_url("https://other.example.com/a").is_err());
        assert!(db.reference_from_url("https://demo.example.com.evil/a").is_err());
    }

    #[test]
    fn bad_email_fails_fast() {
        let db = Database::from_url("https://demo.example.com");
        let mut done = db.send_password_reset("nobody");
        assert!(matches!(done.try_take(), Some(Err(ClientError::Validation(_)))));
        let mut uid = db.create_user("@host", "pw");
        assert!(uid.try_take().unwrap().is_err());
    }

    #[test]
    fn go_offline_stops_connecting() {
        let db = Database::from_url("https://demo.example.com");
        db.take_commands();
        db.go_offline();
        assert_eq!(db.state(), SessionState::Disconnected);
        db.reconnect_now();
        assert!(!db.take_commands().contains(&Command::Connect));
        db.go_online();
        assert_eq!(db.take_commands(), vec![Command::Connect]);
    }

    #[test]
    fn callbacks_wait_for_process_events() {
        let db = Database::from_url("https://demo.example.com");
        let mut done = db.unauth();
        assert!(done.try_take().is_none());
        assert_eq!(db.process_events(), 1);
        assert_eq!(done.try_take(), Some(Ok(())));
    }
}
