//! Authentication state and remembered sessions.

use crate::completion::Resolver;
use crate::error::ClientError;
use livetree_protocol::{AuthInfo, Credential};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Called once when an authenticated session ends without the caller asking:
/// revocation by the server, token expiry, or a failed re-authentication.
pub type AuthCancelCallback = std::sync::Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Storage for the session kept across restarts when `remember_me` is set.
pub trait SessionStore: Send + Sync {
    /// The remembered session, if any.
    fn load(&self) -> Option<AuthInfo>;

    /// Remembers `session`, replacing any previous one.
    fn save(&self, session: &AuthInfo);

    /// Forgets the remembered session.
    fn clear(&self);
}

/// A [`SessionStore`] that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<AuthInfo>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<AuthInfo> {
        self.slot.lock().clone()
    }

    fn save(&self, session: &AuthInfo) {
        *self.slot.lock() = Some(session.clone());
    }

    fn clear(&self) {
        *self.slot.lock() = None;
    }
}

/// An auth request made by the caller and not yet answered.
pub(crate) struct PendingAuth {
    pub(crate) credential: Credential,
    pub(crate) remember: bool,
    pub(crate) cancel: Option<AuthCancelCallback>,
    pub(crate) resolver: Resolver<AuthInfo>,
}

/// Client-side view of the session's authentication.
#[derive(Default)]
pub(crate) struct AuthState {
    /// The live session.
    pub(crate) current: Option<AuthInfo>,
    /// Cancel callback of the live session.
    pub(crate) cancel: Option<AuthCancelCallback>,
    /// Caller request waiting to be sent or answered.
    pub(crate) pending: Option<PendingAuth>,
    /// Request id of the auth message on the wire, if any.
    pub(crate) in_flight: Option<u64>,
    /// Unauth requests awaiting acknowledgement.
    pub(crate) logouts: BTreeMap<u64, Resolver<()>>,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("uid", &self.current.as_ref().map(|s| s.uid.as_str()))
            .field("pending", &self.pending.is_some())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl AuthState {
    /// Whether a connection must authenticate before it is ready.
    pub(crate) fn wants_auth(&self) -> bool {
        self.pending.is_some() || self.current.is_some()
    }

    /// Credential to present next: the caller's request first, then the
    /// live session's token.
    pub(crate) fn next_credential(&self) -> Option<Credential> {
        if let Some(pending) = &self.pending {
            return Some(pending.credential.clone());
        }
        self.current.as_ref().map(|session| Credential::Token {
            token: session.token.clone(),
        })
    }

    /// Drops the live session, returning its cancel callback.
    pub(crate) fn clear_session(&mut self) -> Option<AuthCancelCallback> {
        self.current = None;
        self.cancel.take()
    }

    /// Whether the live session has expired at `now_ms`.
    pub(crate) fn is_expired(&self, now_ms: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|session| session.is_expired(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;

    fn session(expires: u64) -> AuthInfo {
        AuthInfo {
            uid: "u1".into(),
            provider: "custom".into(),
            token: "tok".into(),
            expires,
            email: None,
        }
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySessionStore::new();
        assert!(store.load().is_none());
        store.save(&session(10));
        assert_eq!(store.load().unwrap().uid, "u1");
        store.clear();
        assert!(store.load().is_none());
    }

    #[test]
    fn pending_credential_wins() {
        let mut state = AuthState::default();
        assert!(!state.wants_auth());
        assert!(state.next_credential().is_none());

        state.current = Some(session(10));
        assert_eq!(
            state.next_credential(),
            Some(Credential::Token {
                token: "tok".into()
            })
        );

        let (resolver, _completion) = Completion::channel("auth");
        state.pending = Some(PendingAuth {
            credential: Credential::Password {
                email: "a@b.c".into(),
                password: "pw".into(),
            },
            remember: false,
            cancel: None,
            resolver,
        });
        assert_eq!(state.next_credential().unwrap().provider(), "password");
    }

    #[test]
    fn expiry_uses_live_session() {
        let mut state = AuthState::default();
        assert!(!state.is_expired(100));
        state.current = Some(session(50));
        assert!(!state.is_expired(49));
        assert!(state.is_expired(50));
        state.clear_session();
        assert!(!state.is_expired(100));
    }
}
