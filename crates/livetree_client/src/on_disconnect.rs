//! Writes staged with the server to run when this client disconnects.
//!
//! The server keeps at most one staged write per location and forgets all of
//! them when the connection drops (after running them), so the registry
//! keeps the client's copy and registers it again on every new connection.

use crate::completion::Resolver;
use crate::error::ClientError;
use livetree_codec::Value;
use livetree_core::{Path, Task};
use livetree_protocol::{ClientMessage, ErrorBody, WriteOp};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
struct StagedAction {
    op: WriteOp,
    payload: Value,
    /// Id of the registration on the wire for this connection.
    request_id: Option<u64>,
    /// Whether the server confirmed the registration on this connection.
    acked: bool,
    /// Caller waiting for the first confirmation.
    resolver: Option<Resolver<()>>,
}

#[derive(Debug)]
enum InFlight {
    Register {
        path: Path,
        resolver: Option<Resolver<()>>,
    },
    Cancel {
        path: Path,
        resolver: Resolver<()>,
    },
}

/// The client's copy of its staged on-disconnect writes.
#[derive(Debug)]
pub(crate) struct OnDisconnectRegistry {
    actions: BTreeMap<Path, StagedAction>,
    in_flight: HashMap<u64, InFlight>,
    rearm: bool,
}

impl OnDisconnectRegistry {
    pub(crate) fn new(rearm: bool) -> Self {
        Self {
            actions: BTreeMap::new(),
            in_flight: HashMap::new(),
            rearm,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.actions.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.actions.contains_key(path)
    }

    pub(crate) fn owns_request(&self, request_id: u64) -> bool {
        self.in_flight.contains_key(&request_id)
    }

    /// Stages a write at `path`, replacing any earlier one there.
    pub(crate) fn stage(
        &mut self,
        path: Path,
        op: WriteOp,
        payload: Value,
        resolver: Resolver<()>,
    ) -> Vec<Task> {
        let mut tasks = Vec::new();
        let replaced = self.actions.insert(
            path,
            StagedAction {
                op,
                payload,
                request_id: None,
                acked: false,
                resolver: Some(resolver),
            },
        );
        if let Some(resolver) = replaced.and_then(|old| old.resolver) {
            tasks.push(resolver.into_task(Err(ClientError::Cancelled)));
        }
        tasks
    }

    /// Registration messages for actions not yet registered on this
    /// connection.
    pub(crate) fn take_unsent(&mut self, mut next_id: impl FnMut() -> u64) -> Vec<ClientMessage> {
        let mut messages = Vec::new();
        for (path, action) in &mut self.actions {
            if action.request_id.is_some() {
                continue;
            }
            let request_id = next_id();
            action.request_id = Some(request_id);
            action.acked = false;
            self.in_flight.insert(
                request_id,
                InFlight::Register {
                    path: path.clone(),
                    resolver: action.resolver.take(),
                },
            );
            messages.push(ClientMessage::DisconnectAction {
                request_id,
                path: path.clone(),
                op: action.op,
                payload: action.payload.clone(),
            });
        }
        messages
    }

    /// Forgets actions at `path` and below.
    ///
    /// With a `request_id` the caller is resolved by the server's
    /// acknowledgement; without one (not connected) it succeeds at once.
    pub(crate) fn cancel(
        &mut self,
        path: &Path,
        request_id: Option<u64>,
        resolver: Resolver<()>,
    ) -> Vec<Task> {
        let doomed: Vec<Path> = self
            .actions
            .keys()
            .filter(|staged| path.contains(staged))
            .cloned()
            .collect();
        let mut tasks = Vec::new();
        for staged in doomed {
            if let Some(resolver) = self.actions.remove(&staged).and_then(|a| a.resolver) {
                tasks.push(resolver.into_task(Err(ClientError::Cancelled)));
            }
        }
        match request_id {
            Some(id) => {
                self.in_flight.insert(
                    id,
                    InFlight::Cancel {
                        path: path.clone(),
                        resolver,
                    },
                );
            }
            None => tasks.push(resolver.into_task(Ok(()))),
        }
        tasks
    }

    /// Handles the acknowledgement of a registration or cancellation.
    pub(crate) fn acknowledge(
        &mut self,
        request_id: u64,
        outcome: Result<(), ErrorBody>,
    ) -> Vec<Task> {
        let mut tasks = Vec::new();
        match self.in_flight.remove(&request_id) {
            Some(InFlight::Register { path, resolver }) => {
                let outcome = outcome.map_err(|body| ClientError::from_body(body, &path));
                let current = self
                    .actions
                    .get(&path)
                    .is_some_and(|a| a.request_id == Some(request_id));
                if current {
                    if outcome.is_ok() {
                        if let Some(action) = self.actions.get_mut(&path) {
                            action.acked = true;
                        }
                    } else {
                        tracing::warn!(path = %path, "on-disconnect registration rejected");
                        self.actions.remove(&path);
                    }
                }
                if let Some(resolver) = resolver {
                    tasks.push(resolver.into_task(outcome));
                }
            }
            Some(InFlight::Cancel { path, resolver }) => {
                let outcome = outcome.map_err(|body| ClientError::from_body(body, &path));
                tasks.push(resolver.into_task(outcome));
            }
            None => {}
        }
        tasks
    }

    /// The connection dropped. The server ran and forgot every staged
    /// action; decide which to register again.
    pub(crate) fn reset(&mut self) -> Vec<Task> {
        let mut tasks = Vec::new();
        for (request_id, entry) in std::mem::take(&mut self.in_flight) {
            match entry {
                InFlight::Register { path, resolver } => {
                    let Some(resolver) = resolver else { continue };
                    match self.actions.get_mut(&path) {
                        Some(action) if action.request_id == Some(request_id) => {
                            action.resolver = Some(resolver);
                        }
                        _ => tasks.push(resolver.into_task(Err(ClientError::Cancelled))),
                    }
                }
                InFlight::Cancel { resolver, .. } => tasks.push(resolver.into_task(Ok(()))),
            }
        }
        if !self.rearm {
            self.actions.retain(|_, action| !action.acked);
        }
        for action in self.actions.values_mut() {
            action.request_id = None;
            action.acked = false;
        }
        tasks
    }

    /// Fails every registration the server never confirmed.
    pub(crate) fn fail_pending(&mut self, error: &ClientError) -> Vec<Task> {
        let mut tasks = Vec::new();
        for (_, entry) in std::mem::take(&mut self.in_flight) {
            let resolver = match entry {
                InFlight::Register { resolver, .. } => resolver,
                InFlight::Cancel { resolver, .. } => Some(resolver),
            };
            if let Some(resolver) = resolver {
                tasks.push(resolver.into_task(Err(error.clone())));
            }
        }
        let mut kept = BTreeMap::new();
        for (path, mut action) in std::mem::take(&mut self.actions) {
            match action.resolver.take() {
                Some(resolver) => tasks.push(resolver.into_task(Err(error.clone()))),
                None if action.request_id.is_some() && !action.acked => {}
                None => {
                    action.request_id = None;
                    kept.insert(path, action);
                }
            }
        }
        self.actions = kept;
        tasks
    }
}
