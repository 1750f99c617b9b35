//! Writes awaiting server acknowledgement.

use crate::completion::Resolver;
use crate::error::ClientError;
use livetree_codec::Value;
use livetree_core::{Path, Task};
use livetree_protocol::{ClientMessage, WriteOp};
use std::collections::BTreeMap;

/// Acknowledgement state of a pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckState {
    /// Applied locally, not yet on the wire.
    Queued,
    /// Sent on the current connection.
    Sent,
}

/// A write applied locally and not yet acknowledged.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub(crate) path: Path,
    pub(crate) op: WriteOp,
    pub(crate) payload: Value,
    pub(crate) state: AckState,
    pub(crate) resolver: Resolver<()>,
}

impl PendingWrite {
    fn message(&self, request_id: u64) -> ClientMessage {
        ClientMessage::Write {
            request_id,
            path: self.path.clone(),
            op: self.op,
            payload: self.payload.clone(),
        }
    }
}

/// Pending writes keyed by request id, which is also their send order.
#[derive(Debug, Default)]
pub(crate) struct WriteCoordinator {
    pending: BTreeMap<u64, PendingWrite>,
}

impl WriteCoordinator {
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn stage(
        &mut self,
        request_id: u64,
        path: Path,
        op: WriteOp,
        payload: Value,
        resolver: Resolver<()>,
    ) {
        self.pending.insert(
            request_id,
            PendingWrite {
                path,
                op,
                payload,
                state: AckState::Queued,
                resolver,
            },
        );
    }

    /// Messages for every queued write, oldest first. Marks them sent.
    pub(crate) fn take_unsent(&mut self) -> Vec<ClientMessage> {
        self.pending
            .iter_mut()
            .filter(|(_, write)| write.state == AckState::Queued)
            .map(|(&id, write)| {
                write.state = AckState::Sent;
                write.message(id)
            })
            .collect()
    }

    /// The connection dropped: everything must be sent again.
    pub(crate) fn mark_unsent(&mut self) {
        for write in self.pending.values_mut() {
            write.state = AckState::Queued;
        }
    }

    /// Writes to re-apply after server data replaced `path`, oldest first:
    /// those overlapping `path` or a write already selected.
    pub(crate) fn overlay(&self, path: &Path) -> Vec<(Path, WriteOp, Value)> {
        let mut touched = vec![path.clone()];
        let mut out = Vec::new();
        for write in self.pending.values() {
            if touched
                .iter()
                .any(|t| t.contains(&write.path) || write.path.contains(t))
            {
                touched.push(write.path.clone());
                out.push((write.path.clone(), write.op, write.payload.clone()));
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, request_id: u64) -> bool {
        self.pending.contains_key(&request_id)
    }

    /// Removes the write acknowledged by `request_id`.
    pub(crate) fn acknowledge(&mut self, request_id: u64) -> Option<PendingWrite> {
        self.pending.remove(&request_id)
    }

    /// Fails every pending write with `error`.
    pub(crate) fn fail_all(&mut self, error: &ClientError) -> Vec<Task> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|write| write.resolver.into_task(Err(error.clone())))
            .collect()
    }
}
