//! One-shot results of asynchronous operations.
//!
//! Writes, on-disconnect registrations, auth and account requests hand back a
//! [`Completion`]. The engine keeps the matching [`Resolver`] and fulfils it
//! through the event queue, so a completion never resolves inside the call
//! that created it.

use crate::error::{ClientError, ClientResult};
use livetree_core::Task;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Future resolving to the outcome of an operation.
///
/// Dropping it is allowed; an error nobody observes is logged instead.
#[must_use = "dropping a completion discards its error, which is only logged"]
pub struct Completion<T> {
    state: State<T>,
    operation: &'static str,
}

enum State<T> {
    Pending(oneshot::Receiver<ClientResult<T>>),
    Ready(Option<ClientResult<T>>),
}

impl<T> Unpin for Completion<T> {}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Pending(_) => "pending",
            State::Ready(Some(Ok(_))) => "ok",
            State::Ready(Some(Err(_))) => "error",
            State::Ready(None) => "taken",
        };
        f.debug_struct("Completion")
            .field("operation", &self.operation)
            .field("state", &state)
            .finish()
    }
}

impl<T> Completion<T> {
    /// Creates a linked resolver and completion.
    pub(crate) fn channel(operation: &'static str) -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            Resolver { tx, operation },
            Self {
                state: State::Pending(rx),
                operation,
            },
        )
    }

    /// A completion that has already failed, e.g. on a validation error.
    pub fn failed(operation: &'static str, error: ClientError) -> Self {
        Self {
            state: State::Ready(Some(Err(error))),
            operation,
        }
    }

    /// A completion that has already succeeded.
    pub fn ready(operation: &'static str, value: T) -> Self {
        Self {
            state: State::Ready(Some(Ok(value))),
            operation,
        }
    }

    /// Name of the operation, for logs.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Takes the result without waiting, if it is available.
    ///
    /// Returns `None` while the operation is still pending and after the
    /// result has been taken once.
    pub fn try_take(&mut self) -> Option<ClientResult<T>> {
        match &mut self.state {
            State::Ready(result) => result.take(),
            State::Pending(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.state = State::Ready(None);
                    Some(result)
                }
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => {
                    self.state = State::Ready(None);
                    Some(Err(ClientError::Cancelled))
                }
            },
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = ClientResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match &mut this.state {
            State::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(ClientError::Cancelled)))
            }
            State::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(received) => {
                    this.state = State::Ready(None);
                    Poll::Ready(received.unwrap_or(Err(ClientError::Cancelled)))
                }
            },
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let State::Ready(Some(Err(error))) = &self.state {
            tracing::warn!(operation = self.operation, "unobserved error: {error}");
        }
    }
}

/// Sending half of a [`Completion`], held by the engine.
pub(crate) struct Resolver<T> {
    tx: oneshot::Sender<ClientResult<T>>,
    operation: &'static str,
}

impl<T> std::fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("operation", &self.operation)
            .finish()
    }
}

impl<T: Send + 'static> Resolver<T> {
    /// Delivers `result` now. Errors nobody waits for are logged.
    pub(crate) fn send(self, result: ClientResult<T>) {
        let operation = self.operation;
        if let Err(Err(error)) = self.tx.send(result) {
            tracing::warn!(operation, "unobserved error: {error}");
        }
    }

    /// Defers delivery of `result` to the event queue.
    pub(crate) fn into_task(self, result: ClientResult<T>) -> Task {
        Box::new(move || self.send(result))
    }
}
