//! Transport seam.
//!
//! The engine never performs I/O. It emits [`Command`]s which a driver
//! executes against a [`Connector`]; what comes back from the server is fed
//! into the engine as [`ServerMessage`]s.

use crate::error::ClientResult;
use livetree_protocol::{ClientMessage, ServerMessage};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// Boxed future returned by [`Connector::connect`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Work the engine asks its driver to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Open a transport to the configured URL.
    Connect,
    /// Send one message on the open transport.
    Send(ClientMessage),
    /// Close the transport without reporting it back.
    Disconnect,
    /// Call [`Database::reconnect_now`](crate::Database::reconnect_now)
    /// after the delay.
    ScheduleReconnect(Duration),
}

/// An open, message-framed connection to the server.
///
/// Dropping `outbound` or seeing `inbound` end is the disconnect signal.
#[derive(Debug)]
pub struct Channel {
    /// Messages to the server.
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Messages from the server.
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Channel {
    /// Creates a channel and the server-side ends connected to it.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<ClientMessage>,
        mpsc::UnboundedSender<ServerMessage>,
    ) {
        let (outbound, server_rx) = mpsc::unbounded_channel();
        let (server_tx, inbound) = mpsc::unbounded_channel();
        (Self { outbound, inbound }, server_rx, server_tx)
    }
}

/// Opens connections to a server.
///
/// Framing, TLS and encoding live behind this trait.
pub trait Connector: Send + Sync + 'static {
    /// Connects to `url`.
    fn connect(&self, url: &str) -> BoxFuture<'static, ClientResult<Channel>>;
}

/// A connector that refuses every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineConnector;

impl Connector for OfflineConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, ClientResult<Channel>> {
        let message = format!("offline: cannot reach {url}");
        Box::pin(async move { Err(crate::ClientError::transport_retryable(message)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livetree_protocol::PROTOCOL_VERSION;

    #[tokio::test]
    async fn channel_pair_is_connected() {
        let (mut channel, mut server_rx, server_tx) = Channel::pair();
        channel
            .outbound
            .send(ClientMessage::Handshake {
                protocol_version: PROTOCOL_VERSION,
                namespace: "demo".into(),
            })
            .unwrap();
        assert!(matches!(
            server_rx.recv().await,
            Some(ClientMessage::Handshake { .. })
        ));

        drop(server_tx);
        assert!(channel.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn offline_connector_refuses() {
        let err = OfflineConnector.connect("https://x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
