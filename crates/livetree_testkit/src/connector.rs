//! [`Connector`] backed by a [`LoopbackServer`], for tests that run the real
//! [`Driver`](livetree_client::Driver).

use crate::server::LoopbackServer;
use livetree_client::{BoxFuture, Channel, ClientError, ClientResult, Connector};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opens in-process connections to a [`LoopbackServer`].
///
/// Each connection gets a bridging task that forwards client messages to the
/// server and closes the session when the client drops its end.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    server: Arc<LoopbackServer>,
}

impl LoopbackConnector {
    /// Creates a connector for `server`.
    pub fn new(server: Arc<LoopbackServer>) -> Self {
        Self { server }
    }
}

impl Connector for LoopbackConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, ClientResult<Channel>> {
        let server = Arc::clone(&self.server);
        let url = url.to_string();
        Box::pin(async move {
            let (session, inbound) = server
                .open_session()
                .ok_or_else(|| ClientError::transport_retryable(format!("{url} refused")))?;
            let (outbound, mut from_client) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(message) = from_client.recv().await {
                    server.receive(session, message);
                }
                server.close_session(session);
            });
            Ok(Channel { outbound, inbound })
        })
    }
}
