//! In-process transport: every `open()` hands the server side of a fresh
//! channel pair to whoever holds the acceptor. Used to drive a session
//! runtime against a scripted backend without a socket.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::transport::{Connector, Inbound, Outbound, TransportLink};

/// Server side of one loopback connection.
#[derive(Debug)]
pub struct ServerEnd {
    pub url: String,
    pub credential: String,
    /// Frames the client sent
    pub from_client: mpsc::UnboundedReceiver<Outbound>,
    /// Frames to deliver to the client
    pub to_client: mpsc::UnboundedSender<Inbound>,
}

impl ServerEnd {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Inbound::Text(text.into())).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.to_client
            .send(Inbound::Closed {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    acceptor: mpsc::UnboundedSender<ServerEnd>,
}

impl LoopbackConnector {
    /// Connector plus the receiver on which server ends arrive.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (acceptor, accepted) = mpsc::unbounded_channel();
        (Self { acceptor }, accepted)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, url: &str, credential: &str) -> EngineResult<TransportLink> {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();

        let server = ServerEnd {
            url: url.to_string(),
            credential: credential.to_string(),
            from_client,
            to_client,
        };
        self.acceptor
            .send(server)
            .map_err(|_| EngineError::Transport("no loopback server is listening".to_string()))?;
        debug!(url, "loopback connection opened");

        Ok(TransportLink {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_the_loopback() {
        let (connector, mut accepted) = LoopbackConnector::new();
        let mut link = connector.open("loop://voice", "secret").await.unwrap();
        let mut server = accepted.recv().await.unwrap();
        assert_eq!(server.credential, "secret");

        link.tx.send(Outbound::Text("hi".into())).unwrap();
        assert_eq!(server.from_client.recv().await, Some(Outbound::Text("hi".into())));

        assert!(server.send_text("hello"));
        assert_eq!(link.rx.recv().await, Some(Inbound::Text("hello".into())));
    }

    #[tokio::test]
    async fn test_open_without_listener_fails() {
        let (connector, accepted) = LoopbackConnector::new();
        drop(accepted);
        assert!(connector.open("loop://voice", "secret").await.is_err());
    }
}
