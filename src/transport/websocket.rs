//! # WebSocket Transport
//!
//! [`Connector`] over `tokio-tungstenite`.
//!
//! ## Connection Flow:
//! 1. **Upgrade**: client request built from the URL with a bearer
//!    `Authorization` header added
//! 2. **Split**: the stream is split into sink and source halves
//! 3. **Pump**: one spawned task forwards [`Outbound`] frames to the sink and
//!    socket messages to the [`Inbound`] channel until either side ends
//!
//! ## Close Mapping:
//! - Close frame from the peer → `Closed { code, reason }` from the frame
//! - Close frame without a payload → `Closed { 1005, "" }`
//! - Read error or stream end → `Closed { 1006, error text }`

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::transport::{Connector, Inbound, Outbound, TransportLink, CLOSE_ABNORMAL};

/// Close code reported when the peer sent a close frame without a status
const CLOSE_NO_STATUS: u16 = 1005;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str, credential: &str) -> EngineResult<TransportLink> {
        let mut request = url
            .into_client_request()
            .map_err(|e| EngineError::Transport(format!("invalid url {}: {}", url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
            .map_err(|_| EngineError::Authentication("credential is not a valid header value".to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let (stream, response) = connect_async(request).await.map_err(map_connect_error)?;
        info!(url, status = response.status().as_u16(), "WebSocket connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, outbound_rx, inbound_tx));

        Ok(TransportLink {
            tx: outbound_tx,
            rx: inbound_rx,
        })
    }
}

fn map_connect_error(err: WsError) -> EngineError {
    match err {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN =>
        {
            EngineError::Authentication(format!("server rejected credential ({})", response.status()))
        }
        other => EngineError::Transport(other.to_string()),
    }
}

/// Shuttle frames between the socket and the link channels.
async fn pump(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let (mut sink, mut source) = stream.split();

    let closed = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let message = match frame {
                    Some(Outbound::Text(text)) => Message::Text(text),
                    Some(Outbound::Binary(bytes)) => Message::Binary(bytes),
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!(error = %e, "close frame not delivered");
                        }
                        break Inbound::Closed { code, reason };
                    }
                    None => {
                        // Link dropped by the engine side
                        let _ = sink.close().await;
                        return;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    error!(error = %e, "failed to send WebSocket frame");
                    break Inbound::Closed { code: CLOSE_ABNORMAL, reason: e.to_string() };
                }
            }

            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(Inbound::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if inbound.send(Inbound::Binary(bytes)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            warn!(error = %e, "failed to answer protocol ping");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                            None => (CLOSE_NO_STATUS, String::new()),
                        };
                        info!(code, reason = %reason, "WebSocket closed by server");
                        break Inbound::Closed { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read error");
                        break Inbound::Closed { code: CLOSE_ABNORMAL, reason: e.to_string() };
                    }
                    None => {
                        break Inbound::Closed { code: CLOSE_ABNORMAL, reason: "stream ended".to_string() };
                    }
                }
            }
        }
    };

    let _ = inbound.send(closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_transport_error() {
        let connector = WebSocketConnector::new();
        let err = connector.open("not a url", "token").await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let connector = WebSocketConnector::new();
        // Port 1 on localhost is never a WebSocket server
        let err = connector.open("ws://127.0.0.1:1/ws", "token").await.unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }

    #[test]
    fn test_bad_credential_header() {
        assert!(HeaderValue::from_str("Bearer line\nbreak").is_err());
    }
}
