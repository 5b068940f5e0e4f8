//! # Transport Boundary
//!
//! A bidirectional, message-oriented connection carrying UTF-8 JSON text
//! frames and binary audio frames. The session engine never sees sockets; it
//! sees two channels:
//!
//! - [`Outbound`] frames the engine wants written
//! - [`Inbound`] frames the peer sent, ending with exactly one `Closed`
//!
//! Implementations own whatever task pumps the real connection and must
//! translate every way the connection can end (close frame, I/O error, stream
//! end) into a single `Inbound::Closed`.

pub mod loopback;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineResult;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame (never sent on the wire)
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Liveness check failed: the socket is open but the peer went silent
pub const CLOSE_ZOMBIE: u16 = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: u16, reason: String },
}

/// An open connection, as a pair of channels.
#[derive(Debug)]
pub struct TransportLink {
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub rx: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens transport links.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`, authenticating with `credential`.
    ///
    /// ## Errors:
    /// - `EngineError::Authentication` when the server rejects the credential
    ///   during the upgrade (never retried)
    /// - `EngineError::Transport` for everything else
    async fn open(&self, url: &str, credential: &str) -> EngineResult<TransportLink>;
}
