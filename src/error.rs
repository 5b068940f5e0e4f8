//! # Error Handling
//!
//! Error types for the voice session engine. Every failure the engine can
//! surface maps onto one variant, so callers can tell "never connected" apart
//! from "connected then went silent" and a revoked credential apart from a
//! denied microphone.
//!
//! ## Error Categories:
//! - **Transport**: connection refused, abnormal close; retried by the reconnect policy
//! - **Authentication**: missing or rejected credential; never retried
//! - **Capture**: microphone permission denied or device absent; needs an explicit reset
//! - **Protocol**: malformed frames or JSON; logged and dropped, never fatal
//! - **Backend**: errors reported by the server, carrying a `recoverable` flag
//! - **Timeout**: one of the engine's explicit timers expired
//!
//! ## Usage Example:
//! ```rust
//! use voice_session_engine::error::{EngineError, EngineResult};
//!
//! fn require_token(token: Option<&str>) -> EngineResult<&str> {
//!     token.ok_or_else(|| EngineError::Authentication("no credential configured".to_string()))
//! }
//! assert!(require_token(None).is_err());
//! ```

use std::fmt;

use crate::session::status::ConnectionStatus;

/// Which of the engine's timers expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Transport opened but the server never acknowledged `session.init`.
    Handshake,
    /// Negotiation finished but `session.ready` never arrived.
    SessionReady,
    /// Pre-buffer did not fill before its deadline; playback started anyway.
    Prebuffer,
    /// A heartbeat ping went unanswered.
    Pong,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TimeoutKind::Handshake => "handshake",
            TimeoutKind::SessionReady => "session ready",
            TimeoutKind::Prebuffer => "pre-buffer",
            TimeoutKind::Pong => "heartbeat pong",
        };
        f.write_str(label)
    }
}

/// Custom error type for the engine.
///
/// ## Recoverability:
/// [`EngineError::is_recoverable`] tells the presentation layer whether to
/// offer a "retry" affordance (transport, timeout, recoverable backend errors)
/// or a "fix and reset" one (authentication, capture, terminal state).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Transport could not be opened or closed abnormally
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credential missing or rejected by the server
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Microphone could not be acquired
    #[error("Capture error: {0}")]
    Capture(String),

    /// Malformed or unparseable protocol data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reported by the backend pipeline
    #[error("Backend error {code}: {message}")]
    Backend {
        code: String,
        message: String,
        recoverable: bool,
    },

    /// One of the engine's explicit timers expired
    #[error("Timed out waiting for {0}")]
    Timeout(TimeoutKind),

    /// An operation that needs a ready session was called too early
    #[error("Session not ready (status: {0})")]
    NotReady(ConnectionStatus),

    /// The engine is in a terminal status and needs `reset_fatal_error`
    #[error("Engine is in terminal status {0}; reset required")]
    Terminal(ConnectionStatus),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local I/O failure (recovery store, audio device handles)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the session can continue (or be retried automatically) after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Transport(_) | EngineError::Timeout(_) | EngineError::Protocol(_) => true,
            EngineError::Backend { recoverable, .. } => *recoverable,
            EngineError::NotReady(_) => true,
            EngineError::Authentication(_)
            | EngineError::Capture(_)
            | EngineError::Terminal(_)
            | EngineError::Config(_)
            | EngineError::Io(_) => false,
        }
    }

    /// Short machine-readable code used in error events.
    pub fn code(&self) -> &str {
        match self {
            EngineError::Transport(_) => "transport_error",
            EngineError::Authentication(_) => "authentication_error",
            EngineError::Capture(_) => "capture_error",
            EngineError::Protocol(_) => "protocol_error",
            EngineError::Backend { code, .. } => code,
            EngineError::Timeout(_) => "timeout",
            EngineError::NotReady(_) => "not_ready",
            EngineError::Terminal(_) => "terminal_state",
            EngineError::Config(_) => "config_error",
            EngineError::Io(_) => "io_error",
        }
    }
}

/// Automatic conversion from anyhow::Error to EngineError.
///
/// Config loading returns `anyhow::Result`; anything that bubbles up through it
/// is a configuration problem from the engine's point of view.
impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// JSON failures are always the peer's fault, so they become protocol errors.
impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

/// Type alias for Results that use the engine's error type.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_split() {
        assert!(EngineError::Transport("refused".into()).is_recoverable());
        assert!(EngineError::Timeout(TimeoutKind::Pong).is_recoverable());
        assert!(!EngineError::Authentication("expired".into()).is_recoverable());
        assert!(!EngineError::Capture("denied".into()).is_recoverable());

        let advisory = EngineError::Backend {
            code: "rate_limited".into(),
            message: "slow down".into(),
            recoverable: true,
        };
        assert!(advisory.is_recoverable());
        assert_eq!(advisory.code(), "rate_limited");
    }

    #[test]
    fn test_json_error_becomes_protocol_error() {
        let err: EngineError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn test_timeout_display() {
        let err = EngineError::Timeout(TimeoutKind::Handshake);
        assert_eq!(err.to_string(), "Timed out waiting for handshake");
    }
}
