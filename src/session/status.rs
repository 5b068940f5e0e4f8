//! # Session Status
//!
//! The two state enums a session carries: the client-owned connection status
//! and the server-owned pipeline phase mirrored from inbound messages.
//!
//! ## Connection Lifecycle:
//! 1. **Disconnected**: no transport, nothing owned
//! 2. **Connecting**: transport opening, negotiation in flight
//! 3. **Connected**: server acknowledged the capability handshake
//! 4. **Ready**: `session.ready` received; capture, playback and messaging active
//! 5. **Reconnecting**: waiting out a backoff delay after an unexpected close
//! 6. **Error**: authentication rejected or fatal backend error
//! 7. **Failed**: reconnect attempts exhausted (terminal)
//! 8. **MicPermissionDenied**: capture refused by the host (terminal)

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Reconnecting,
    Error,
    Failed,
    MicPermissionDenied,
}

impl ConnectionStatus {
    /// Status string as shown to the presentation layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::MicPermissionDenied => "mic-permission-denied",
        }
    }

    /// Terminal statuses refuse `connect()` until `reset_fatal_error()`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Failed | ConnectionStatus::MicPermissionDenied)
    }

    /// A connection attempt is underway or established; `connect()` is a no-op.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting
                | ConnectionStatus::Connected
                | ConnectionStatus::Ready
                | ConnectionStatus::Reconnecting
        )
    }

    /// Statuses `reset_fatal_error()` clears back to `Disconnected`.
    pub fn is_resettable(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Error | ConnectionStatus::Failed | ConnectionStatus::MicPermissionDenied
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend pipeline phase. Not owned by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Listening => "listening",
            PipelineState::Processing => "processing",
            PipelineState::Speaking => "speaking",
            PipelineState::Cancelled => "cancelled",
        }
    }

    /// Parse the phase names used on the wire. Servers are inconsistent about
    /// `thinking` vs `processing`, so both are accepted.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(PipelineState::Idle),
            "listening" => Some(PipelineState::Listening),
            "processing" | "thinking" => Some(PipelineState::Processing),
            "speaking" => Some(PipelineState::Speaking),
            "cancelled" | "canceled" | "interrupted" => Some(PipelineState::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_active_sets_are_disjoint() {
        let all = [
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Ready,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Error,
            ConnectionStatus::Failed,
            ConnectionStatus::MicPermissionDenied,
        ];
        for status in all {
            assert!(!(status.is_terminal() && status.is_active()), "{status}");
        }
        assert!(ConnectionStatus::Failed.is_terminal());
        assert!(!ConnectionStatus::Error.is_terminal());
        assert!(ConnectionStatus::Error.is_resettable());
    }

    #[test]
    fn test_pipeline_wire_names() {
        assert_eq!(PipelineState::from_wire("thinking"), Some(PipelineState::Processing));
        assert_eq!(PipelineState::from_wire("speaking"), Some(PipelineState::Speaking));
        assert_eq!(PipelineState::from_wire("dancing"), None);
        assert_eq!(ConnectionStatus::MicPermissionDenied.as_str(), "mic-permission-denied");
    }
}
