//! Typed events delivered to the presentation layer.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::metrics::MetricsSnapshot;
use crate::session::status::{ConnectionStatus, PipelineState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolCallEvent {
    Started {
        call_id: String,
        name: String,
        arguments: Value,
    },
    Completed {
        call_id: String,
        name: Option<String>,
        result: Value,
    },
    Failed {
        call_id: String,
        name: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    SessionReady {
        session_id: String,
        resumed: bool,
    },
    /// A reconnect attempt is scheduled after `delay`
    Reconnecting {
        attempt: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    PipelineChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// Latest partial hypothesis (replaces any earlier partial)
    PartialTranscript {
        text: String,
    },
    FinalTranscript {
        text: String,
    },
    ResponseDelta {
        delta: String,
        accumulated: String,
    },
    ResponseComplete {
        text: String,
    },
    /// What the user actually heard before the interruption
    Truncated {
        spoken: String,
        unspoken: String,
    },
    ToolCall(ToolCallEvent),
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
    Metrics(MetricsSnapshot),
    PlaybackStarted,
    /// Output was silenced; `fade` is how long the ramp to silence takes
    PlaybackStopped {
        #[serde(with = "duration_ms")]
        fade: Duration,
    },
    PlaybackComplete,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = SessionEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_millis(600),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"reconnecting","attempt":2,"delay":600}"#);
    }
}
