//! # Wire Messages
//!
//! JSON text-frame messages exchanged with the voice pipeline backend.
//!
//! ## Message Format:
//! Every text frame is a JSON object with a `type` discriminator and an
//! optional `seq` number. Messages with `seq` must reach the dispatcher in
//! strictly increasing order; control messages (ping, pong, handshake)
//! usually omit it and bypass ordering.
//!
//! ## Direction:
//! - **Server → Client**: [`ServerMessage`], wrapped in an [`Envelope`] once decoded
//! - **Client → Server**: [`ClientMessage`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

pub const FEATURE_BINARY_AUDIO: &str = "binary_audio";
pub const FEATURE_MESSAGE_BATCHING: &str = "message_batching";
pub const FEATURE_AUDIO_PREBUFFER: &str = "audio_prebuffer";
pub const FEATURE_ADAPTIVE_CHUNKING: &str = "adaptive_chunking";
pub const FEATURE_SESSION_PERSISTENCE: &str = "session_persistence";
pub const FEATURE_GRACEFUL_DEGRADATION: &str = "graceful_degradation";

/// Capabilities offered in `session.init`.
pub const SUPPORTED_FEATURES: &[&str] = &[
    FEATURE_BINARY_AUDIO,
    FEATURE_MESSAGE_BATCHING,
    FEATURE_AUDIO_PREBUFFER,
    FEATURE_ADAPTIVE_CHUNKING,
    FEATURE_SESSION_PERSISTENCE,
    FEATURE_GRACEFUL_DEGRADATION,
];

pub const PROTOCOL_VERSION: u32 = 2;

/// Messages sent by the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Capability negotiation answer
    #[serde(rename = "session.init.ack")]
    SessionInitAck {
        #[serde(default)]
        features: Vec<String>,
        #[serde(default)]
        protocol_version: Option<u32>,
    },

    /// Session is live; carries the server-issued id
    #[serde(rename = "session.ready")]
    SessionReady {
        session_id: String,
        #[serde(default, alias = "resumable")]
        recovery_eligible: bool,
    },

    #[serde(rename = "session.resume.ack")]
    SessionResumeAck {
        session_id: String,
    },

    #[serde(rename = "session.resume.nak")]
    SessionResumeNak {
        #[serde(default)]
        reason: Option<String>,
    },

    /// Partial hypothesis; replaces the previous partial
    #[serde(rename = "transcript.delta")]
    TranscriptDelta { text: String },

    #[serde(rename = "transcript.complete")]
    TranscriptComplete { text: String },

    /// Barge-in acknowledgement: what was audibly spoken vs. cut off
    #[serde(rename = "transcript.truncated")]
    TranscriptTruncated {
        spoken_text: String,
        #[serde(default)]
        unspoken_text: String,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.delta")]
    ResponseDelta { delta: String },

    #[serde(rename = "response.complete")]
    ResponseComplete {
        #[serde(default)]
        text: Option<String>,
    },

    /// Base64 PCM16 audio, used when binary framing is not negotiated
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(alias = "delta")]
        audio: String,
        #[serde(default, rename = "final")]
        is_final: bool,
    },

    /// No more audio for the current utterance
    #[serde(rename = "response.audio.done")]
    AudioDone {},

    #[serde(rename = "voice.state", alias = "pipeline.state")]
    PipelineState {
        state: String,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},

    #[serde(rename = "tool.call.start")]
    ToolCallStart {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },

    #[serde(rename = "tool.call.complete")]
    ToolCallComplete {
        call_id: String,
        #[serde(default)]
        result: Value,
    },

    #[serde(rename = "tool.call.error")]
    ToolCallError { call_id: String, message: String },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        timestamp: i64,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: i64,
    },

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(default)]
        recoverable: bool,
    },

    /// Several logical messages in one frame, already in order
    #[serde(rename = "batch")]
    Batch {
        messages: Vec<Value>,
        #[serde(default)]
        count: Option<usize>,
    },

    /// A type this client does not know; kept so its `seq` still advances ordering
    #[serde(skip)]
    Unknown { kind: String },
}

/// Wire names of every variant above except `Unknown`.
const KNOWN_TYPES: &[&str] = &[
    "session.init.ack",
    "session.ready",
    "session.resume.ack",
    "session.resume.nak",
    "transcript.delta",
    "transcript.complete",
    "transcript.truncated",
    "response.created",
    "response.delta",
    "response.complete",
    "response.audio.delta",
    "response.audio.done",
    "voice.state",
    "pipeline.state",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "tool.call.start",
    "tool.call.complete",
    "tool.call.error",
    "ping",
    "pong",
    "error",
    "batch",
];

/// A decoded server message plus its ordering metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub seq: Option<u64>,
    pub kind: String,
    pub message: ServerMessage,
}

impl Envelope {
    /// Decode one text frame.
    ///
    /// ## Returns:
    /// - **Ok(envelope)**: known message, or `ServerMessage::Unknown` for a type
    ///   this client does not recognise
    /// - **Err(Protocol)**: not JSON, no `type`, or a known type with a bad shape
    pub fn decode(text: &str) -> EngineResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON object (used for batch members).
    pub fn from_value(value: Value) -> EngineResult<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Protocol("message has no type field".to_string()))?
            .to_string();
        let seq = value.get("seq").and_then(Value::as_u64);

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(Self {
                seq,
                message: ServerMessage::Unknown { kind: kind.clone() },
                kind,
            });
        }

        let message = serde_json::from_value::<ServerMessage>(value)
            .map_err(|e| EngineError::Protocol(format!("malformed {}: {}", kind, e)))?;
        Ok(Self { seq, kind, message })
    }

    /// Stand-in for a message that failed to decode, carrying only its
    /// sequence number so ordering can move past it. `None` without a `seq`.
    pub fn placeholder(value: &Value) -> Option<Self> {
        let seq = value.get("seq").and_then(Value::as_u64)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("malformed").to_string();
        Some(Self {
            seq: Some(seq),
            message: ServerMessage::Unknown { kind: kind.clone() },
            kind,
        })
    }
}

/// Audio formats announced during negotiation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFormat {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub encoding: &'static str,
}

/// Messages sent by this client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.init")]
    SessionInit {
        client_id: String,
        protocol_version: u32,
        features: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<String>,
        audio: AudioFormat,
    },

    #[serde(rename = "session.resume")]
    SessionResume {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        last_seq: Option<u64>,
        last_audio_seq: Option<u64>,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Cancel the in-flight response
    #[serde(rename = "barge_in")]
    BargeIn { reason: String, timestamp: i64 },

    /// Base64 PCM16 microphone audio (text fallback for binary frames)
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    /// Manual end of utterance
    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit {},

    #[serde(rename = "text.input")]
    TextInput { text: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_with_and_without_seq() {
        let env = Envelope::decode(r#"{"type":"transcript.delta","seq":4,"text":"Hel"}"#).unwrap();
        assert_eq!(env.seq, Some(4));
        assert_eq!(env.message, ServerMessage::TranscriptDelta { text: "Hel".into() });

        let env = Envelope::decode(r#"{"type":"ping","timestamp":17}"#).unwrap();
        assert_eq!(env.seq, None);
        assert_eq!(env.message, ServerMessage::Ping { timestamp: 17 });
    }

    #[test]
    fn test_pipeline_state_alias() {
        let env = Envelope::decode(r#"{"type":"pipeline.state","state":"speaking"}"#).unwrap();
        assert!(matches!(
            env.message,
            ServerMessage::PipelineState { ref state, reason: None } if state == "speaking"
        ));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let env = Envelope::decode(r#"{"type":"future.thing","seq":9,"x":1}"#).unwrap();
        assert_eq!(env.seq, Some(9));
        assert_eq!(env.message, ServerMessage::Unknown { kind: "future.thing".into() });
    }

    #[test]
    fn test_malformed_known_type_is_protocol_error() {
        let err = Envelope::decode(r#"{"type":"session.ready"}"#).unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"seq":1}"#).is_err());
    }

    #[test]
    fn test_placeholder_keeps_sequence_of_malformed_message() {
        let value: Value = serde_json::from_str(r#"{"type":"response.delta","seq":3}"#).unwrap();
        assert!(Envelope::from_value(value.clone()).is_err());

        let hole = Envelope::placeholder(&value).unwrap();
        assert_eq!(hole.seq, Some(3));
        assert_eq!(hole.message, ServerMessage::Unknown { kind: "response.delta".into() });

        let unsequenced: Value = serde_json::from_str(r#"{"type":"response.delta"}"#).unwrap();
        assert!(Envelope::placeholder(&unsequenced).is_none());
    }

    #[test]
    fn test_client_message_serialization() {
        let msg = ClientMessage::BargeIn {
            reason: "local_vad".to_string(),
            timestamp: 42,
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"barge_in""#));
        assert!(json.contains("local_vad"));

        let init = ClientMessage::SessionInit {
            client_id: "c1".into(),
            protocol_version: PROTOCOL_VERSION,
            features: vec![FEATURE_BINARY_AUDIO.to_string()],
            conversation_id: None,
            resume_session_id: None,
            audio: AudioFormat {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                encoding: "pcm16",
            },
        };
        let json = init.to_json().unwrap();
        assert!(json.contains(r#""type":"session.init""#));
        assert!(!json.contains("conversation_id"));
    }
}
