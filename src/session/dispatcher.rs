//! # Conversation State
//!
//! The text side of message dispatch: partial and final transcripts, the
//! accumulating response, and in-flight tool calls. Each handler updates only
//! the state its message type implies and returns the event to publish.
//!
//! ## Replacement vs. Accumulation:
//! - A partial transcript is a complete re-hypothesis, so it *replaces* the
//!   previous partial
//! - Response deltas are token fragments, so they *append*

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::session::events::{SessionEvent, ToolCallEvent};

#[derive(Debug, Default)]
pub struct Dispatcher {
    partial_transcript: String,
    response: String,
    /// call_id → tool name
    pending_tools: HashMap<String, String>,
    utterances: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript_delta(&mut self, text: String) -> SessionEvent {
        self.partial_transcript = text.clone();
        SessionEvent::PartialTranscript { text }
    }

    pub fn transcript_complete(&mut self, text: String) -> SessionEvent {
        self.partial_transcript.clear();
        self.utterances += 1;
        debug!(utterance = self.utterances, chars = text.len(), "utterance committed");
        SessionEvent::FinalTranscript { text }
    }

    pub fn response_delta(&mut self, delta: String) -> SessionEvent {
        self.response.push_str(&delta);
        SessionEvent::ResponseDelta {
            delta,
            accumulated: self.response.clone(),
        }
    }

    /// Finish the response. The server's full text wins over the local buffer.
    pub fn response_complete(&mut self, text: Option<String>) -> SessionEvent {
        let buffered = std::mem::take(&mut self.response);
        let text = text.filter(|t| !t.is_empty()).unwrap_or(buffered);
        SessionEvent::ResponseComplete { text }
    }

    /// Interrupted response: the unspoken remainder is no longer part of it.
    pub fn truncated(&mut self, spoken: String, unspoken: String) -> SessionEvent {
        self.response.clear();
        SessionEvent::Truncated { spoken, unspoken }
    }

    pub fn tool_call_started(&mut self, call_id: String, name: String, arguments: Value) -> SessionEvent {
        self.pending_tools.insert(call_id.clone(), name.clone());
        SessionEvent::ToolCall(ToolCallEvent::Started {
            call_id,
            name,
            arguments,
        })
    }

    pub fn tool_call_completed(&mut self, call_id: String, result: Value) -> SessionEvent {
        let name = self.take_tool(&call_id);
        SessionEvent::ToolCall(ToolCallEvent::Completed { call_id, name, result })
    }

    pub fn tool_call_failed(&mut self, call_id: String, message: String) -> SessionEvent {
        let name = self.take_tool(&call_id);
        warn!(call_id = %call_id, tool = ?name, error = %message, "tool call failed");
        SessionEvent::ToolCall(ToolCallEvent::Failed { call_id, name, message })
    }

    fn take_tool(&mut self, call_id: &str) -> Option<String> {
        let name = self.pending_tools.remove(call_id);
        if name.is_none() {
            debug!(call_id, "tool call finished without a recorded start");
        }
        name
    }

    /// Put back partial state a resumed session was carrying.
    pub fn restore(&mut self, partial_transcript: String, partial_response: String) {
        self.partial_transcript = partial_transcript;
        self.response = partial_response;
    }

    /// Drop state tied to the previous connection.
    pub fn reset(&mut self) {
        if !self.pending_tools.is_empty() {
            debug!(abandoned = self.pending_tools.len(), "clearing pending tool calls");
        }
        self.partial_transcript.clear();
        self.response.clear();
        self.pending_tools.clear();
    }

    pub fn partial_transcript(&self) -> &str {
        &self.partial_transcript
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.pending_tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_transcript_replaces() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.transcript_delta("Hel".to_string());
        let event = dispatcher.transcript_delta("Hello".to_string());
        assert_eq!(event, SessionEvent::PartialTranscript { text: "Hello".into() });
        assert_eq!(dispatcher.partial_transcript(), "Hello");

        dispatcher.transcript_complete("Hello there".to_string());
        assert_eq!(dispatcher.partial_transcript(), "");
    }

    #[test]
    fn test_response_accumulates_then_clears() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.response_delta("Hi".to_string());
        let event = dispatcher.response_delta(", you".to_string());
        assert_eq!(
            event,
            SessionEvent::ResponseDelta {
                delta: ", you".into(),
                accumulated: "Hi, you".into()
            }
        );

        let done = dispatcher.response_complete(None);
        assert_eq!(done, SessionEvent::ResponseComplete { text: "Hi, you".into() });
        assert_eq!(dispatcher.response(), "");

        dispatcher.response_delta("partial".to_string());
        let done = dispatcher.response_complete(Some("full text".to_string()));
        assert_eq!(done, SessionEvent::ResponseComplete { text: "full text".into() });
    }

    #[test]
    fn test_tool_call_lifecycle() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.tool_call_started("c1".into(), "search".into(), json!({"q": "rust"}));
        assert_eq!(dispatcher.pending_tool_calls(), 1);

        let event = dispatcher.tool_call_completed("c1".into(), json!(["a"]));
        assert!(matches!(
            event,
            SessionEvent::ToolCall(ToolCallEvent::Completed { ref name, .. }) if name.as_deref() == Some("search")
        ));
        assert_eq!(dispatcher.pending_tool_calls(), 0);

        dispatcher.tool_call_started("c2".into(), "weather".into(), Value::Null);
        dispatcher.reset();
        assert_eq!(dispatcher.pending_tool_calls(), 0);
    }
}
