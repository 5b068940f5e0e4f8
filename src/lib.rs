//! # Voice Session Engine
//!
//! Client-side engine for real-time voice conversations with a streaming
//! speech pipeline (speech-to-text, language model, text-to-speech) over a
//! single bidirectional connection.
//!
//! ## Module Layout:
//! - **config**: layered configuration (defaults, `voice.toml`, environment)
//! - **error**: the engine's error type and recoverability rules
//! - **protocol**: JSON messages, binary audio frames, sequence reordering
//! - **transport**: the connection boundary and its WebSocket implementation
//! - **audio**: chunk decoding, gapless playback scheduling, device boundaries
//! - **barge_in**: deciding when the user's voice cuts off the assistant
//! - **metrics**: latency measurements and counters
//! - **session**: the session state machine and its supporting pieces
//! - **runtime**: a tokio task that drives a session

pub mod audio;
pub mod barge_in;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod transport;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use runtime::{EventStream, SessionHandle, SessionRuntime};
pub use session::{ConnectionStatus, PipelineState, SessionEngine, SessionEvent};
