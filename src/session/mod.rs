//! # Voice Session
//!
//! Everything that makes up one client session with the voice pipeline:
//!
//! - **status**: connection status machine and backend pipeline phase
//! - **engine**: the sans-I/O state machine that owns the session
//! - **dispatcher**: transcript, response and tool-call state
//! - **backoff**: exponential reconnect delays
//! - **recovery**: persisted records used to resume after a drop
//! - **events**: what the presentation layer is told

pub mod backoff;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod recovery;
pub mod status;

pub use engine::{Action, Session, SessionEngine};
pub use events::{SessionEvent, ToolCallEvent};
pub use status::{ConnectionStatus, PipelineState};
