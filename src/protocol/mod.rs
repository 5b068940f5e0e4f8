//! # Protocol Layer
//!
//! Everything that touches the wire format: JSON text messages, the binary
//! audio frame codec, and the sequence reordering layer that sits between the
//! transport and the dispatcher.

pub mod frame;
pub mod messages;
pub mod reorder;
