//! # Audio Module
//!
//! Everything between the wire and the speaker (and the microphone and the
//! wire).
//!
//! ## Key Components:
//! - **Chunks**: decoding PCM16 payloads into owned float buffers
//! - **Processor**: crossfades and capture encoding
//! - **Scheduler**: gapless placement of chunks on the output clock
//! - **Output / Capture**: the device boundaries, plus headless implementations
//! - **Devices**: the factory a session uses to open both
//!
//! ## Audio Formats:
//! - **Input**: 16 kHz mono, sent upstream as PCM16 LE
//! - **Output**: 24 kHz mono, received as PCM16 LE

pub mod capture;
pub mod chunk;
pub mod devices;
pub mod output;
pub mod processor;
pub mod scheduler;
