//! # Binary Audio Frames
//!
//! Binary WebSocket frames carry raw audio with a fixed 5-byte header:
//!
//! ```text
//! +------+-------------------+----------------------+
//! | type | seq (u32, BE)     | payload (PCM16 LE)   |
//! +------+-------------------+----------------------+
//!   1 B         4 B               remaining bytes
//! ```
//!
//! - `0x01`: microphone audio, client → server
//! - `0x02`: synthesized audio, server → client

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{EngineError, EngineResult};

pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    AudioInput,
    AudioOutput,
}

impl FrameType {
    pub fn tag(self) -> u8 {
        match self {
            FrameType::AudioInput => 0x01,
            FrameType::AudioOutput => 0x02,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(FrameType::AudioInput),
            0x02 => Some(FrameType::AudioOutput),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub frame_type: FrameType,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn new(frame_type: FrameType, seq: u32, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            seq,
            payload,
        }
    }

    /// Serialize header and payload into a single frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.frame_type.tag());
        // Writing into a Vec cannot fail
        let _ = out.write_u32::<BigEndian>(self.seq);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a binary frame.
    ///
    /// ## Errors:
    /// - frame shorter than the header
    /// - unknown type tag
    pub fn decode(data: &[u8]) -> EngineResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(EngineError::Protocol(format!(
                "binary frame too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let tag = cursor.read_u8()?;
        let frame_type = FrameType::from_tag(tag)
            .ok_or_else(|| EngineError::Protocol(format!("unknown frame type 0x{:02x}", tag)))?;
        let seq = cursor.read_u32::<BigEndian>()?;

        Ok(Self {
            frame_type,
            seq,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }
}
