//! # Audio Chunks
//!
//! Decodes synthesized speech arriving from the backend into owned sample
//! buffers ready for the playback scheduler.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 24kHz for output (the backend's TTS rate)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono
//! - **Encoding**: Little-endian signed integers, either raw in a binary frame
//!   or base64 inside a `response.audio.delta` text message
//!
//! ## Ownership:
//! An [`AudioChunk`] is moved into the scheduler queue on ingest and moved out
//! again when it is scheduled. It is never shared.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// One decoded piece of the output audio stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Samples normalized to [-1.0, 1.0)
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Binary-frame sequence number, if the chunk came in a binary frame
    pub seq: Option<u64>,
    /// Last chunk of the current utterance
    pub is_final: bool,
}

impl AudioChunk {
    /// Decode raw PCM16 little-endian bytes.
    ///
    /// ## Error Handling:
    /// Returns a protocol error if the payload has an odd length. An empty
    /// payload is allowed and produces an empty chunk (used as a bare
    /// end-of-stream marker by some servers).
    pub fn from_pcm_bytes(data: &[u8], sample_rate: u32, seq: Option<u64>) -> EngineResult<Self> {
        let samples = decode_pcm16(data)?;
        Ok(Self {
            samples: pcm_to_float(&samples),
            sample_rate,
            seq,
            is_final: false,
        })
    }

    /// Decode a base64 text representation of PCM16 LE bytes.
    pub fn from_base64(encoded: &str, sample_rate: u32, is_final: bool) -> EngineResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| EngineError::Protocol(format!("invalid base64 audio: {}", e)))?;
        let mut chunk = Self::from_pcm_bytes(&bytes, sample_rate, None)?;
        chunk.is_final = is_final;
        Ok(chunk)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length at the chunk's sample rate.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs())
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Convert raw bytes into 16-bit signed samples.
pub fn decode_pcm16(data: &[u8]) -> EngineResult<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(EngineError::Protocol(format!(
            "PCM16 payload length must be even, got {} bytes",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Scale from the i16 range to [-1.0, 1.0).
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_binary_pcm() {
        let bytes = pcm_bytes(&[0, 16384, -32768]);
        let chunk = AudioChunk::from_pcm_bytes(&bytes, 24_000, Some(3)).unwrap();
        assert_eq!(chunk.samples, vec![0.0, 0.5, -1.0]);
        assert_eq!(chunk.seq, Some(3));
        assert!(!chunk.is_final);
    }

    #[test]
    fn test_decode_base64_pcm() {
        let bytes = pcm_bytes(&[100; 240]);
        let encoded = BASE64.encode(&bytes);
        let chunk = AudioChunk::from_base64(&encoded, 24_000, true).unwrap();
        assert_eq!(chunk.len(), 240);
        assert!(chunk.is_final);
        assert!((chunk.duration_secs() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_odd_length_and_bad_base64() {
        assert!(AudioChunk::from_pcm_bytes(&[1, 2, 3], 24_000, None).is_err());
        assert!(AudioChunk::from_base64("***", 24_000, false).is_err());
    }
}
