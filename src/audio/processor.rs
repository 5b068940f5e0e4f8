//! # Audio Processing
//!
//! Sample-level transforms applied between decode and scheduling, and between
//! capture and upload.
//!
//! ## Key Functions:
//! - **Crossfade**: short linear fade-in/out at chunk edges so independently
//!   decoded chunks butt together without clicks
//! - **Capture encoding**: float microphone blocks to PCM16 LE bytes
//! - **Format conversion**: float ↔ 16-bit PCM

use byteorder::{LittleEndian, WriteBytesExt};

/// A chunk must be at least this many fade lengths long to be faded.
const MIN_FADE_SPANS: usize = 4;

pub struct AudioProcessor {
    sample_rate: u32,
    crossfade_samples: usize,
}

impl AudioProcessor {
    /// Create a processor for one sample rate.
    ///
    /// ## Parameters:
    /// - **sample_rate**: rate of the chunks this processor will see
    /// - **crossfade_ms**: fade length; `None` disables crossfading
    pub fn new(sample_rate: u32, crossfade_ms: Option<f64>) -> Self {
        let crossfade_samples = crossfade_ms
            .map(|ms| ((ms / 1000.0) * sample_rate as f64).round() as usize)
            .unwrap_or(0);
        Self {
            sample_rate,
            crossfade_samples,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn crossfade_samples(&self) -> usize {
        self.crossfade_samples
    }

    /// Apply the configured edge fades in place.
    ///
    /// ## Method:
    /// Gain ramps linearly from 0 to 1 over the first `n` samples and from 1
    /// to 0 over the last `n`. Chunks shorter than four fade lengths are left
    /// untouched, since fading them would audibly duck most of the chunk.
    pub fn apply_crossfade(&self, samples: &mut [f32]) {
        let n = self.crossfade_samples;
        if n == 0 || samples.len() < n * MIN_FADE_SPANS {
            return;
        }

        let len = samples.len();
        for i in 0..n {
            let gain = i as f32 / n as f32;
            samples[i] *= gain;
            samples[len - 1 - i] *= gain;
        }
    }

    /// Encode a float capture block as PCM16 little-endian bytes.
    pub fn encode_capture_block(&self, samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * 2);
        for sample in float_to_pcm(samples) {
            // Writing into a Vec cannot fail
            let _ = out.write_i16::<LittleEndian>(sample);
        }
        out
    }
}

/// Convert 32-bit float samples back to 16-bit PCM, clamping out-of-range input.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| {
            let scaled = sample * 32768.0;
            scaled.clamp(-32768.0, 32767.0) as i16
        })
        .collect()
}
