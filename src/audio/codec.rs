//! Conversion between f32 PCM samples and the wire's base64 PCM16 encoding

use crate::{RealtalkError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;

/// Immutable block of decoded mono PCM samples
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Shared handle to the samples, for handing to the render path
    pub fn shared_samples(&self) -> Arc<[f32]> {
        Arc::clone(&self.samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nominal playback duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// One block of encoded microphone audio, ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Base64 of little-endian signed 16-bit PCM
    pub data: String,
    pub sample_rate: u32,
}

impl EncodedChunk {
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Convert f32 samples to little-endian PCM16 bytes
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let value = if clamped < 0.0 {
            (clamped * 32768.0) as i16
        } else {
            (clamped * 32767.0) as i16
        };
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Convert little-endian PCM16 bytes to f32 samples; a trailing odd byte is dropped
pub fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode a captured block for the wire
pub fn encode_chunk(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    EncodedChunk {
        data: BASE64.encode(f32_to_pcm16_bytes(samples)),
        sample_rate,
    }
}

/// Decode an inbound base64 PCM16 payload into a frame at `sample_rate`
pub fn decode_frame(data: &str, sample_rate: u32) -> Result<AudioFrame> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| RealtalkError::CodecError(format!("Invalid base64 audio payload: {}", e)))?;
    Ok(AudioFrame::new(pcm16_bytes_to_f32(&bytes), sample_rate))
}
