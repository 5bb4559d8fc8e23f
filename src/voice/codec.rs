//! PCM16 / base64 conversion for the live audio transport.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

/// Amplify, clamp and convert f32 samples to little-endian PCM16, base64-encoded.
pub fn encode_frame(samples: &[f32], gain: f32) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&to_pcm16(sample * gain).to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Asymmetric scaling so -1.0 maps to i16::MIN and 1.0 to i16::MAX.
fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Decode a base64 PCM16 chunk into f32 samples in [-1, 1).
///
/// Malformed base64 yields an empty chunk; a trailing odd byte is ignored.
pub fn decode_chunk(data: &str) -> Vec<f32> {
    let bytes = match STANDARD.decode(data.trim()) {
        Ok(b) => b,
        Err(e) => {
            debug!("Dropping undecodable audio chunk: {e}");
            return Vec::new();
        }
    };
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Playback duration in seconds of `samples` mono samples.
pub fn duration_secs(samples: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    samples as f64 / f64::from(sample_rate)
}
