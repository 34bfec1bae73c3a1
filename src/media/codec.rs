//! Conversion between floating point samples and 16-bit little-endian PCM.

const NEGATIVE_SCALE: f32 = 32768.0;
const POSITIVE_SCALE: f32 = 32767.0;

/// Encode samples in [-1, 1] as signed 16-bit little-endian PCM.
///
/// Out-of-range samples are clamped. Negative values scale by 32768 and
/// non-negative values by 32767 so that -1.0 maps to `i16::MIN` and 1.0 to
/// `i16::MAX` without overflow. NaN encodes as silence.
#[must_use]
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    out
}

#[allow(clippy::cast_possible_truncation)]
fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * NEGATIVE_SCALE } else { s * POSITIVE_SCALE };
    scaled as i16
}

/// Decode 16-bit little-endian PCM into samples in [-1, 1).
///
/// A trailing odd byte is ignored rather than treated as an error.
#[must_use]
pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / NEGATIVE_SCALE)
        .collect()
}

/// Number of whole samples in a PCM16 byte buffer.
#[must_use]
pub const fn sample_count(byte_len: usize) -> usize {
    byte_len / 2
}

/// Playback duration in seconds of a PCM16 mono buffer at `sample_rate`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn duration_secs(byte_len: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count(byte_len) as f64 / f64::from(sample_rate)
}
