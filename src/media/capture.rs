use super::codec;
use super::device::AudioFrame;
use crate::protocol::models::{MediaChunk, pcm_mime_type};

/// Scale applied to the RMS before clamping to the 0-100 meter range.
pub const VOLUME_SCALE: f32 = 400.0;
pub const MAX_LEVEL: f32 = 100.0;

/// PCM16 bytes ready for transport, in capture order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioChunk {
    pub seq: u64,
    pub sample_rate: u32,
    pub data: Vec<u8>,
}

impl EncodedAudioChunk {
    #[must_use]
    pub fn mime_type(&self) -> String {
        pcm_mime_type(self.sample_rate)
    }

    #[must_use]
    pub fn to_media(&self) -> MediaChunk {
        MediaChunk::pcm(&self.data, self.sample_rate)
    }
}

/// Result of one capture callback.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutput {
    /// Meter level in [0, 100].
    pub level: f32,
    /// `None` while the microphone is muted.
    pub chunk: Option<EncodedAudioChunk>,
}

/// Turns capture callbacks into a volume level and outbound PCM chunks.
///
/// Muting never stops capture: the level keeps updating and only the chunk is
/// withheld.
#[derive(Debug, Clone)]
pub struct AudioCaptureEncoder {
    sample_rate: u32,
    mic_enabled: bool,
    scale: f32,
    next_seq: u64,
}

impl AudioCaptureEncoder {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            mic_enabled: true,
            scale: VOLUME_SCALE,
            next_seq: 0,
        }
    }

    #[must_use]
    pub const fn with_volume_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn mic_enabled(&self) -> bool {
        self.mic_enabled
    }

    pub const fn set_mic_enabled(&mut self, enabled: bool) {
        self.mic_enabled = enabled;
    }

    pub fn process(&mut self, frame: &AudioFrame) -> CaptureOutput {
        if frame.sample_rate != self.sample_rate {
            tracing::debug!(
                frame_rate = frame.sample_rate,
                session_rate = self.sample_rate,
                "Capture frame rate differs from session rate"
            );
        }
        let level = volume_level(&frame.samples, self.scale);
        if !self.mic_enabled || frame.samples.is_empty() {
            return CaptureOutput { level, chunk: None };
        }
        let chunk = EncodedAudioChunk {
            seq: self.next_seq,
            sample_rate: self.sample_rate,
            data: codec::encode(&frame.samples),
        };
        self.next_seq += 1;
        CaptureOutput { level, chunk: Some(chunk) }
    }
}

/// `clamp(rms * scale, 0, 100)`; non-finite input reads as silence.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn volume_level(samples: &[f32], scale: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_square = samples
        .iter()
        .map(|s| f64::from(*s) * f64::from(*s))
        .sum::<f64>()
        / samples.len() as f64;
    #[allow(clippy::cast_possible_truncation)]
    let level = (mean_square.sqrt() as f32) * scale;
    if level.is_nan() {
        return 0.0;
    }
    level.clamp(0.0, MAX_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn muted_encoder_reports_level_without_chunk() {
        let mut encoder = AudioCaptureEncoder::new(16_000);
        encoder.set_mic_enabled(false);
        let out = encoder.process(&AudioFrame::new(vec![0.1; 256], 16_000));
        assert!(out.chunk.is_none());
        assert!(out.level > 0.0);
    }

    #[test]
    fn chunks_are_sequenced_and_tagged() {
        let mut encoder = AudioCaptureEncoder::new(16_000);
        let first = encoder.process(&AudioFrame::new(vec![0.0; 4], 16_000)).chunk.unwrap();
        encoder.set_mic_enabled(false);
        let _ = encoder.process(&AudioFrame::new(vec![0.0; 4], 16_000));
        encoder.set_mic_enabled(true);
        let second = encoder.process(&AudioFrame::new(vec![0.0; 4], 16_000)).chunk.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(second.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(second.data.len(), 8);
    }

    #[test]
    fn level_is_bounded() {
        assert!((volume_level(&[1.0; 64], VOLUME_SCALE) - MAX_LEVEL).abs() < f32::EPSILON);
        assert!(volume_level(&[], VOLUME_SCALE).abs() < f32::EPSILON);
        assert!(volume_level(&[f32::NAN, 0.5], VOLUME_SCALE).abs() < f32::EPSILON);
        assert!((volume_level(&[f32::INFINITY], VOLUME_SCALE) - MAX_LEVEL).abs() < f32::EPSILON);
    }
}
