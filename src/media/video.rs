use std::time::Duration;

use image::{DynamicImage, RgbaImage};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use super::device::VideoInput;
use crate::Result;
use crate::protocol::models::MediaChunk;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DIMENSION: u32 = 640;
pub const DEFAULT_JPEG_QUALITY: u8 = 70;

/// A compressed snapshot ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl VideoFrame {
    #[must_use]
    pub fn to_media(&self) -> MediaChunk {
        MediaChunk::jpeg(&self.jpeg)
    }
}

/// Periodic downscaled JPEG snapshots of a video source.
#[derive(Debug, Clone)]
pub struct VideoFrameSampler {
    interval: Duration,
    max_dimension: u32,
    quality: u8,
}

impl VideoFrameSampler {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_dimension: DEFAULT_MAX_DIMENSION,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    #[must_use]
    pub const fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    #[must_use]
    pub const fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Capture and encode one frame if sampling is allowed right now.
    ///
    /// Returns `Ok(None)` when the camera is off, the session is not open, or
    /// the source has no dimensions yet. Skipped ticks are dropped, not queued.
    ///
    /// # Errors
    /// Returns an error if JPEG encoding fails.
    #[allow(clippy::result_large_err)]
    pub fn sample(
        &self,
        source: &mut dyn VideoInput,
        camera_enabled: bool,
        session_open: bool,
    ) -> Result<Option<VideoFrame>> {
        self.capture(source, camera_enabled, session_open)
            .map(|snapshot| self.encode(snapshot))
            .transpose()
    }

    /// Take the raw snapshot half of [`VideoFrameSampler::sample`]. Cheap enough
    /// for the capture loop; hand the result to [`VideoFrameSampler::encode`]
    /// off the loop.
    pub fn capture(
        &self,
        source: &mut dyn VideoInput,
        camera_enabled: bool,
        session_open: bool,
    ) -> Option<RgbaImage> {
        if !camera_enabled || !session_open {
            return None;
        }
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return None;
        }
        source.snapshot()
    }

    /// Downscale and JPEG-encode a snapshot.
    ///
    /// # Errors
    /// Returns an error if JPEG encoding fails.
    #[allow(clippy::result_large_err)]
    pub fn encode(&self, snapshot: RgbaImage) -> Result<VideoFrame> {
        let image = DynamicImage::ImageRgba8(snapshot);
        let image = if image.width() > self.max_dimension || image.height() > self.max_dimension {
            image.resize(self.max_dimension, self.max_dimension, FilterType::Triangle)
        } else {
            image
        };
        // JPEG has no alpha channel.
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());

        let mut jpeg = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut jpeg, self.quality);
        rgb.write_with_encoder(encoder)?;
        Ok(VideoFrame {
            jpeg,
            width: rgb.width(),
            height: rgb.height(),
        })
    }
}

impl Default for VideoFrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCamera {
        image: Option<RgbaImage>,
    }

    impl VideoInput for StaticCamera {
        fn dimensions(&self) -> (u32, u32) {
            self.image.as_ref().map_or((0, 0), |i| (i.width(), i.height()))
        }

        fn snapshot(&mut self) -> Option<RgbaImage> {
            self.image.clone()
        }
    }

    #[test]
    fn downscales_to_max_dimension() {
        let mut camera = StaticCamera { image: Some(RgbaImage::new(1280, 720)) };
        let sampler = VideoFrameSampler::new(Duration::from_secs(5)).with_max_dimension(320);
        let frame = sampler.sample(&mut camera, true, true).unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (320, 180));
        assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(frame.to_media().mime_type, "image/jpeg");
    }

    #[test]
    fn skips_when_disabled_closed_or_empty() {
        let sampler = VideoFrameSampler::default();
        let mut camera = StaticCamera { image: Some(RgbaImage::new(8, 8)) };
        assert!(sampler.sample(&mut camera, false, true).unwrap().is_none());
        assert!(sampler.sample(&mut camera, true, false).unwrap().is_none());

        let mut blank = StaticCamera { image: None };
        assert!(sampler.sample(&mut blank, true, true).unwrap().is_none());
    }
}
