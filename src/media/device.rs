//! Capture and playback device seams, plus exclusive ownership of the capture device.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::playback::PlaybackItem;
use crate::{Error, Result};

/// Samples per capture callback.
pub const DEFAULT_FRAME_SAMPLES: usize = 4096;
pub const DEFAULT_CAPTURE_RATE: u32 = 16_000;

pub(crate) const FRAME_CHANNEL_CAPACITY: usize = 64;

/// One capture callback worth of mono samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }
}

type Stopper = Box<dyn FnOnce() + Send>;

/// A live microphone feed: frames arrive on a channel at device cadence.
pub struct AudioTrack {
    sample_rate: u32,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    stopper: Option<Stopper>,
    synthetic: bool,
}

impl AudioTrack {
    #[must_use]
    pub const fn new(sample_rate: u32, frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self {
            sample_rate,
            frames: Some(frames),
            stopper: None,
            synthetic: false,
        }
    }

    /// Attach the action that releases the underlying device.
    #[must_use]
    pub fn with_stopper(mut self, stop: impl FnOnce() + Send + 'static) -> Self {
        self.stopper = Some(Box::new(stop));
        self
    }

    /// A synthetic source producing silent frames at the normal capture cadence.
    ///
    /// Used when the real microphone cannot be acquired so that the rest of the
    /// pipeline keeps its timing. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn silent(sample_rate: u32, frame_samples: usize) -> Self {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let period = frame_period(sample_rate, frame_samples);
        let task: JoinHandle<()> = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let frame = AudioFrame::new(vec![0.0; frame_samples], sample_rate);
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        Self {
            sample_rate,
            frames: Some(rx),
            stopper: Some(Box::new(move || task.abort())),
            synthetic: true,
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Hand the frame receiver to the consumer. Yields `None` after the first call.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }

    /// Stop the device. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stopper.take() {
            stop();
        }
        self.frames = None;
    }
}

impl Drop for AudioTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrack")
            .field("sample_rate", &self.sample_rate)
            .field("synthetic", &self.synthetic)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_precision_loss)]
fn frame_period(sample_rate: u32, frame_samples: usize) -> Duration {
    if sample_rate == 0 {
        return Duration::from_millis(100);
    }
    Duration::from_secs_f64(frame_samples as f64 / f64::from(sample_rate))
}

/// A camera or screen source that can be snapshotted on demand.
pub trait VideoInput: Send {
    /// Current source dimensions; `(0, 0)` until the source has produced a frame.
    fn dimensions(&self) -> (u32, u32);

    fn snapshot(&mut self) -> Option<RgbaImage>;

    fn stop(&mut self) {}
}

/// Sink for decoded inbound audio with its own monotonic clock.
pub trait AudioOutput: Send {
    /// Seconds on the output clock.
    fn now(&self) -> f64;

    fn enqueue(&mut self, item: PlaybackItem);

    /// Drop everything queued but not yet played.
    fn clear(&mut self) {}
}

/// Output used when no speaker is available: keeps time, discards audio.
#[derive(Debug)]
pub struct NullOutput {
    origin: Instant,
}

impl NullOutput {
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for NullOutput {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn enqueue(&mut self, item: PlaybackItem) {
        tracing::trace!(seq = item.seq, "Discarding playback item without output device");
    }
}

/// Platform device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// # Errors
    /// Returns [`Error::MicrophoneUnavailable`] if the microphone cannot be opened.
    async fn open_microphone(&self) -> Result<AudioTrack>;

    /// # Errors
    /// Returns an error if no output device can be opened.
    #[allow(clippy::result_large_err)]
    fn open_speaker(&self, sample_rate: u32) -> Result<Box<dyn AudioOutput>>;

    /// # Errors
    /// Returns an error if no camera can be opened.
    #[allow(clippy::result_large_err)]
    fn open_camera(&self) -> Result<Box<dyn VideoInput>> {
        Err(Error::MediaUnavailable("no camera".to_string()))
    }
}

/// Devices that never succeed, so sessions run fully degraded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevices;

#[async_trait]
impl MediaDevices for NoDevices {
    async fn open_microphone(&self) -> Result<AudioTrack> {
        Err(Error::MicrophoneUnavailable("no capture device".to_string()))
    }

    fn open_speaker(&self, _sample_rate: u32) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(NullOutput::new()))
    }
}

/// Which subsystem currently holds the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceOwner {
    StreamingSession = 1,
    Call = 2,
}

impl DeviceOwner {
    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::StreamingSession),
            2 => Some(Self::Call),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StreamingSession => "the streaming session",
            Self::Call => "a call",
        }
    }
}

const FREE: u8 = 0;

/// Serializes ownership of the capture device between the streaming session
/// and calls. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct DeviceArbiter {
    owner: Arc<AtomicU8>,
}

impl DeviceArbiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the device for `owner`. The lease releases it on drop.
    ///
    /// # Errors
    /// Returns [`Error::DeviceBusy`] if another owner holds the device.
    #[allow(clippy::result_large_err)]
    pub fn acquire(&self, owner: DeviceOwner) -> Result<DeviceLease> {
        match self
            .owner
            .compare_exchange(FREE, owner as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                tracing::debug!(owner = owner.as_str(), "Capture device acquired");
                Ok(DeviceLease { owner, slot: Arc::clone(&self.owner) })
            }
            Err(current) => {
                let holder = DeviceOwner::from_raw(current).map_or("another consumer", DeviceOwner::as_str);
                Err(Error::DeviceBusy(holder))
            }
        }
    }

    #[must_use]
    pub fn current_owner(&self) -> Option<DeviceOwner> {
        DeviceOwner::from_raw(self.owner.load(Ordering::Acquire))
    }
}

/// Exclusive hold on the capture device.
#[derive(Debug)]
pub struct DeviceLease {
    owner: DeviceOwner,
    slot: Arc<AtomicU8>,
}

impl DeviceLease {
    #[must_use]
    pub const fn owner(&self) -> DeviceOwner {
        self.owner
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let _ = self
            .slot
            .compare_exchange(self.owner as u8, FREE, Ordering::AcqRel, Ordering::Acquire);
        tracing::debug!(owner = self.owner.as_str(), "Capture device released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbiter_is_exclusive_until_lease_drops() {
        let arbiter = DeviceArbiter::new();
        let lease = arbiter.acquire(DeviceOwner::Call).unwrap();
        assert_eq!(arbiter.current_owner(), Some(DeviceOwner::Call));

        let err = arbiter.acquire(DeviceOwner::StreamingSession).unwrap_err();
        assert!(matches!(err, Error::DeviceBusy(holder) if holder == "a call"));

        drop(lease);
        assert_eq!(arbiter.current_owner(), None);
        assert!(arbiter.acquire(DeviceOwner::StreamingSession).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_track_emits_zero_frames() {
        let mut track = AudioTrack::silent(16_000, 1600);
        assert!(track.is_synthetic());
        let mut frames = track.take_frames().unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.samples.len(), 1600);
        assert!(frame.samples.iter().all(|s| *s == 0.0));

        track.stop();
        tokio::time::advance(Duration::from_secs(1)).await;
        let mut remaining = 0;
        while frames.recv().await.is_some() {
            remaining += 1;
        }
        assert!(remaining <= FRAME_CHANNEL_CAPACITY);
    }
}
