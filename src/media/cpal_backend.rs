//! Default-host microphone and speaker backed by `cpal`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait as _, HostTrait as _, StreamTrait as _};
use cpal::{FromSample, Sample as _, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::device::{
    AudioFrame, AudioOutput, AudioTrack, DEFAULT_FRAME_SAMPLES, FRAME_CHANNEL_CAPACITY,
    MediaDevices,
};
use super::playback::{PlaybackItem, PlayoutBuffer};
use crate::{Error, Result};

const SPEAKER_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens the default input and output devices of the default host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn open_microphone(&self) -> Result<AudioTrack> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        // cpal streams are not Send, so the stream lives on its own thread
        // until the track is stopped.
        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_capture(frame_tx, ready_tx, stop_rx))
            .map_err(|e| Error::MicrophoneUnavailable(e.to_string()))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| Error::MicrophoneUnavailable("capture thread exited".to_string()))??;

        Ok(AudioTrack::new(sample_rate, frame_rx).with_stopper(move || {
            let _ = stop_tx.send(());
        }))
    }

    /// Items are resampled to the device rate by nearest sample, so
    /// `sample_rate` only matters for logging.
    fn open_speaker(&self, sample_rate: u32) -> Result<Box<dyn AudioOutput>> {
        let shared = Arc::new(Playout::default());
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let playout = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("speaker-playback".to_string())
            .spawn(move || run_playback(&playout, &ready_tx, &stop_rx))
            .map_err(|e| Error::MediaUnavailable(e.to_string()))?;

        let device_rate = ready_rx
            .recv_timeout(SPEAKER_OPEN_TIMEOUT)
            .map_err(|e| Error::MediaUnavailable(format!("speaker did not open: {e}")))??;
        tracing::info!(stream_rate = sample_rate, device_rate, "Speaker opened");

        Ok(Box::new(CpalOutput { shared, device_rate, stop_tx }))
    }
}

fn run_capture(
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<u32>>,
    stop_rx: oneshot::Receiver<()>,
) {
    let stream = match build_input(frame_tx) {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            stream
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let _ = stop_rx.blocking_recv();
    drop(stream);
    tracing::debug!("Microphone capture stopped");
}

#[allow(clippy::result_large_err)]
fn build_input(frame_tx: mpsc::Sender<AudioFrame>) -> Result<(cpal::Stream, u32)> {
    let unavailable = |e: &dyn std::fmt::Display| Error::MicrophoneUnavailable(e.to_string());

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MicrophoneUnavailable("no default input device".to_string()))?;
    let supported = device.default_input_config().map_err(|e| unavailable(&e))?;
    let format = supported.sample_format();
    let sample_rate = supported.sample_rate().0;
    let channels = usize::from(supported.channels().max(1));
    let config: StreamConfig = supported.into();

    tracing::info!(sample_rate, channels, ?format, "Opening microphone");

    let stream = match format {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, channels, sample_rate, frame_tx),
        SampleFormat::I16 => input_stream::<i16>(&device, &config, channels, sample_rate, frame_tx),
        SampleFormat::U16 => input_stream::<u16>(&device, &config, channels, sample_rate, frame_tx),
        SampleFormat::I32 => input_stream::<i32>(&device, &config, channels, sample_rate, frame_tx),
        other => Err(Error::MicrophoneUnavailable(format!("unsupported sample format {other:?}"))),
    }?;
    stream.play().map_err(|e| unavailable(&e))?;
    Ok((stream, sample_rate))
}

#[allow(clippy::result_large_err)]
fn input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    sample_rate: u32,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut pending: Vec<f32> = Vec::with_capacity(DEFAULT_FRAME_SAMPLES);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    #[allow(clippy::cast_precision_loss)]
                    let mono = frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>()
                        / frame.len() as f32;
                    pending.push(mono);
                    if pending.len() == DEFAULT_FRAME_SAMPLES {
                        let samples = std::mem::replace(
                            &mut pending,
                            Vec::with_capacity(DEFAULT_FRAME_SAMPLES),
                        );
                        // Never block the audio thread; a full channel drops the frame.
                        if frame_tx.try_send(AudioFrame::new(samples, sample_rate)).is_err() {
                            tracing::trace!("Dropping capture frame, consumer is behind");
                        }
                    }
                }
            },
            |err| tracing::warn!("Microphone stream error: {err}"),
            None,
        )
        .map_err(|e| Error::MicrophoneUnavailable(e.to_string()))
}

/// State shared between the session and the device callback.
#[derive(Default)]
struct Playout {
    buffer: Mutex<PlayoutBuffer>,
    /// Device frames rendered so far; the output clock.
    played_frames: AtomicU64,
}

struct CpalOutput {
    shared: Arc<Playout>,
    device_rate: u32,
    stop_tx: std_mpsc::Sender<()>,
}

impl AudioOutput for CpalOutput {
    #[allow(clippy::cast_precision_loss)]
    fn now(&self) -> f64 {
        self.shared.played_frames.load(Ordering::Acquire) as f64 / f64::from(self.device_rate)
    }

    fn enqueue(&mut self, item: PlaybackItem) {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    fn clear(&mut self) {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

fn run_playback(
    shared: &Arc<Playout>,
    ready_tx: &std_mpsc::SyncSender<Result<u32>>,
    stop_rx: &std_mpsc::Receiver<()>,
) {
    let stream = match build_output(shared) {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            stream
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    // Returns on stop or when the output handle is dropped.
    let _ = stop_rx.recv();
    drop(stream);
    tracing::debug!("Speaker playback stopped");
}

#[allow(clippy::result_large_err)]
fn build_output(shared: &Arc<Playout>) -> Result<(cpal::Stream, u32)> {
    let unavailable = |e: &dyn std::fmt::Display| Error::MediaUnavailable(e.to_string());

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::MediaUnavailable("no default output device".to_string()))?;
    let supported = device.default_output_config().map_err(|e| unavailable(&e))?;
    let format = supported.sample_format();
    let sample_rate = supported.sample_rate().0;
    let channels = usize::from(supported.channels().max(1));
    let config: StreamConfig = supported.into();

    let shared = Arc::clone(shared);
    let stream = match format {
        SampleFormat::F32 => output_stream::<f32>(&device, &config, channels, sample_rate, shared),
        SampleFormat::I16 => output_stream::<i16>(&device, &config, channels, sample_rate, shared),
        SampleFormat::U16 => output_stream::<u16>(&device, &config, channels, sample_rate, shared),
        SampleFormat::I32 => output_stream::<i32>(&device, &config, channels, sample_rate, shared),
        other => Err(Error::MediaUnavailable(format!("unsupported sample format {other:?}"))),
    }?;
    stream.play().map_err(|e| unavailable(&e))?;
    Ok((stream, sample_rate))
}

#[allow(clippy::result_large_err)]
fn output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    sample_rate: u32,
    shared: Arc<Playout>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut buffer = shared.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                let mut position = shared.played_frames.load(Ordering::Acquire);
                for frame in data.chunks_mut(channels) {
                    #[allow(clippy::cast_precision_loss)]
                    let clock = position as f64 / f64::from(sample_rate);
                    let value = T::from_sample(buffer.sample_at(clock));
                    frame.fill(value);
                    position += 1;
                }
                shared.played_frames.store(position, Ordering::Release);
            },
            |err| tracing::warn!("Speaker stream error: {err}"),
            None,
        )
        .map_err(|e| Error::MediaUnavailable(e.to_string()))
}
