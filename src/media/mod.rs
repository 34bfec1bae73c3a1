pub mod capture;
pub mod codec;
#[cfg(feature = "cpal")]
pub mod cpal_backend;
pub mod device;
pub mod playback;
pub mod video;

pub use capture::{AudioCaptureEncoder, CaptureOutput, EncodedAudioChunk, volume_level};
#[cfg(feature = "cpal")]
pub use cpal_backend::CpalDevices;
pub use device::{
    AudioFrame, AudioOutput, AudioTrack, DeviceArbiter, DeviceLease, DeviceOwner, MediaDevices,
    NoDevices, NullOutput, VideoInput,
};
pub use playback::{PlaybackItem, PlaybackScheduler, PlayoutBuffer};
pub use video::{VideoFrame, VideoFrameSampler};
