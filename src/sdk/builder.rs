use std::sync::Arc;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::media::{DeviceArbiter, MediaDevices, VideoFrameSampler};
use crate::protocol::models::{DEFAULT_MODEL, Modality, OUTPUT_SAMPLE_RATE, SetupConfig};
use crate::transport::ws::DEFAULT_ENDPOINT;
use crate::{Error, RealtimeClient, Result};

use super::session::{Session, SessionOptions};
use super::tools::ToolRegistry;
use super::transport::{Transport, WsTransport};

pub struct Realtime;

impl Realtime {
    #[must_use]
    pub fn builder() -> RealtimeBuilder {
        RealtimeBuilder::new()
    }
}

pub struct RealtimeBuilder {
    api_key: Option<String>,
    endpoint: String,
    model: Option<String>,
    voice: Option<String>,
    system_prompt: Option<String>,
    modality: Modality,
    tools: ToolRegistry,
    devices: Arc<dyn MediaDevices>,
    arbiter: DeviceArbiter,
    camera: bool,
    video: VideoFrameSampler,
    output_sample_rate: u32,
}

impl RealtimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: None,
            voice: None,
            system_prompt: None,
            modality: Modality::Audio,
            tools: ToolRegistry::new(),
            devices: default_devices(),
            arbiter: DeviceArbiter::new(),
            camera: false,
            video: VideoFrameSampler::default(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }

    /// Start from environment-derived settings.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        let mut builder = Self::new().endpoint(config.endpoint.clone()).model(config.model.clone());
        builder.api_key.clone_from(&config.api_key);
        builder
    }

    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub const fn output_audio(mut self) -> Self {
        self.modality = Modality::Audio;
        self
    }

    #[must_use]
    pub const fn output_text(mut self) -> Self {
        self.modality = Modality::Text;
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = devices;
        self
    }

    /// Share capture-device ownership with a call agent.
    #[must_use]
    pub fn arbiter(mut self, arbiter: DeviceArbiter) -> Self {
        self.arbiter = arbiter;
        self
    }

    #[must_use]
    pub const fn camera(mut self, enabled: bool) -> Self {
        self.camera = enabled;
        self
    }

    #[must_use]
    pub fn video_interval(mut self, interval: Duration) -> Self {
        self.video = VideoFrameSampler::new(interval);
        self
    }

    #[must_use]
    pub fn video_sampler(mut self, sampler: VideoFrameSampler) -> Self {
        self.video = sampler;
        self
    }

    #[must_use]
    pub const fn output_sample_rate(mut self, rate: u32) -> Self {
        self.output_sample_rate = rate;
        self
    }

    fn options(&mut self) -> SessionOptions {
        let mut setup = SetupConfig::new(self.model.take().unwrap_or_else(|| DEFAULT_MODEL.to_string()));
        setup.voice = self.voice.take();
        setup.system_instruction = self.system_prompt.take();
        setup.response_modalities = vec![self.modality];
        SessionOptions {
            setup,
            tools: std::mem::take(&mut self.tools),
            camera: self.camera,
            video: self.video.clone(),
            output_sample_rate: self.output_sample_rate,
        }
    }

    /// Connect to the streaming service over WebSocket.
    ///
    /// # Errors
    /// Returns an error if no API key is set, the connection fails, or the
    /// session cannot be opened (see [`Session::open`]).
    pub async fn connect_ws(self) -> Result<Session> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(Error::Config("api_key required".to_string()));
        };
        let client = RealtimeClient::connect(&self.endpoint, &api_key)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        self.connect_with(Box::new(WsTransport::new(client))).await
    }

    /// Open a session over a caller-supplied transport.
    ///
    /// # Errors
    /// See [`Session::open`].
    pub async fn connect_with(mut self, transport: Box<dyn Transport>) -> Result<Session> {
        let options = self.options();
        Session::open(transport, options, self.devices.as_ref(), &self.arbiter).await
    }
}

impl Default for RealtimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cpal")]
fn default_devices() -> Arc<dyn MediaDevices> {
    Arc::new(crate::media::CpalDevices)
}

#[cfg(not(feature = "cpal"))]
fn default_devices() -> Arc<dyn MediaDevices> {
    Arc::new(crate::media::NoDevices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_carry_persona_and_modality() {
        let mut builder = Realtime::builder()
            .model("models/custom")
            .voice("Kore")
            .system_prompt("Be brief.")
            .output_text()
            .camera(true);
        let options = builder.options();
        assert_eq!(options.setup.model, "models/custom");
        assert_eq!(options.setup.voice.as_deref(), Some("Kore"));
        assert_eq!(options.setup.system_instruction.as_deref(), Some("Be brief."));
        assert_eq!(options.setup.response_modalities, vec![Modality::Text]);
        assert!(options.camera);
    }

    #[tokio::test]
    async fn connect_without_api_key_is_a_config_error() {
        let err = Realtime::builder().connect_ws().await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
