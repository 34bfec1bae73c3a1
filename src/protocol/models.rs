use base64::Engine as _;
use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";
pub const DEFAULT_VOICE: &str = "Puck";

/// Native sample rate of synthesized audio coming back from the service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

pub const JPEG_MIME: &str = "image/jpeg";
const PCM_MIME_PREFIX: &str = "audio/pcm";

/// `audio/pcm;rate=<rate>`
#[must_use]
pub fn pcm_mime_type(rate: u32) -> String {
    format!("{PCM_MIME_PREFIX};rate={rate}")
}

/// A base64 media payload tagged with its MIME type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    #[must_use]
    pub fn pcm(bytes: &[u8], rate: u32) -> Self {
        Self {
            mime_type: pcm_mime_type(rate),
            data: general_purpose::STANDARD.encode(bytes),
        }
    }

    #[must_use]
    pub fn jpeg(bytes: &[u8]) -> Self {
        Self {
            mime_type: JPEG_MIME.to_string(),
            data: general_purpose::STANDARD.encode(bytes),
        }
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    /// Sample rate declared in an `audio/pcm;rate=N` MIME type.
    #[must_use]
    pub fn pcm_rate(&self) -> Option<u32> {
        let mut parts = self.mime_type.split(';').map(str::trim);
        if parts.next()? != PCM_MIME_PREFIX {
            return None;
        }
        parts
            .find_map(|p| p.strip_prefix("rate="))
            .and_then(|r| r.parse().ok())
    }

    /// # Errors
    /// Returns an error if the payload is not valid base64.
    #[allow(clippy::result_large_err)]
    pub fn decode_data(&self) -> crate::Result<Vec<u8>> {
        Ok(general_purpose::STANDARD.decode(self.data.as_bytes())?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    #[default]
    Audio,
    Text,
}

/// Function declaration advertised to the service in the setup message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the arguments (intentionally untyped).
    pub parameters: Value,
}

/// First message on every connection: persona, voice and tool schemas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub response_modalities: Vec<Modality>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,
}

impl SetupConfig {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_instruction: None,
            voice: None,
            response_modalities: vec![Modality::Audio],
            tools: Vec::new(),
        }
    }
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL)
    }
}

/// A tool invocation requested by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Answer to exactly one [`FunctionCall`], matched by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub text: String,
    pub turn_complete: bool,
}
