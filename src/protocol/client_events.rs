use serde::{Deserialize, Serialize};
use super::models::{ClientContent, MediaChunk, SetupConfig, ToolResponse};

/// Messages sent from the client to the streaming service.
///
/// Each variant serializes as a single-key object, e.g.
/// `{"media": {"mimeType": "audio/pcm;rate=16000", "data": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientEvent {
    Setup(Box<SetupConfig>),
    Media(MediaChunk),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientEvent {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::Media(_) => "media",
            Self::ClientContent(_) => "clientContent",
            Self::ToolResponse(_) => "toolResponse",
        }
    }
}
