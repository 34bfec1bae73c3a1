use serde::{Deserialize, Serialize};
use serde_json::Value;
use super::models::{FunctionCall, MediaChunk};
use crate::error::ServerError;

/// Raw message as it arrives on the wire.
///
/// The service sends objects carrying any subset of these keys; unknown keys
/// are ignored so protocol additions never break parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub go_away: Option<GoAway>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<MediaChunk>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Closed set of inbound events the session reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Ready,
    Audio { pcm: Vec<u8> },
    Text(String),
    ToolCall(Vec<FunctionCall>),
    Interrupted,
    TurnComplete,
    Close { reason: Option<String> },
    Error(ServerError),
}

impl ServerMessage {
    /// Flatten a wire message into events, in the order they should be handled.
    ///
    /// Audio parts whose payload is not valid base64 are dropped with a warning.
    #[must_use]
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        if self.setup_complete.is_some() {
            events.push(ServerEvent::Ready);
        }
        if let Some(error) = self.error {
            events.push(ServerEvent::Error(error));
        }
        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    events.push(ServerEvent::Text(text));
                }
                if let Some(media) = part.inline_data.filter(MediaChunk::is_audio) {
                    match media.decode_data() {
                        Ok(pcm) => events.push(ServerEvent::Audio { pcm }),
                        Err(err) => tracing::warn!("Dropping inbound audio part: {err}"),
                    }
                }
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }
        if let Some(call) = self.tool_call {
            if !call.function_calls.is_empty() {
                events.push(ServerEvent::ToolCall(call.function_calls));
            }
        }
        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::Close {
                reason: Some(go_away.time_left.map_or_else(
                    || "go away".to_string(),
                    |left| format!("go away ({left} left)"),
                )),
            });
        }
        events
    }
}
