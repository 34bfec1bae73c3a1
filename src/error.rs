use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error payload reported by the streaming service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(default)]
    pub code: Option<i32>,
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP protocol error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Header error: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    /// A request rejected by the streaming service or the relay.
    #[error("Service error: {0:?}")]
    Api(ServerError),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("Failed to open streaming connection: {0}")]
    Connection(String),

    #[error("Microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    #[error("Local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Capture device is held by {0}")]
    DeviceBusy(&'static str),

    #[error("Relay store error: {0}")]
    Relay(String),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("Invalid client event: {0}")]
    InvalidClientEvent(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
