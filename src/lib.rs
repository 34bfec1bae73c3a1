#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Client-side core of a realtime assistant: a multimodal streaming session
//! against a remote AI service, and peer-to-peer call signaling over a shared
//! relay store.

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod protocol;
pub mod sdk;
pub mod transport;

pub use call::{
    CallAgent, CallConfig, CallEvent, CallHandle, CallRole, CallSession, CallState,
    CallStateMachine, CandidateRecord, IceServer, LocalMedia, MemoryRelay, PeerConnection,
    PeerConnector, PeerEvent, Presence, PresenceRecord, RecordKind, RelayStore, SignalingClient,
    SignalingRecord, StreamHandle,
};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use media::{
    AudioCaptureEncoder, AudioFrame, AudioOutput, AudioTrack, DeviceArbiter, DeviceLease,
    DeviceOwner, EncodedAudioChunk, MediaDevices, PlaybackItem, PlaybackScheduler, VideoFrame,
    VideoFrameSampler, VideoInput,
};
pub use protocol::client_events::ClientEvent;
pub use protocol::server_events::{ServerEvent, ServerMessage};
pub use sdk::{
    Realtime, RealtimeBuilder, SessionEvent, Session, SessionHandle, SessionState, ToolCall,
    ToolFuture, ToolRegistry, ToolResult,
};

use futures::{SinkExt, StreamExt};
use serde_json::from_str;
use tokio_tungstenite::tungstenite::protocol::Message;
use transport::ws::WsStream;

const TRACE_LOG_MAX_BYTES: usize = 1024;
const MAX_MEDIA_CHUNK_BYTES: usize = 4 * 1024 * 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Low-level WebSocket client for the streaming service.
///
/// Thread safety: `RealtimeClient` is `Send` but not `Sync` because the underlying
/// WebSocket stream is not `Sync`.
#[must_use]
pub struct RealtimeClient {
    stream: WsStream,
}

impl RealtimeClient {
    /// Connect to the streaming service.
    ///
    /// # Errors
    /// Returns an error if the connection fails or if the URL is invalid.
    pub async fn connect(endpoint: &str, api_key: &str) -> Result<Self> {
        let stream = transport::ws::connect(endpoint, api_key).await?;
        Ok(Self { stream })
    }

    /// Send a client event to the server.
    ///
    /// # Errors
    /// Returns an error if validation or serialization fails, or if the WebSocket send fails.
    pub async fn send(&mut self, event: ClientEvent) -> Result<()> {
        validate_client_event(&event)?;
        let json = serde_json::to_string(&event)?;
        tracing::trace!("Sending {}: {}", event.kind(), safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.stream.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Receive the next server message.
    ///
    /// The service may deliver JSON in either text or binary frames.
    ///
    /// # Errors
    /// Returns an error if deserialization fails or if the WebSocket fails.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => {
                    tracing::trace!("Received message: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    return Ok(Some(from_str::<ServerMessage>(&text)?));
                }
                Message::Binary(bytes) => {
                    tracing::trace!("Received binary message: {} bytes", bytes.len());
                    return Ok(Some(serde_json::from_slice::<ServerMessage>(&bytes)?));
                }
                Message::Close(frame) => {
                    tracing::info!(?frame, "WebSocket connection closed by server");
                    return Ok(None);
                }
                Message::Ping(payload) => {
                    tracing::debug!("Received Ping, sending Pong");
                    self.stream.send(Message::Pong(payload)).await?;
                }
                _ => (),
            }
        }
        Ok(None)
    }

    /// Close the WebSocket with a normal close frame.
    ///
    /// # Errors
    /// Returns an error if the close handshake cannot be sent.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

/// Check an outbound event against the service's message contract.
///
/// # Errors
/// Returns [`Error::InvalidClientEvent`] describing the first violation.
#[allow(clippy::result_large_err)]
pub fn validate_client_event(event: &ClientEvent) -> Result<()> {
    match event {
        ClientEvent::Setup(setup) => {
            if setup.model.trim().is_empty() {
                return Err(Error::InvalidClientEvent("setup requires a model".to_string()));
            }
        }
        ClientEvent::Media(chunk) => {
            validate_media_mime(&chunk.mime_type)?;
            let size = estimate_base64_decoded_len(&chunk.data)?;
            if size > MAX_MEDIA_CHUNK_BYTES {
                return Err(Error::InvalidClientEvent(format!(
                    "media chunk exceeds 4MB ({size} bytes)",
                )));
            }
        }
        ClientEvent::ToolResponse(response) => {
            if response.id.is_empty() {
                return Err(Error::InvalidClientEvent(
                    "toolResponse requires an invocation id".to_string(),
                ));
            }
        }
        ClientEvent::ClientContent(_) => {}
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn validate_media_mime(mime: &str) -> Result<()> {
    if mime == protocol::models::JPEG_MIME {
        return Ok(());
    }
    let chunk = protocol::models::MediaChunk {
        mime_type: mime.to_string(),
        data: String::new(),
    };
    match chunk.pcm_rate() {
        Some(rate) if rate > 0 => Ok(()),
        _ => Err(Error::InvalidClientEvent(format!(
            "unsupported media mime type: {mime}"
        ))),
    }
}

#[allow(clippy::result_large_err)]
fn estimate_base64_decoded_len(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidClientEvent(
            "media data has invalid base64 length".to_string(),
        ));
    }

    let mut padding = 0;
    let mut seen_padding = false;
    for &b in bytes {
        if b == b'=' {
            seen_padding = true;
            padding += 1;
            continue;
        }
        if seen_padding {
            return Err(Error::InvalidClientEvent(
                "media data has invalid base64 padding".to_string(),
            ));
        }
        let is_valid = matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/'
        );
        if !is_valid {
            return Err(Error::InvalidClientEvent(
                "media data has invalid base64 character".to_string(),
            ));
        }
    }

    if padding > 2 {
        return Err(Error::InvalidClientEvent(
            "media data has invalid base64 padding length".to_string(),
        ));
    }

    Ok(bytes.len() / 4 * 3 - padding)
}
