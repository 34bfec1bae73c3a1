//! Seams for the peer-to-peer media stack and local call media.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::signaling::RecordKind;
use crate::Result;

/// Opaque handle to a local or remote media stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub String);

impl StreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// STUN/TURN server handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self { urls: vec![url.into()], username: None, credential: None }
    }

    pub fn turn(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Public STUN servers used when nothing is configured.
#[must_use]
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: None,
        credential: None,
    }]
}

/// Something a peer connection reported, tagged with the call it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub call_id: Uuid,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEventKind {
    /// A connectivity candidate was gathered locally and should be trickled.
    LocalCandidate(String),
    RemoteStream(StreamHandle),
    Connected,
    Closed,
    Failed(String),
}

impl PeerEventKind {
    #[must_use]
    pub const fn ends_call(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// One negotiated peer-to-peer link.
///
/// Implementations may keep emitting events after [`PeerConnection::close`];
/// consumers check [`PeerConnection::is_closed`] before acting on them.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<String>;

    /// Create an answer to the applied remote offer and set it as the local description.
    async fn create_answer(&self) -> Result<String>;

    async fn set_remote_description(&self, kind: RecordKind, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

    async fn add_local_stream(&self, stream: &StreamHandle) -> Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates peer connections. Events are delivered on `events` tagged with `call_id`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        call_id: Uuid,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// Local camera and microphone for calls.
#[async_trait]
pub trait LocalMedia: Send + Sync {
    /// # Errors
    /// Returns [`crate::Error::MediaUnavailable`] if the devices cannot be opened.
    async fn acquire(&self) -> Result<StreamHandle>;

    fn release(&self, stream: &StreamHandle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ice_servers_omit_missing_credentials() {
        let stun = IceServer::stun("stun:stun.example.org:3478");
        assert_eq!(
            serde_json::to_value(&stun).unwrap(),
            json!({ "urls": ["stun:stun.example.org:3478"] })
        );

        let turn: IceServer = serde_json::from_value(json!({
            "urls": ["turn:turn.example.org"],
            "username": "u",
            "credential": "p"
        }))
        .unwrap();
        assert_eq!(turn, IceServer::turn("turn:turn.example.org", "u", "p"));
    }

    #[test]
    fn defaults_use_public_stun() {
        let servers = default_ice_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls.iter().all(|u| u.starts_with("stun:")));
    }
}
