//! Peer-to-peer call signaling over a shared relay store.

pub mod agent;
pub mod machine;
pub mod peer;
pub mod relay;
pub mod signaling;

pub use agent::{CallAgent, CallConfig, CallHandle};
pub use machine::{CallEvent, CallRole, CallSession, CallState, CallStateMachine, EndReason};
pub use peer::{
    IceServer, LocalMedia, PeerConnection, PeerConnector, PeerEvent, PeerEventKind, StreamHandle,
    default_ice_servers,
};
pub use relay::{MemoryRelay, RelayStore};
pub use signaling::{
    CandidateRecord, Presence, PresenceRecord, RecordKind, SignalingClient, SignalingRecord,
};
