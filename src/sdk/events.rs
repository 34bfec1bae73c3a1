use crate::error::ServerError;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::tools::{ToolCall, ToolResult};

/// Lifecycle of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

/// What the session reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// The real microphone could not be opened; a silent source is in use.
    MicrophoneUnavailable { reason: String },
    /// Input meter level in [0, 100], one per capture frame.
    Volume { level: f32 },
    Ready,
    Text(String),
    /// Inbound audio was placed on the playback timeline.
    AudioScheduled { seq: u64, start: f64, duration: f64 },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Interrupted,
    TurnComplete,
    Closed { reason: Option<String> },
    Error(ServerError),
}

pub struct EventStream<'a> {
    rx: &'a mut mpsc::Receiver<SessionEvent>,
}

impl<'a> EventStream<'a> {
    #[must_use]
    pub const fn new(rx: &'a mut mpsc::Receiver<SessionEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for EventStream<'_> {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}
