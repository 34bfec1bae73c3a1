use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use super::machine::{CallEvent, CallRole, CallSession, CallState, CallStateMachine};
use super::peer::{IceServer, LocalMedia, PeerConnector, PeerEvent, default_ice_servers};
use super::signaling::{CandidateRecord, Presence, SignalingClient, SignalingRecord};
use crate::media::DeviceArbiter;
use crate::{Error, Result};

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// How long an outgoing call may go unanswered before it is cancelled.
    /// `None` waits forever.
    pub ring_timeout: Option<Duration>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ring_timeout: Some(DEFAULT_RING_TIMEOUT),
        }
    }
}

impl CallConfig {
    #[must_use]
    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    #[must_use]
    pub const fn with_ring_timeout(mut self, ring_timeout: Option<Duration>) -> Self {
        self.ring_timeout = ring_timeout;
        self
    }
}

/// Drives a [`CallStateMachine`] from the relay, peer events and user commands
/// on a single task.
pub struct CallAgent {
    machine: CallStateMachine,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ring_timeout: Option<Duration>,
    ring: Option<(Uuid, Instant)>,
}

impl CallAgent {
    #[must_use]
    pub fn new(
        signaling: SignalingClient,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn LocalMedia>,
        arbiter: DeviceArbiter,
        config: CallConfig,
    ) -> Self {
        let (machine, peer_rx) =
            CallStateMachine::new(signaling, connector, media, arbiter, config.ice_servers);
        Self { machine, peer_rx, ring_timeout: config.ring_timeout, ring: None }
    }

    /// Start watching the relay and return a handle to the running agent.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(self) -> CallHandle {
        let (sender, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = CallHandle {
            sender,
            state: self.machine.state_changes(),
            events: self.machine.subscribe(),
        };
        // Watch before returning so nothing addressed to us is missed.
        let incoming = self.machine.signaling().watch_incoming();
        let candidates = self.machine.signaling().watch_candidates();
        tokio::spawn(self.run(cmd_rx, Some(incoming), Some(candidates)));
        handle
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut incoming: Option<BoxStream<'static, Result<Option<SignalingRecord>>>>,
        mut candidates: Option<BoxStream<'static, Result<CandidateRecord>>>,
    ) {
        let me = self.machine.signaling().my_id().to_string();
        tracing::info!(participant = %me, "Call agent started");
        self.announce(Presence::Online).await;

        let shutdown_ack = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Dial { remote_id, respond }) => {
                        let _ = respond.send(self.machine.dial(&remote_id).await);
                    }
                    Some(Command::Accept { respond }) => {
                        let _ = respond.send(self.machine.accept().await);
                    }
                    Some(Command::Decline { respond }) => {
                        let _ = respond.send(self.machine.decline().await);
                    }
                    Some(Command::End { respond }) => {
                        let _ = respond.send(self.machine.end().await);
                    }
                    Some(Command::Session { respond }) => {
                        let _ = respond.send(Ok(self.machine.session().cloned()));
                    }
                    Some(Command::Shutdown { respond }) => break Some(respond),
                    None => break None,
                },
                record = next_or_pending(&mut incoming) => match record {
                    Some(Ok(record)) => self.machine.on_record(record).await,
                    Some(Err(err)) => tracing::warn!(participant = %me, "Watching incoming calls failed: {err}"),
                    None => {
                        tracing::warn!(participant = %me, "Incoming call watch ended");
                        incoming = None;
                    }
                },
                candidate = next_or_pending(&mut candidates) => match candidate {
                    Some(Ok(candidate)) => self.machine.on_candidate(candidate).await,
                    Some(Err(err)) => tracing::warn!(participant = %me, "Watching candidates failed: {err}"),
                    None => {
                        tracing::warn!(participant = %me, "Candidate watch ended");
                        candidates = None;
                    }
                },
                Some(event) = self.peer_rx.recv() => self.machine.on_peer_event(event).await,
                call_id = ring_expiry(self.ring) => self.machine.expire(call_id).await,
            }
            self.refresh_ring();
        };

        if self.machine.state() != CallState::Idle {
            if let Err(err) = self.machine.end().await {
                tracing::warn!(participant = %me, "Failed to end call on shutdown: {err}");
            }
        }
        self.announce(Presence::Offline).await;
        tracing::info!(participant = %me, "Call agent stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(Ok(()));
        }
    }

    /// Arm the ring timer for a new outgoing call, disarm it once the call is
    /// answered or gone.
    fn refresh_ring(&mut self) {
        match self.machine.session() {
            Some(CallSession {
                id,
                role: CallRole::Caller,
                state: CallState::Dialing | CallState::Negotiating,
                ..
            }) => {
                if self.ring.map(|(ringing, _)| ringing) != Some(*id) {
                    self.ring = self.ring_timeout.map(|timeout| (*id, Instant::now() + timeout));
                }
            }
            _ => self.ring = None,
        }
    }

    async fn announce(&self, presence: Presence) {
        if let Err(err) = self.machine.signaling().set_presence(presence).await {
            tracing::warn!(?presence, "Failed to publish presence: {err}");
        }
    }
}

impl std::fmt::Debug for CallAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallAgent")
            .field("machine", &self.machine)
            .field("ring_timeout", &self.ring_timeout)
            .finish_non_exhaustive()
    }
}

async fn next_or_pending<T>(stream: &mut Option<BoxStream<'static, T>>) -> Option<T> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn ring_expiry(ring: Option<(Uuid, Instant)>) -> Uuid {
    match ring {
        Some((call_id, deadline)) => {
            tokio::time::sleep_until(deadline).await;
            call_id
        }
        None => std::future::pending().await,
    }
}

enum Command {
    Dial { remote_id: String, respond: oneshot::Sender<Result<Uuid>> },
    Accept { respond: oneshot::Sender<Result<()>> },
    Decline { respond: oneshot::Sender<Result<()>> },
    End { respond: oneshot::Sender<Result<()>> },
    Session { respond: oneshot::Sender<Result<Option<CallSession>>> },
    Shutdown { respond: oneshot::Sender<Result<()>> },
}

/// Cloneable control surface of a running [`CallAgent`].
#[derive(Debug)]
pub struct CallHandle {
    sender: mpsc::Sender<Command>,
    state: watch::Receiver<CallState>,
    events: broadcast::Receiver<CallEvent>,
}

impl Clone for CallHandle {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            state: self.state.clone(),
            events: self.events.resubscribe(),
        }
    }
}

impl CallHandle {
    /// # Errors
    /// See [`CallStateMachine::dial`]. Returns [`Error::ConnectionClosed`] if the agent has stopped.
    pub async fn dial(&self, remote_id: &str) -> Result<Uuid> {
        let remote_id = remote_id.to_string();
        self.request(|respond| Command::Dial { remote_id, respond }).await
    }

    /// # Errors
    /// See [`CallStateMachine::accept`].
    pub async fn accept(&self) -> Result<()> {
        self.request(|respond| Command::Accept { respond }).await
    }

    /// # Errors
    /// See [`CallStateMachine::decline`].
    pub async fn decline(&self) -> Result<()> {
        self.request(|respond| Command::Decline { respond }).await
    }

    /// # Errors
    /// See [`CallStateMachine::end`].
    pub async fn end(&self) -> Result<()> {
        self.request(|respond| Command::End { respond }).await
    }

    /// Snapshot of the current call, if any.
    ///
    /// # Errors
    /// Returns [`Error::ConnectionClosed`] if the agent has stopped.
    pub async fn session(&self) -> Result<Option<CallSession>> {
        self.request(|respond| Command::Session { respond }).await
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    /// Events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.resubscribe()
    }

    /// End any call, go offline and stop the agent. Stopping twice is a no-op.
    ///
    /// # Errors
    /// Currently never fails.
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(|respond| Command::Shutdown { respond }).await {
            Ok(()) | Err(Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(command(tx)).await.map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}
