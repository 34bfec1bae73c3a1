use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::peer::{
    IceServer, LocalMedia, PeerConnection, PeerConnector, PeerEvent, PeerEventKind, StreamHandle,
};
use super::signaling::{CandidateRecord, Presence, RecordKind, SignalingClient, SignalingRecord};
use crate::media::{DeviceArbiter, DeviceLease, DeviceOwner};
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Candidates that arrive before the offer they belong to.
const MAX_EARLY_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Dialing,
    Ringing,
    Negotiating,
    Active,
}

impl CallState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Ringing => "ringing",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// The call in progress, from this participant's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: Uuid,
    pub role: CallRole,
    pub remote_id: String,
    pub remote_name: String,
    pub state: CallState,
    pub local_stream: Option<StreamHandle>,
    pub remote_stream: Option<StreamHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    RemoteHangup,
    Declined,
    Unanswered,
    ConnectionLost,
    /// Setting up the call failed locally.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall {
        call_id: Uuid,
        from: String,
        from_name: String,
    },
    RemoteStream {
        call_id: Uuid,
        stream: StreamHandle,
    },
    Ended {
        call_id: Uuid,
        remote_id: String,
        reason: EndReason,
    },
    /// A failure that happened outside of any command, e.g. while applying an answer.
    Error(String),
}

struct ActiveCall {
    session: CallSession,
    peer: Option<Arc<dyn PeerConnection>>,
    lease: Option<DeviceLease>,
    /// Remote offer held while ringing.
    pending_offer: Option<String>,
    /// Both descriptions are applied; candidates may be added.
    descriptions_applied: bool,
    queued_candidates: Vec<String>,
    /// A record belonging to this call has been seen at our address. Its
    /// disappearance means the remote side ended the call.
    seen_record: bool,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            peer: None,
            lease: None,
            pending_offer: None,
            descriptions_applied: false,
            queued_candidates: Vec::new(),
            seen_record: false,
        }
    }

    fn peer_closed(&self) -> bool {
        self.peer.as_ref().is_some_and(|peer| peer.is_closed())
    }
}

/// Caller/callee state machine for one participant.
///
/// Commands (`dial`, `accept`, `decline`, `end`, `cancel`) return errors to the
/// caller. Callbacks (`on_record`, `on_candidate`, `on_peer_event`) never fail:
/// anything that does not belong to the current live call is logged and dropped.
pub struct CallStateMachine {
    signaling: SignalingClient,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn LocalMedia>,
    arbiter: DeviceArbiter,
    ice_servers: Vec<IceServer>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    state_tx: watch::Sender<CallState>,
    events: broadcast::Sender<CallEvent>,
    call: Option<ActiveCall>,
    early_candidates: Vec<CandidateRecord>,
    /// Signaling tagged with this id belongs to a finished call.
    last_ended: Option<Uuid>,
}

impl CallStateMachine {
    /// Build an idle machine. Peer connections report on the returned receiver,
    /// which must be fed back through [`CallStateMachine::on_peer_event`].
    #[must_use]
    pub fn new(
        signaling: SignalingClient,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn LocalMedia>,
        arbiter: DeviceArbiter,
        ice_servers: Vec<IceServer>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(CallState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let machine = Self {
            signaling,
            connector,
            media,
            arbiter,
            ice_servers,
            peer_tx,
            state_tx,
            events,
            call: None,
            early_candidates: Vec::new(),
            last_ended: None,
        };
        (machine, peer_rx)
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.call.as_ref().map_or(CallState::Idle, |call| call.session.state)
    }

    #[must_use]
    pub fn session(&self) -> Option<&CallSession> {
        self.call.as_ref().map(|call| &call.session)
    }

    #[must_use]
    pub fn signaling(&self) -> &SignalingClient {
        &self.signaling
    }

    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Call `remote_id`. Returns once the offer is posted, in `Negotiating`.
    ///
    /// # Errors
    /// Fails if not idle, the capture device is busy, local media cannot be
    /// acquired, or the offer cannot be created or posted. The machine is back
    /// in `Idle` on failure.
    pub async fn dial(&mut self, remote_id: &str) -> Result<Uuid> {
        self.require_state(&[CallState::Idle], "dial")?;
        if remote_id == self.signaling.my_id() {
            return Err(Error::Peer("cannot call yourself".to_string()));
        }
        let lease = self.arbiter.acquire(DeviceOwner::Call)?;

        // Leftovers at our address would be misread as part of this call.
        let me = self.signaling.my_id().to_string();
        if let Err(err) = self.signaling.clear(&me).await {
            tracing::warn!("Failed to clear stale signaling records: {err}");
        }
        self.early_candidates.clear();

        let id = Uuid::new_v4();
        let mut call = ActiveCall::new(CallSession {
            id,
            role: CallRole::Caller,
            remote_id: remote_id.to_string(),
            remote_name: String::new(),
            state: CallState::Dialing,
            local_stream: None,
            remote_stream: None,
        });
        call.lease = Some(lease);
        self.call = Some(call);
        tracing::info!(call_id = %id, remote = remote_id, "Dialing");
        self.publish_state(CallState::Dialing);

        match self.start_offer(id, remote_id).await {
            Ok(()) => {
                self.set_state(CallState::Negotiating);
                Ok(id)
            }
            Err(err) => {
                tracing::warn!(call_id = %id, "Dial failed: {err}");
                let _ = self.teardown(EndReason::Failed, false).await;
                Err(err)
            }
        }
    }

    async fn start_offer(&mut self, id: Uuid, remote_id: &str) -> Result<()> {
        let stream = self.media.acquire().await?;
        self.with_call(|call| call.session.local_stream = Some(stream.clone()));

        let peer = self
            .connector
            .connect(id, &self.ice_servers, self.peer_tx.clone())
            .await?;
        self.with_call(|call| call.peer = Some(Arc::clone(&peer)));

        peer.add_local_stream(&stream).await?;
        let offer = peer.create_offer().await?;
        self.signaling.post_offer(remote_id, id, &offer).await
    }

    /// Answer the ringing call. Ends in `Active` with the answer posted.
    ///
    /// # Errors
    /// Fails if not ringing or the capture device is busy (the call keeps
    /// ringing), or if negotiation fails (the machine returns to `Idle`).
    pub async fn accept(&mut self) -> Result<()> {
        self.require_state(&[CallState::Ringing], "accept")?;
        let lease = self.arbiter.acquire(DeviceOwner::Call)?;
        let Some((id, remote_id, offer)) = self.call.as_mut().and_then(|call| {
            let offer = call.pending_offer.take()?;
            call.lease = Some(lease);
            Some((call.session.id, call.session.remote_id.clone(), offer))
        }) else {
            return Err(Error::Peer("ringing call has no offer".to_string()));
        };

        self.set_state(CallState::Negotiating);
        match self.start_answer(id, &remote_id, &offer).await {
            Ok(()) => {
                self.set_state(CallState::Active);
                self.announce(Presence::InCall).await;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(call_id = %id, "Accept failed: {err}");
                let _ = self.teardown(EndReason::Failed, false).await;
                Err(err)
            }
        }
    }

    async fn start_answer(&mut self, id: Uuid, remote_id: &str, offer: &str) -> Result<()> {
        let stream = self.media.acquire().await?;
        self.with_call(|call| call.session.local_stream = Some(stream.clone()));

        let peer = self
            .connector
            .connect(id, &self.ice_servers, self.peer_tx.clone())
            .await?;
        self.with_call(|call| call.peer = Some(Arc::clone(&peer)));

        peer.add_local_stream(&stream).await?;
        peer.set_remote_description(RecordKind::Offer, offer).await?;
        let answer = peer.create_answer().await?;
        self.flush_candidates(&peer).await;
        self.signaling.post_answer(remote_id, id, &answer).await
    }

    /// Refuse the ringing call. Only this participant's own records are cleared.
    ///
    /// # Errors
    /// Fails if not ringing, or if the records cannot be cleared (the machine
    /// is `Idle` regardless).
    pub async fn decline(&mut self) -> Result<()> {
        self.require_state(&[CallState::Ringing], "decline")?;
        self.teardown(EndReason::Declined, false).await
    }

    /// Hang up. Ringing calls are declined.
    ///
    /// # Errors
    /// Fails if there is no call, or if clearing relay records fails (the
    /// machine is `Idle` regardless).
    pub async fn end(&mut self) -> Result<()> {
        match self.state() {
            CallState::Idle => Err(self.invalid("end")),
            CallState::Ringing => self.decline().await,
            _ => self.teardown(EndReason::Hangup, true).await,
        }
    }

    /// Abandon an outgoing call that has not been answered.
    ///
    /// # Errors
    /// Fails unless dialing or negotiating, or if clearing relay records fails.
    pub async fn cancel(&mut self) -> Result<()> {
        self.require_state(&[CallState::Dialing, CallState::Negotiating], "cancel")?;
        self.teardown(EndReason::Hangup, true).await
    }

    /// Give up on an outgoing call nobody answered.
    pub(crate) async fn expire(&mut self, call_id: Uuid) {
        let unanswered = self.call.as_ref().is_some_and(|call| {
            call.session.id == call_id
                && call.session.role == CallRole::Caller
                && matches!(call.session.state, CallState::Dialing | CallState::Negotiating)
        });
        if unanswered {
            tracing::info!(call_id = %call_id, "Outgoing call was not answered");
            let _ = self.teardown(EndReason::Unanswered, true).await;
        }
    }

    /// The record at this participant's address changed.
    pub async fn on_record(&mut self, record: Option<SignalingRecord>) {
        if self.call.as_ref().is_some_and(ActiveCall::peer_closed) {
            tracing::debug!("Ignoring signaling record for a closed connection");
            return;
        }

        match record {
            Some(record) => match (record.kind, self.state()) {
                (RecordKind::Offer, CallState::Idle) => self.on_offer(record),
                (RecordKind::Answer, CallState::Negotiating) => self.on_answer(record).await,
                (kind, state) => {
                    tracing::debug!(
                        from = %record.from,
                        kind = kind.as_str(),
                        state = state.as_str(),
                        "Ignoring signaling record"
                    );
                }
            },
            None => {
                if self.call.as_ref().is_some_and(|call| call.seen_record) {
                    tracing::info!("Remote participant ended the call");
                    let _ = self.teardown(EndReason::RemoteHangup, false).await;
                }
            }
        }
    }

    fn on_offer(&mut self, record: SignalingRecord) {
        if record.from == self.signaling.my_id() {
            return;
        }
        if self.last_ended == Some(record.call_id) {
            tracing::debug!(call_id = %record.call_id, "Ignoring offer for a finished call");
            return;
        }
        let id = record.call_id;
        let mut call = ActiveCall::new(CallSession {
            id,
            role: CallRole::Callee,
            remote_id: record.from.clone(),
            remote_name: record.from_name.clone(),
            state: CallState::Ringing,
            local_stream: None,
            remote_stream: None,
        });
        call.pending_offer = Some(record.sdp);
        call.seen_record = true;
        // Whatever does not belong to this offer can no longer become relevant.
        call.queued_candidates = std::mem::take(&mut self.early_candidates)
            .into_iter()
            .filter(|candidate| candidate.call_id == id && candidate.from == record.from)
            .map(|candidate| candidate.candidate)
            .collect();
        self.call = Some(call);

        tracing::info!(call_id = %id, from = %record.from, "Incoming call");
        self.publish_state(CallState::Ringing);
        let _ = self.events.send(CallEvent::IncomingCall {
            call_id: id,
            from: record.from,
            from_name: record.from_name,
        });
    }

    async fn on_answer(&mut self, record: SignalingRecord) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.session.role != CallRole::Caller
            || record.call_id != call.session.id
            || record.from != call.session.remote_id
        {
            tracing::debug!(from = %record.from, "Ignoring answer that does not belong to this call");
            return;
        }
        let Some(peer) = call.peer.clone() else {
            return;
        };
        call.seen_record = true;
        call.session.remote_name = record.from_name;

        if let Err(err) = peer.set_remote_description(RecordKind::Answer, &record.sdp).await {
            tracing::warn!("Failed to apply answer: {err}");
            let _ = self.events.send(CallEvent::Error(err.to_string()));
            let _ = self.teardown(EndReason::Failed, true).await;
            return;
        }
        self.flush_candidates(&peer).await;
        self.set_state(CallState::Active);
        self.announce(Presence::InCall).await;
    }

    /// A candidate was appended to this participant's inbox.
    pub async fn on_candidate(&mut self, record: CandidateRecord) {
        let Some(call) = self.call.as_mut() else {
            if self.last_ended == Some(record.call_id) {
                tracing::debug!(call_id = %record.call_id, "Ignoring candidate for a finished call");
            } else if record.from != self.signaling.my_id()
                && self.early_candidates.len() < MAX_EARLY_CANDIDATES
            {
                self.early_candidates.push(record);
            }
            return;
        };
        if record.call_id != call.session.id || record.from != call.session.remote_id {
            tracing::debug!(from = %record.from, "Ignoring candidate from outside the call");
            return;
        }
        if call.peer_closed() {
            tracing::debug!("Ignoring candidate for a closed connection");
            return;
        }
        match call.peer.clone() {
            Some(peer) if call.descriptions_applied => {
                if let Err(err) = peer.add_ice_candidate(&record.candidate).await {
                    tracing::warn!("Failed to add remote candidate: {err}");
                }
            }
            _ => call.queued_candidates.push(record.candidate),
        }
    }

    /// A peer connection reported something.
    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(call) = self.call.as_mut() else {
            tracing::debug!(call_id = %event.call_id, "Ignoring peer event with no call");
            return;
        };
        if call.session.id != event.call_id {
            tracing::debug!(call_id = %event.call_id, "Ignoring peer event from an earlier call");
            return;
        }
        if event.kind.ends_call() {
            if let PeerEventKind::Failed(reason) = &event.kind {
                tracing::warn!(call_id = %event.call_id, "Peer connection failed: {reason}");
            }
            let _ = self.teardown(EndReason::ConnectionLost, true).await;
            return;
        }
        if call.peer_closed() {
            tracing::debug!("Ignoring peer event for a closed connection");
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                let remote_id = call.session.remote_id.clone();
                if let Err(err) = self
                    .signaling
                    .push_candidate(&remote_id, event.call_id, &candidate)
                    .await
                {
                    tracing::warn!("Failed to send local candidate: {err}");
                }
            }
            PeerEventKind::RemoteStream(stream) => {
                call.session.remote_stream = Some(stream.clone());
                let _ = self.events.send(CallEvent::RemoteStream { call_id: event.call_id, stream });
            }
            PeerEventKind::Connected => {
                tracing::info!(call_id = %event.call_id, "Peer connection established");
            }
            PeerEventKind::Closed | PeerEventKind::Failed(_) => {}
        }
    }

    /// Apply queued remote candidates in arrival order. From here on candidates
    /// are applied as they arrive.
    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerConnection>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.descriptions_applied = true;
        for candidate in std::mem::take(&mut call.queued_candidates) {
            if let Err(err) = peer.add_ice_candidate(&candidate).await {
                tracing::warn!("Failed to add queued candidate: {err}");
            }
        }
    }

    /// Drop the call: close the connection, release media and the device, and
    /// clear relay records (ours, plus the remote's when `clear_remote`). The
    /// machine is `Idle` afterwards even if clearing fails.
    async fn teardown(&mut self, reason: EndReason, clear_remote: bool) -> Result<()> {
        let Some(mut call) = self.call.take() else {
            return Ok(());
        };
        if let Some(peer) = call.peer.take() {
            peer.close().await;
        }
        if let Some(stream) = call.session.local_stream.take() {
            self.media.release(&stream);
        }
        drop(call.lease.take());
        self.early_candidates.clear();
        self.last_ended = Some(call.session.id);

        let me = self.signaling.my_id().to_string();
        let mut result = self.signaling.clear(&me).await;
        if clear_remote {
            let remote = self.signaling.clear(&call.session.remote_id).await;
            result = result.and(remote);
        }
        if let Err(err) = &result {
            tracing::warn!(call_id = %call.session.id, "Failed to clear signaling records: {err}");
        }
        if call.session.state == CallState::Active {
            self.announce(Presence::Online).await;
        }

        tracing::info!(call_id = %call.session.id, ?reason, "Call ended");
        self.publish_state(CallState::Idle);
        let _ = self.events.send(CallEvent::Ended {
            call_id: call.session.id,
            remote_id: call.session.remote_id,
            reason,
        });
        result
    }

    async fn announce(&self, presence: Presence) {
        if let Err(err) = self.signaling.set_presence(presence).await {
            tracing::warn!(?presence, "Failed to publish presence: {err}");
        }
    }

    fn with_call(&mut self, f: impl FnOnce(&mut ActiveCall)) {
        if let Some(call) = self.call.as_mut() {
            f(call);
        }
    }

    fn set_state(&mut self, state: CallState) {
        self.with_call(|call| call.session.state = state);
        self.publish_state(state);
    }

    fn publish_state(&self, state: CallState) {
        tracing::debug!(state = state.as_str(), "Call state changed");
        self.state_tx.send_replace(state);
        let _ = self.events.send(CallEvent::StateChanged(state));
    }

    #[allow(clippy::result_large_err)]
    fn require_state(&self, allowed: &[CallState], action: &'static str) -> Result<()> {
        if allowed.contains(&self.state()) {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition { state: self.state().as_str(), action }
    }
}

impl std::fmt::Debug for CallStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStateMachine")
            .field("me", &self.signaling.my_id())
            .field("call", &self.session())
            .finish_non_exhaustive()
    }
}
