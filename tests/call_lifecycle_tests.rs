use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use livelink_rt::call::{EndReason, PeerEventKind};
use livelink_rt::{
    CallAgent, CallConfig, CallEvent, CallHandle, CallState, DeviceArbiter, DeviceOwner, Error,
    LocalMedia, MemoryRelay, PeerConnection, PeerConnector, PeerEvent, RecordKind, RelayStore,
    Result, SignalingClient, StreamHandle,
};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct LoopbackPeer {
    name: String,
    call_id: Uuid,
    events: mpsc::UnboundedSender<PeerEvent>,
    closed: AtomicBool,
    applied: Arc<Mutex<Vec<String>>>,
}

impl LoopbackPeer {
    fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent { call_id: self.call_id, kind });
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<String> {
        self.emit(PeerEventKind::LocalCandidate(format!("{}-candidate", self.name)));
        Ok(format!("{}-offer", self.name))
    }

    async fn create_answer(&self) -> Result<String> {
        self.emit(PeerEventKind::LocalCandidate(format!("{}-candidate", self.name)));
        Ok(format!("{}-answer", self.name))
    }

    async fn set_remote_description(&self, _kind: RecordKind, _sdp: &str) -> Result<()> {
        self.emit(PeerEventKind::RemoteStream(StreamHandle::new(format!("{}-remote", self.name))));
        self.emit(PeerEventKind::Connected);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Peer("connection closed".to_string()));
        }
        self.applied.lock().unwrap().push(candidate.to_string());
        Ok(())
    }

    async fn add_local_stream(&self, _stream: &StreamHandle) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct LoopbackConnector {
    name: String,
    applied: Arc<Mutex<Vec<String>>>,
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        call_id: Uuid,
        _ice_servers: &[livelink_rt::IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(LoopbackPeer {
            name: self.name.clone(),
            call_id,
            events,
            closed: AtomicBool::new(false),
            applied: Arc::clone(&self.applied),
        });
        self.peers.lock().unwrap().push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Default)]
struct CountingMedia {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

#[async_trait]
impl LocalMedia for CountingMedia {
    async fn acquire(&self) -> Result<StreamHandle> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(StreamHandle::new("local"))
    }

    fn release(&self, _stream: &StreamHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct Participant {
    handle: CallHandle,
    connector: Arc<LoopbackConnector>,
    media: Arc<CountingMedia>,
    arbiter: DeviceArbiter,
}

fn participant(relay: &MemoryRelay, id: &str, ring_timeout: Option<Duration>) -> Participant {
    let store: Arc<dyn RelayStore> = Arc::new(relay.clone());
    let connector = Arc::new(LoopbackConnector { name: id.to_string(), ..LoopbackConnector::default() });
    let media = Arc::new(CountingMedia::default());
    let arbiter = DeviceArbiter::new();
    let config = CallConfig::default()
        .with_ice_servers(Vec::new())
        .with_ring_timeout(ring_timeout);
    let agent = CallAgent::new(
        SignalingClient::new(store, id, id.to_uppercase()),
        Arc::clone(&connector) as Arc<dyn PeerConnector>,
        Arc::clone(&media) as Arc<dyn LocalMedia>,
        arbiter.clone(),
        config,
    );
    Participant { handle: agent.spawn(), connector, media, arbiter }
}

async fn wait_for_state(handle: &CallHandle, state: CallState) {
    let mut changes = handle.state_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("never reached {state:?}, stuck in {:?}", handle.state()))
        .unwrap();
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn signaling_paths(relay: &MemoryRelay) -> Vec<String> {
    relay
        .paths()
        .await
        .into_iter()
        .filter(|path| path.starts_with("calls/") || path.starts_with("candidates/"))
        .collect()
}

#[tokio::test]
async fn dial_accept_end_leaves_both_sides_clean() {
    init_tracing();
    let relay = MemoryRelay::new();
    let alice = participant(&relay, "alice", None);
    let bob = participant(&relay, "bob", None);
    let mut bob_events = bob.handle.subscribe();

    alice.handle.dial("bob").await.unwrap();
    assert_eq!(alice.handle.state(), CallState::Negotiating);

    wait_for_state(&bob.handle, CallState::Ringing).await;
    let incoming = loop {
        let event = tokio::time::timeout(WAIT, bob_events.recv()).await.unwrap().unwrap();
        if let CallEvent::IncomingCall { from, from_name, .. } = event {
            break (from, from_name);
        }
    };
    assert_eq!(incoming, ("alice".to_string(), "ALICE".to_string()));

    bob.handle.accept().await.unwrap();
    assert_eq!(bob.handle.state(), CallState::Active);
    wait_for_state(&alice.handle, CallState::Active).await;

    // Trickled candidates crossed in both directions.
    eventually("bob to apply alice's candidate", || {
        bob.connector.applied.lock().unwrap().contains(&"alice-candidate".to_string())
    })
    .await;
    eventually("alice to apply bob's candidate", || {
        alice.connector.applied.lock().unwrap().contains(&"bob-candidate".to_string())
    })
    .await;

    let alice_session = alice.handle.session().await.unwrap().unwrap();
    assert_eq!(alice_session.remote_id, "bob");
    assert_eq!(alice_session.remote_name, "BOB");
    let bob_session = bob.handle.session().await.unwrap().unwrap();
    assert_eq!(bob_session.remote_stream, Some(StreamHandle::new("bob-remote")));

    alice.handle.end().await.unwrap();
    assert_eq!(alice.handle.state(), CallState::Idle);
    wait_for_state(&bob.handle, CallState::Idle).await;

    assert!(signaling_paths(&relay).await.is_empty());
    for side in [&alice, &bob] {
        assert_eq!(side.media.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(side.media.released.load(Ordering::SeqCst), 1);
        assert_eq!(side.arbiter.current_owner(), None);
        assert!(side.connector.peers.lock().unwrap().iter().all(|peer| peer.is_closed()));
    }
    let ended = loop {
        if let CallEvent::Ended { reason, .. } = bob_events.recv().await.unwrap() {
            break reason;
        }
    };
    assert_eq!(ended, EndReason::RemoteHangup);

    alice.handle.shutdown().await.unwrap();
    bob.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn decline_clears_only_the_callee() {
    init_tracing();
    let relay = MemoryRelay::new();
    let alice = participant(&relay, "alice", None);
    let bob = participant(&relay, "bob", None);

    alice.handle.dial("bob").await.unwrap();
    wait_for_state(&bob.handle, CallState::Ringing).await;
    bob.handle.decline().await.unwrap();
    assert_eq!(bob.handle.state(), CallState::Idle);

    assert_eq!(relay.get("calls/bob").await.unwrap(), None);
    assert_eq!(relay.get("calls/alice").await.unwrap(), None, "no answer is ever posted");
    assert!(bob.connector.peers.lock().unwrap().is_empty());

    // Without a ring timeout the caller keeps waiting until it gives up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.handle.state(), CallState::Negotiating);
    alice.handle.end().await.unwrap();
    assert!(signaling_paths(&relay).await.is_empty());
    assert_eq!(bob.handle.state(), CallState::Idle);
}

#[tokio::test]
async fn unanswered_call_times_out() {
    init_tracing();
    let relay = MemoryRelay::new();
    let alice = participant(&relay, "alice", Some(Duration::from_millis(150)));
    let mut events = alice.handle.subscribe();

    let call_id = alice.handle.dial("carol").await.unwrap();
    assert_eq!(relay.get("calls/carol").await.unwrap().unwrap()["type"], "offer");

    wait_for_state(&alice.handle, CallState::Idle).await;
    let ended = loop {
        if let CallEvent::Ended { call_id: ended_id, reason, .. } = events.recv().await.unwrap() {
            break (ended_id, reason);
        }
    };
    assert_eq!(ended, (call_id, EndReason::Unanswered));
    assert!(signaling_paths(&relay).await.is_empty());
    assert_eq!(alice.arbiter.current_owner(), None);
}

#[tokio::test]
async fn late_signaling_after_hangup_is_ignored() {
    init_tracing();
    let relay = MemoryRelay::new();
    let alice = participant(&relay, "alice", None);
    let bob = participant(&relay, "bob", None);

    let first_call = alice.handle.dial("bob").await.unwrap();
    wait_for_state(&bob.handle, CallState::Ringing).await;
    bob.handle.accept().await.unwrap();
    wait_for_state(&alice.handle, CallState::Active).await;
    eventually("alice to apply bob's candidate", || !alice.connector.applied.lock().unwrap().is_empty())
        .await;

    bob.handle.end().await.unwrap();
    wait_for_state(&alice.handle, CallState::Idle).await;
    let applied_before = alice.connector.applied.lock().unwrap().len();

    // A straggling candidate and a stale answer from the finished call.
    relay
        .push(
            "candidates/alice",
            json!({ "callId": first_call.to_string(), "from": "bob", "candidate": "late-candidate" }),
        )
        .await
        .unwrap();
    relay
        .set(
            "calls/alice",
            json!({
                "type": "answer",
                "callId": first_call.to_string(),
                "from": "bob",
                "fromName": "BOB",
                "sdp": "stale"
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(alice.handle.state(), CallState::Idle);
    assert_eq!(alice.handle.session().await.unwrap(), None);
    assert_eq!(alice.connector.applied.lock().unwrap().len(), applied_before);
    assert_eq!(alice.connector.peers.lock().unwrap().len(), 1);

    // The next call between the same two picks up nothing from the first.
    let second_call = bob.handle.dial("alice").await.unwrap();
    assert_ne!(second_call, first_call);
    wait_for_state(&alice.handle, CallState::Ringing).await;
    alice.handle.accept().await.unwrap();
    wait_for_state(&bob.handle, CallState::Active).await;
    eventually("alice to apply bob's new candidate", || {
        alice.connector.applied.lock().unwrap().len() > applied_before
    })
    .await;

    let applied = alice.connector.applied.lock().unwrap().clone();
    assert!(!applied.contains(&"late-candidate".to_string()), "stale candidate applied: {applied:?}");
    assert_eq!(alice.handle.session().await.unwrap().unwrap().id, second_call);

    bob.handle.end().await.unwrap();
    wait_for_state(&alice.handle, CallState::Idle).await;
}

#[tokio::test]
async fn streaming_session_holding_the_device_blocks_calls() {
    init_tracing();
    let relay = MemoryRelay::new();
    let alice = participant(&relay, "alice", None);
    let bob = participant(&relay, "bob", None);
    let session_lease = alice.arbiter.acquire(DeviceOwner::StreamingSession).unwrap();

    let err = alice.handle.dial("bob").await.unwrap_err();
    assert!(matches!(err, Error::DeviceBusy("the streaming session")));
    assert_eq!(alice.handle.state(), CallState::Idle);
    assert_eq!(alice.media.acquired.load(Ordering::SeqCst), 0);

    drop(session_lease);
    alice.handle.dial("bob").await.unwrap();
    wait_for_state(&bob.handle, CallState::Ringing).await;
    assert_eq!(alice.arbiter.current_owner(), Some(DeviceOwner::Call));
    alice.handle.end().await.unwrap();
    wait_for_state(&bob.handle, CallState::Idle).await;
}

#[tokio::test]
async fn shutdown_goes_offline_and_rejects_commands() {
    init_tracing();
    let relay = MemoryRelay::new();
    let alice = participant(&relay, "alice", None);
    let observer = SignalingClient::new(Arc::new(relay.clone()) as Arc<dyn RelayStore>, "obs", "Observer");

    alice.handle.shutdown().await.unwrap();
    let presence = observer.presence("alice").await.unwrap().unwrap();
    assert_eq!(presence.presence, livelink_rt::Presence::Offline);
    assert_eq!(presence.display_name, "ALICE");

    assert!(matches!(alice.handle.dial("bob").await, Err(Error::ConnectionClosed)));
    alice.handle.shutdown().await.unwrap();
}
