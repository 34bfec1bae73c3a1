//! Signaling records exchanged through the relay store.
//!
//! Layout:
//! - `users/{id}` holds a [`PresenceRecord`];
//! - `calls/{id}` holds at most one [`SignalingRecord`] addressed to `id`;
//! - `candidates/{id}` is an append-only list of [`CandidateRecord`]s addressed to `id`.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::relay::RelayStore;
use crate::{Error, Result};

const USERS: &str = "users";
const CALLS: &str = "calls";
const CANDIDATES: &str = "candidates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Offer,
    Answer,
}

impl RecordKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Session description parked at the recipient's address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    /// Chosen by the caller; every record and candidate of one call carries it.
    pub call_id: Uuid,
    pub from: String,
    #[serde(default)]
    pub from_name: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub call_id: Uuid,
    pub from: String,
    pub candidate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Presence {
    Online,
    Offline,
    InCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub display_name: String,
    pub presence: Presence,
    /// Milliseconds since the Unix epoch.
    pub last_seen: i64,
}

fn path(collection: &str, id: &str) -> String {
    format!("{collection}/{id}")
}

/// Reads and writes one participant's signaling records.
#[derive(Clone)]
pub struct SignalingClient {
    store: Arc<dyn RelayStore>,
    my_id: String,
    display_name: String,
}

impl SignalingClient {
    pub fn new(store: Arc<dyn RelayStore>, my_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            store,
            my_id: my_id.into(),
            display_name: display_name.into(),
        }
    }

    #[must_use]
    pub fn my_id(&self) -> &str {
        &self.my_id
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// # Errors
    /// Returns an error if the relay write fails.
    pub async fn post_offer(&self, to: &str, call_id: Uuid, sdp: &str) -> Result<()> {
        self.post(to, RecordKind::Offer, call_id, sdp).await
    }

    /// # Errors
    /// Returns an error if the relay write fails.
    pub async fn post_answer(&self, to: &str, call_id: Uuid, sdp: &str) -> Result<()> {
        self.post(to, RecordKind::Answer, call_id, sdp).await
    }

    async fn post(&self, to: &str, kind: RecordKind, call_id: Uuid, sdp: &str) -> Result<()> {
        let record = SignalingRecord {
            kind,
            call_id,
            from: self.my_id.clone(),
            from_name: self.display_name.clone(),
            sdp: sdp.to_string(),
        };
        tracing::debug!(to, %call_id, kind = kind.as_str(), "Posting session description");
        self.store.set(&path(CALLS, to), serde_json::to_value(record)?).await
    }

    /// Append one trickled candidate to `to`'s inbox.
    ///
    /// # Errors
    /// Returns an error if the relay write fails.
    pub async fn push_candidate(&self, to: &str, call_id: Uuid, candidate: &str) -> Result<()> {
        let record = CandidateRecord {
            call_id,
            from: self.my_id.clone(),
            candidate: candidate.to_string(),
        };
        self.store
            .push(&path(CANDIDATES, to), serde_json::to_value(record)?)
            .await
            .map(|_| ())
    }

    /// The record at this participant's address, now and after every change.
    /// `None` means the address is empty.
    #[must_use]
    pub fn watch_incoming(&self) -> BoxStream<'static, Result<Option<SignalingRecord>>> {
        watch_typed(self.store.as_ref(), &path(CALLS, &self.my_id))
    }

    /// Candidates addressed to this participant, each yielded once in append order.
    ///
    /// Clearing the inbox resets what has been seen.
    #[must_use]
    pub fn watch_candidates(&self) -> BoxStream<'static, Result<CandidateRecord>> {
        let mut seen: HashSet<String> = HashSet::new();
        self.store
            .watch(&path(CANDIDATES, &self.my_id))
            .flat_map(move |snapshot| {
                let fresh: Vec<Result<CandidateRecord>> = match snapshot {
                    Err(err) => vec![Err(err)],
                    Ok(None) => {
                        seen.clear();
                        Vec::new()
                    }
                    // Object keys iterate sorted, which is append order.
                    Ok(Some(Value::Object(entries))) => entries
                        .into_iter()
                        .filter(|(key, _)| seen.insert(key.clone()))
                        .map(|(_, value)| serde_json::from_value(value).map_err(Error::from))
                        .collect(),
                    Ok(Some(other)) => vec![Err(Error::Relay(format!(
                        "candidate inbox is not a list: {other}"
                    )))],
                };
                stream::iter(fresh)
            })
            .boxed()
    }

    /// Remove `id`'s signaling record and candidate inbox.
    ///
    /// # Errors
    /// Returns the first relay error; both removals are always attempted.
    pub async fn clear(&self, id: &str) -> Result<()> {
        let signal = self.clear_signal(id).await;
        let candidates = self.store.remove(&path(CANDIDATES, id)).await;
        signal.and(candidates)
    }

    /// Remove only `id`'s signaling record.
    ///
    /// # Errors
    /// Returns an error if the relay delete fails.
    pub async fn clear_signal(&self, id: &str) -> Result<()> {
        self.store.remove(&path(CALLS, id)).await
    }

    /// # Errors
    /// Returns an error if the relay write fails.
    pub async fn set_presence(&self, presence: Presence) -> Result<()> {
        let record = PresenceRecord {
            display_name: self.display_name.clone(),
            presence,
            last_seen: chrono::Utc::now().timestamp_millis(),
        };
        self.store
            .set(&path(USERS, &self.my_id), serde_json::to_value(record)?)
            .await
    }

    /// # Errors
    /// Returns an error if the relay read fails or the record is malformed.
    pub async fn presence(&self, id: &str) -> Result<Option<PresenceRecord>> {
        self.store
            .get(&path(USERS, id))
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    #[must_use]
    pub fn watch_presence(&self, id: &str) -> BoxStream<'static, Result<Option<PresenceRecord>>> {
        watch_typed(self.store.as_ref(), &path(USERS, id))
    }
}

fn watch_typed<T>(store: &dyn RelayStore, path: &str) -> BoxStream<'static, Result<Option<T>>>
where
    T: DeserializeOwned + Send + 'static,
{
    store
        .watch(path)
        .map(|snapshot| {
            snapshot.and_then(|value| {
                value
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(Error::from)
            })
        })
        .boxed()
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("my_id", &self.my_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::relay::MemoryRelay;
    use serde_json::json;

    fn pair() -> (MemoryRelay, SignalingClient, SignalingClient) {
        let relay = MemoryRelay::new();
        let store: Arc<dyn RelayStore> = Arc::new(relay.clone());
        let alice = SignalingClient::new(Arc::clone(&store), "alice", "Alice");
        let bob = SignalingClient::new(store, "bob", "Bob");
        (relay, alice, bob)
    }

    #[test]
    fn records_use_the_relay_field_names() {
        let call_id = Uuid::new_v4();
        let record = SignalingRecord {
            kind: RecordKind::Offer,
            call_id,
            from: "alice".to_string(),
            from_name: "Alice".to_string(),
            sdp: "v=0".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "type": "offer",
                "callId": call_id.to_string(),
                "from": "alice",
                "fromName": "Alice",
                "sdp": "v=0"
            })
        );
        let candidate = CandidateRecord { call_id, from: "bob".to_string(), candidate: "c".to_string() };
        assert_eq!(
            serde_json::to_value(&candidate).unwrap(),
            json!({ "callId": call_id.to_string(), "from": "bob", "candidate": "c" })
        );
        assert_eq!(serde_json::to_value(Presence::InCall).unwrap(), json!("inCall"));
    }

    #[tokio::test]
    async fn offer_lands_at_recipient_address() {
        let (_relay, alice, bob) = pair();
        let mut incoming = bob.watch_incoming();
        assert_eq!(incoming.next().await.unwrap().unwrap(), None);

        let call_id = Uuid::new_v4();
        alice.post_offer("bob", call_id, "offer-sdp").await.unwrap();
        let record = incoming.next().await.unwrap().unwrap().unwrap();
        assert_eq!(record.kind, RecordKind::Offer);
        assert_eq!(record.call_id, call_id);
        assert_eq!(record.from, "alice");
        assert_eq!(record.from_name, "Alice");
    }

    #[tokio::test]
    async fn candidates_are_yielded_once_in_order() {
        let (_relay, alice, bob) = pair();
        let mut inbox = bob.watch_candidates();
        let call_id = Uuid::new_v4();
        for candidate in ["c1", "c2", "c3"] {
            alice.push_candidate("bob", call_id, candidate).await.unwrap();
        }
        let mut received = Vec::new();
        while received.len() < 3 {
            received.push(inbox.next().await.unwrap().unwrap().candidate);
        }
        assert_eq!(received, ["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn clear_removes_address_and_inbox() {
        let (relay, alice, bob) = pair();
        let call_id = Uuid::new_v4();
        alice.post_offer("bob", call_id, "sdp").await.unwrap();
        alice.push_candidate("bob", call_id, "c1").await.unwrap();
        bob.set_presence(Presence::Online).await.unwrap();

        bob.clear("bob").await.unwrap();
        assert_eq!(relay.paths().await, ["users/bob"]);

        let presence = alice.presence("bob").await.unwrap().unwrap();
        assert_eq!(presence.presence, Presence::Online);
        assert_eq!(presence.display_name, "Bob");
    }
}
