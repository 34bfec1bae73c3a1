//! Shared key-value store used as an out-of-band signaling mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt as _};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};

use crate::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Path-addressed JSON store with append lists and change streams.
///
/// Paths are slash-separated (`calls/alice`). A path written with
/// [`RelayStore::push`] holds an object whose keys sort in append order.
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Append `value` under `path` and return its generated key.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Delete `path`. Removing a missing path is not an error.
    async fn remove(&self, path: &str) -> Result<()>;

    /// The current value at `path` followed by every later change.
    fn watch(&self, path: &str) -> BoxStream<'static, Result<Option<Value>>>;
}

/// In-process relay. Clones share the same data.
#[derive(Clone)]
pub struct MemoryRelay {
    entries: Arc<Mutex<HashMap<String, Value>>>,
    changes: broadcast::Sender<String>,
    next_key: Arc<AtomicU64>,
}

impl MemoryRelay {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            changes,
            next_key: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Every populated path, for inspection in tests and demos.
    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn notify(&self, path: &str) {
        // No receivers is fine.
        let _ = self.changes.send(path.to_string());
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay").finish_non_exhaustive()
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().await.get(path).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        if value.is_null() {
            return self.remove(path).await;
        }
        self.entries.lock().await.insert(path.to_string(), value);
        self.notify(path);
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let key = format!("{:020}", self.next_key.fetch_add(1, Ordering::Relaxed));
        {
            let mut entries = self.entries.lock().await;
            let list = entries
                .entry(path.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(list) = list else {
                return Err(Error::Relay(format!("{path} is not a list")));
            };
            list.insert(key.clone(), value);
        }
        self.notify(path);
        Ok(key)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let removed = self.entries.lock().await.remove(path).is_some();
        if removed {
            self.notify(path);
        }
        Ok(())
    }

    fn watch(&self, path: &str) -> BoxStream<'static, Result<Option<Value>>> {
        // Subscribe before the first read so no change can slip in between.
        let rx = self.changes.subscribe();
        let entries = Arc::clone(&self.entries);
        let path = path.to_string();

        stream::unfold((rx, entries, path, true), |(mut rx, entries, path, first)| async move {
            if first {
                let current = entries.lock().await.get(&path).cloned();
                return Some((Ok(current), (rx, entries, path, false)));
            }
            loop {
                match rx.recv().await {
                    Ok(changed) if changed == path => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(path = %path, skipped, "Relay watcher lagged, re-reading");
                        break;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
            let current = entries.lock().await.get(&path).cloned();
            Some((Ok(current), (rx, entries, path, false)))
        })
        .boxed()
    }
}
