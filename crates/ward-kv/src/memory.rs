//! In-process key-value backend with Consul-style index semantics.
//!
//! Every write bumps a single store-wide counter. A query's index is the
//! highest modify index among its matching keys and deletion tombstones, so
//! unrelated writes never wake a blocked reader.
//!
//! The counter starts at [`INITIAL_INDEX`], as on a bootstrapped cluster, so
//! every write is above the smallest index a blocking read can wait on.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use crate::backend::KvBackend;
use crate::error::{KvError, KvResult};
use crate::types::{KvPair, KvQuery, KvSnapshot};

#[derive(Debug, Default)]
struct MemoryState {
    index: u64,
    entries: BTreeMap<String, KvPair>,
    tombstones: BTreeMap<String, u64>,
}

impl MemoryState {
    fn snapshot(&self, query: &KvQuery) -> KvSnapshot {
        let pairs: Vec<KvPair> = match query {
            KvQuery::Key(key) => self.entries.get(key).cloned().into_iter().collect(),
            KvQuery::Prefix(prefix) => self
                .entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                .map(|(_, p)| p.clone())
                .collect(),
        };

        let live = pairs.iter().map(|p| p.modify_index).max().unwrap_or(0);
        let deleted = self
            .tombstones
            .iter()
            .filter(|(k, _)| query.matches(k))
            .map(|(_, idx)| *idx)
            .max()
            .unwrap_or(0);

        KvSnapshot::from_pairs(query.clone(), live.max(deleted), pairs)
    }
}

/// Store-wide index of an empty store. The first write gets the next one.
pub const INITIAL_INDEX: u64 = 1;

/// An in-memory key-value store.
///
/// Used for tests and for running the agent without a cluster.
#[derive(Debug)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
    changed: watch::Sender<u64>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (changed, _) = watch::channel(INITIAL_INDEX);
        Self {
            state: Mutex::new(MemoryState {
                index: INITIAL_INDEX,
                ..MemoryState::default()
            }),
            changed,
        }
    }

    /// Writes a key, returning its new modify index.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> u64 {
        let key = key.into();
        let index = {
            let mut state = self.state.lock();
            state.index += 1;
            let index = state.index;
            state.tombstones.remove(&key);
            state
                .entries
                .insert(key.clone(), KvPair::new(key.clone(), value, index));
            index
        };
        trace!(key = %key, index, "memory kv put");
        self.changed.send_replace(index);
        index
    }

    /// Deletes a key. Returns false if it did not exist.
    pub fn delete(&self, key: &str) -> bool {
        let index = {
            let mut state = self.state.lock();
            if state.entries.remove(key).is_none() {
                return false;
            }
            state.index += 1;
            let index = state.index;
            state.tombstones.insert(key.to_string(), index);
            index
        };
        trace!(key = %key, index, "memory kv delete");
        self.changed.send_replace(index);
        true
    }

    /// The store-wide write counter.
    #[must_use]
    pub fn current_index(&self) -> u64 {
        self.state.lock().index
    }

    /// Reads a query without blocking.
    #[must_use]
    pub fn snapshot(&self, query: &KvQuery) -> KvSnapshot {
        self.state.lock().snapshot(query)
    }
}

impl KvBackend for MemoryKv {
    async fn fetch(
        &self,
        query: &KvQuery,
        wait_index: u64,
        wait: Duration,
    ) -> KvResult<KvSnapshot> {
        // Subscribe before reading so a write between the two is not missed.
        let mut rx = self.changed.subscribe();
        let snapshot = self.snapshot(query);
        if wait_index == 0 || snapshot.index > wait_index || wait.is_zero() {
            return Ok(snapshot);
        }

        let deadline = Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {
                    let snapshot = self.snapshot(query);
                    if snapshot.index > wait_index {
                        return Ok(snapshot);
                    }
                }
                Ok(Err(_)) => return Err(KvError::Closed),
                Err(_) => return Ok(self.snapshot(query)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> KvQuery {
        KvQuery::key(path).expect("valid key")
    }

    #[test]
    fn put_and_snapshot() {
        let kv = MemoryKv::new();
        let idx = kv.put("config/region", "eu-west");
        assert_eq!(idx, 2);

        let snap = kv.snapshot(&key("config/region"));
        assert_eq!(snap.index, 2);
        assert_eq!(
            snap.get("config/region").map(|p| p.value_str().into_owned()),
            Some("eu-west".to_string())
        );
    }

    #[test]
    fn absent_key_has_zero_index() {
        let kv = MemoryKv::new();
        kv.put("other", "x");
        let snap = kv.snapshot(&key("config/region"));
        assert_eq!(snap.index, 0);
        assert!(snap.is_empty());
    }

    #[test]
    fn prefix_snapshot_collects_matching_keys_only() {
        let kv = MemoryKv::new();
        kv.put("svc/a", "1");
        kv.put("svc/b", "2");
        kv.put("svd/c", "3");

        let snap = kv.snapshot(&KvQuery::prefix("svc/").expect("valid"));
        assert_eq!(snap.pairs.len(), 2);
        assert_eq!(snap.index, 3);
    }

    #[test]
    fn delete_leaves_tombstone_index() {
        let kv = MemoryKv::new();
        kv.put("config/region", "eu-west");
        assert!(kv.delete("config/region"));
        assert!(!kv.delete("config/region"));

        let snap = kv.snapshot(&key("config/region"));
        assert!(snap.is_empty());
        assert_eq!(snap.index, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out_with_unchanged_index() {
        let kv = MemoryKv::new();
        kv.put("config/region", "eu-west");

        let start = Instant::now();
        let snap = kv
            .fetch(&key("config/region"), 2, Duration::from_secs(30))
            .await
            .expect("fetch");
        assert_eq!(snap.index, 2);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_ignores_unrelated_writes() {
        let kv = std::sync::Arc::new(MemoryKv::new());
        kv.put("config/region", "eu-west");

        let writer = std::sync::Arc::clone(&kv);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.put("unrelated", "x");
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.put("config/region", "us-east");
        });

        let start = Instant::now();
        let snap = kv
            .fetch(&key("config/region"), 2, Duration::from_secs(60))
            .await
            .expect("fetch");
        assert_eq!(snap.index, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn zero_wait_index_never_blocks() {
        let kv = MemoryKv::new();
        let snap = kv
            .fetch(&key("config/region"), 0, Duration::from_secs(3600))
            .await
            .expect("fetch");
        assert_eq!(snap.index, 0);
    }
}
