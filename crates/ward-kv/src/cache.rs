//! Read-through cache of query snapshots with a staleness bound.
//!
//! Watches keep entries current by storing every snapshot they fetch.
//! Readers get cached data while it is younger than `max_stale`; older
//! entries are re-read from the backend, and if that read fails the stale
//! entry is served anyway so a store outage never blocks rendering.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::KvBackend;
use crate::error::KvResult;
use crate::types::{KvPair, KvQuery, KvSnapshot};

/// Default staleness bound for cached entries.
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: KvSnapshot,
    refreshed_at: Instant,
}

/// Immutable key/value view taken at one instant, used for a single render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvView {
    values: BTreeMap<String, String>,
    taken_at: DateTime<Utc>,
}

impl KvView {
    /// Creates a view from explicit values.
    #[must_use]
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            values,
            taken_at: Utc::now(),
        }
    }

    /// Value of a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// All values in the view.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// When the view was taken.
    #[must_use]
    pub const fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// Read-through snapshot cache shared by watches and renderers.
pub struct KvCache<B> {
    backend: Arc<B>,
    max_stale: Duration,
    entries: RwLock<HashMap<KvQuery, CacheEntry>>,
}

impl<B: KvBackend> KvCache<B> {
    /// Creates an empty cache in front of `backend`.
    #[must_use]
    pub fn new(backend: Arc<B>, max_stale: Duration) -> Self {
        Self {
            backend,
            max_stale,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The backend this cache reads through to.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The configured staleness bound.
    #[must_use]
    pub const fn max_stale(&self) -> Duration {
        self.max_stale
    }

    /// Stores a snapshot, replacing any previous entry for its query.
    pub fn store(&self, snapshot: KvSnapshot) {
        let entry = CacheEntry {
            snapshot,
            refreshed_at: Instant::now(),
        };
        self.entries
            .write()
            .insert(entry.snapshot.query.clone(), entry);
    }

    /// The cached snapshot for a query regardless of age.
    #[must_use]
    pub fn cached(&self, query: &KvQuery) -> Option<KvSnapshot> {
        self.entries.read().get(query).map(|e| e.snapshot.clone())
    }

    /// Returns true if the query has an entry younger than `max_stale`.
    #[must_use]
    pub fn is_fresh(&self, query: &KvQuery) -> bool {
        self.entries
            .read()
            .get(query)
            .is_some_and(|e| e.refreshed_at.elapsed() <= self.max_stale)
    }

    /// Re-reads a query from the backend without blocking and stores it.
    pub async fn refresh(&self, query: &KvQuery) -> KvResult<KvSnapshot> {
        let snapshot = self.backend.fetch(query, 0, Duration::ZERO).await?;
        debug!(query = %query, index = snapshot.index, "cache refreshed");
        self.store(snapshot.clone());
        Ok(snapshot)
    }

    /// Reads a single key through the cache.
    ///
    /// A fresh entry for the key, or for a prefix covering it, answers
    /// directly. Otherwise the key is read from the backend; if that fails
    /// any stale covering entry is used instead.
    pub async fn read(&self, key: &str) -> KvResult<Option<KvPair>> {
        if let Some(found) = self.lookup(key, true) {
            return Ok(found);
        }

        let query = KvQuery::key(key)?;
        match self.refresh(&query).await {
            Ok(snapshot) => Ok(snapshot.get(key).cloned()),
            Err(e) => match self.lookup(key, false) {
                Some(found) => {
                    warn!(key = %key, error = %e, "read-through failed, serving stale value");
                    Ok(found)
                }
                None => Err(e),
            },
        }
    }

    /// Takes a render view of the given queries.
    ///
    /// Stale or missing entries are refreshed first; entries whose refresh
    /// fails are used as they are.
    pub async fn view(&self, queries: &[KvQuery]) -> KvView {
        for query in queries {
            if self.is_fresh(query) {
                continue;
            }
            if let Err(e) = self.refresh(query).await {
                warn!(query = %query, error = %e, "refresh failed, using cached snapshot");
            }
        }

        let entries = self.entries.read();
        let mut values = BTreeMap::new();
        for query in queries {
            if let Some(entry) = entries.get(query) {
                for (key, pair) in &entry.snapshot.pairs {
                    values.insert(key.clone(), pair.value_str().into_owned());
                }
            }
        }
        KvView::new(values)
    }

    fn lookup(&self, key: &str, fresh_only: bool) -> Option<Option<KvPair>> {
        let entries = self.entries.read();
        entries
            .values()
            .filter(|e| e.snapshot.query.matches(key))
            .find(|e| !fresh_only || e.refreshed_at.elapsed() <= self.max_stale)
            .map(|e| e.snapshot.get(key).cloned())
    }
}
