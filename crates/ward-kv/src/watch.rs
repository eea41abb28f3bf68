//! Resubscribing watch streams over a blocking backend.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tracing::{debug, info, warn};

use crate::backend::KvBackend;
use crate::backoff::{Backoff, BackoffConfig};
use crate::cache::KvCache;
use crate::types::{ChangeEvent, KvQuery};

/// Default server-side hold time for a blocking read.
pub const DEFAULT_BLOCKING_WAIT: Duration = Duration::from_secs(300);

/// Configuration shared by all watches of a [`Watcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    /// How long each blocking read may be held open.
    pub blocking_wait: Duration,
    /// Backoff applied between failed reads.
    pub backoff: BackoffConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            blocking_wait: DEFAULT_BLOCKING_WAIT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Creates change-event streams for queries, feeding the shared cache.
pub struct Watcher<B> {
    cache: Arc<KvCache<B>>,
    config: WatchConfig,
}

impl<B: KvBackend> Watcher<B> {
    /// Creates a watcher that stores every fetched snapshot in `cache`.
    #[must_use]
    pub const fn new(cache: Arc<KvCache<B>>, config: WatchConfig) -> Self {
        Self { cache, config }
    }

    /// The cache this watcher feeds.
    #[must_use]
    pub const fn cache(&self) -> &Arc<KvCache<B>> {
        &self.cache
    }

    /// Watches a query.
    ///
    /// The stream never ends. Its first item is produced by the first
    /// successful read; after that an item is produced whenever the query's
    /// index moves. Failed reads are retried with backoff, and the cache
    /// keeps serving the last snapshot meanwhile.
    pub fn watch(&self, query: KvQuery) -> BoxStream<'static, ChangeEvent> {
        let state = WatchState {
            cache: Arc::clone(&self.cache),
            blocking_wait: self.config.blocking_wait,
            backoff: Backoff::new(self.config.backoff.clone()),
            query,
            last_index: None,
        };

        stream::unfold(state, |mut state| async move {
            let event = state.next_event().await;
            Some((event, state))
        })
        .boxed()
    }
}

struct WatchState<B> {
    cache: Arc<KvCache<B>>,
    blocking_wait: Duration,
    backoff: Backoff,
    query: KvQuery,
    last_index: Option<u64>,
}

impl<B: KvBackend> WatchState<B> {
    async fn next_event(&mut self) -> ChangeEvent {
        loop {
            // Index 0 means "don't block"; a known index of 0 must still block.
            let wait_index = self.last_index.map_or(0, |i| i.max(1));
            let result = self
                .cache
                .backend()
                .fetch(&self.query, wait_index, self.blocking_wait)
                .await;

            let snapshot = match result {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        query = %self.query,
                        error = %e,
                        attempt = self.backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "watch read failed, resubscribing"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            if self.backoff.failures() > 0 {
                info!(query = %self.query, index = snapshot.index, "watch resubscribed");
            }
            self.backoff.reset();

            let index = snapshot.index;
            if self.last_index.is_some_and(|last| index < last) {
                warn!(
                    query = %self.query,
                    index,
                    previous = ?self.last_index,
                    "watch index went backwards, resetting"
                );
                self.last_index = None;
                continue;
            }

            self.cache.store(snapshot);
            if self.last_index == Some(index) {
                continue;
            }

            debug!(query = %self.query, index, "watch observed change");
            self.last_index = Some(index);
            return ChangeEvent::new(self.query.clone(), index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_MAX_STALE;
    use crate::memory::MemoryKv;

    fn watcher(backend: &Arc<MemoryKv>) -> Watcher<MemoryKv> {
        let cache = Arc::new(KvCache::new(Arc::clone(backend), DEFAULT_MAX_STALE));
        Watcher::new(
            cache,
            WatchConfig {
                blocking_wait: Duration::from_secs(30),
                backoff: BackoffConfig::default(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn first_read_always_emits() {
        let backend = Arc::new(MemoryKv::new());
        let watcher = watcher(&backend);
        let query = KvQuery::key("config/region").expect("valid");

        let mut events = watcher.watch(query.clone());
        let event = events.next().await.expect("initial event");
        assert_eq!(event.query, query);
        assert_eq!(event.index, 0);
        assert!(watcher.cache().cached(&query).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_without_change_do_not_emit() {
        let backend = Arc::new(MemoryKv::new());
        backend.put("config/region", "eu-west");
        let watcher = watcher(&backend);
        let query = KvQuery::key("config/region").expect("valid");

        let mut events = watcher.watch(query);
        events.next().await.expect("initial event");

        let writer = Arc::clone(&backend);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(95)).await;
            writer.put("config/region", "us-east");
        });

        let start = tokio::time::Instant::now();
        let event = events.next().await.expect("change event");
        assert_eq!(event.index, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(95));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_key_blocks_until_written() {
        let backend = Arc::new(MemoryKv::new());
        let watcher = watcher(&backend);
        let query = KvQuery::key("config/region").expect("valid");

        let mut events = watcher.watch(query.clone());
        assert_eq!(events.next().await.expect("initial").index, 0);

        let writer = Arc::clone(&backend);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            writer.put("config/region", "eu-west");
        });

        let start = tokio::time::Instant::now();
        let event = events.next().await.expect("change");
        assert_eq!(event.index, 2);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        let cached = watcher.cache().cached(&query).expect("cached");
        assert_eq!(
            cached.get("config/region").map(|p| p.value.clone()),
            Some(b"eu-west".to_vec())
        );
    }
}
