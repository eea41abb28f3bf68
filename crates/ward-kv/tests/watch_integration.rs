//! Integration tests for watches over an unreliable backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use ward_kv::{
    BackoffConfig, KvBackend, KvCache, KvError, KvQuery, KvResult, KvSnapshot, MemoryKv,
    WatchConfig, Watcher,
};

// ==================== Helpers ====================

/// Wraps a memory store and can simulate a disconnected agent.
struct DisconnectingKv {
    inner: MemoryKv,
    down: AtomicBool,
    failed_reads: AtomicU32,
}

impl DisconnectingKv {
    fn new() -> Self {
        Self {
            inner: MemoryKv::new(),
            down: AtomicBool::new(false),
            failed_reads: AtomicU32::new(0),
        }
    }
}

impl KvBackend for DisconnectingKv {
    async fn fetch(
        &self,
        query: &KvQuery,
        wait_index: u64,
        wait: Duration,
    ) -> KvResult<KvSnapshot> {
        if self.down.load(Ordering::SeqCst) {
            self.failed_reads.fetch_add(1, Ordering::SeqCst);
            return Err(KvError::Transport("connection refused".to_string()));
        }
        // Shorten holds so a disconnect is noticed promptly.
        self.inner
            .fetch(query, wait_index, wait.min(Duration::from_secs(1)))
            .await
    }
}

fn config() -> WatchConfig {
    WatchConfig {
        blocking_wait: Duration::from_secs(1),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        },
    }
}

// ==================== Tests ====================

#[tokio::test(start_paused = true)]
async fn test_watch_resubscribes_after_disconnect() {
    let backend = Arc::new(DisconnectingKv::new());
    backend.inner.put("config/region", "eu-west");

    let cache = Arc::new(KvCache::new(Arc::clone(&backend), Duration::from_secs(3600)));
    let watcher = Watcher::new(Arc::clone(&cache), config());
    let query = KvQuery::key("config/region").expect("valid key");
    let mut events = watcher.watch(query.clone());

    let first = events.next().await.expect("initial event");
    assert_eq!(first.index, 2);

    // Take the agent down, change the data behind its back, bring it back.
    let control = Arc::clone(&backend);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        control.down.store(true, Ordering::SeqCst);
        // Let the in-flight read expire so the change lands during the outage.
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.inner.put("config/region", "us-east");
        tokio::time::sleep(Duration::from_secs(4)).await;
        control.down.store(false, Ordering::SeqCst);
    });

    let start = Instant::now();
    let event = events.next().await.expect("event after resubscription");
    assert_eq!(event.index, 3);
    assert!(start.elapsed() >= Duration::from_millis(6500));
    assert!(backend.failed_reads.load(Ordering::SeqCst) >= 2);

    let cached = cache.cached(&query).expect("cached snapshot");
    assert_eq!(
        cached.get("config/region").map(|p| p.value.clone()),
        Some(b"us-east".to_vec())
    );
}

#[tokio::test(start_paused = true)]
async fn test_cache_serves_last_value_during_outage() {
    let backend = Arc::new(DisconnectingKv::new());
    backend.inner.put("config/region", "eu-west");

    let cache = Arc::new(KvCache::new(Arc::clone(&backend), Duration::from_millis(10)));
    let watcher = Watcher::new(Arc::clone(&cache), config());
    let query = KvQuery::key("config/region").expect("valid key");
    let mut events = watcher.watch(query.clone());
    events.next().await.expect("initial event");

    backend.down.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(1)).await;

    let view = cache.view(std::slice::from_ref(&query)).await;
    assert_eq!(view.get("config/region"), Some("eu-west"));
}

#[tokio::test(start_paused = true)]
async fn test_prefix_watch_fires_for_any_key_beneath() {
    let backend = Arc::new(MemoryKv::new());
    backend.put("config/services/consul/datacenter", "eu-west");

    let cache = Arc::new(KvCache::new(Arc::clone(&backend), Duration::from_secs(3600)));
    let watcher = Watcher::new(cache, config());
    let mut events = watcher.watch(KvQuery::parse("config/services/").expect("valid prefix"));
    assert_eq!(events.next().await.expect("initial").index, 2);

    let writer = Arc::clone(&backend);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        writer.put("unrelated/key", "x");
        writer.put("config/services/vault/port", "8200");
    });

    let event = events.next().await.expect("prefix change");
    assert_eq!(event.index, 4);
}
