//! # ward-kv
//!
//! The key-value side of ward: everything a template needs to know about
//! the cluster's configuration data.
//!
//! - **Blocking reads**: [`KvBackend`] long-polls a query until its index moves
//! - **Backends**: [`ConsulKv`] for a Consul agent, [`MemoryKv`] in-process
//! - **Read-through cache**: [`KvCache`] with an explicit staleness bound
//! - **Watches**: [`Watcher`] turns blocking reads into an endless stream of
//!   [`ChangeEvent`]s, resubscribing with backoff after failures
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ward_kv::{KvCache, KvQuery, MemoryKv, WatchConfig, Watcher, DEFAULT_MAX_STALE};
//!
//! let backend = Arc::new(MemoryKv::new());
//! backend.put("config/services/consul/datacenter", "eu-west");
//!
//! let cache = Arc::new(KvCache::new(backend, DEFAULT_MAX_STALE));
//! let watcher = Watcher::new(cache, WatchConfig::default());
//! let query = KvQuery::parse("config/services/consul/datacenter").expect("valid key");
//! let _events = watcher.watch(query);
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod backoff;
pub mod cache;
pub mod consul;
pub mod error;
pub mod memory;
pub mod types;
pub mod watch;

pub use backend::KvBackend;
pub use backoff::{Backoff, BackoffConfig};
pub use cache::{DEFAULT_MAX_STALE, KvCache, KvView};
pub use consul::ConsulKv;
pub use error::{KvError, KvResult};
pub use memory::MemoryKv;
pub use types::{ChangeEvent, KvPair, KvQuery, KvSnapshot};
pub use watch::{DEFAULT_BLOCKING_WAIT, WatchConfig, Watcher};
