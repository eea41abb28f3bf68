//! The blocking-read contract every key-value backend implements.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::KvResult;
use crate::types::{KvQuery, KvSnapshot};

/// A key-value store that supports blocking (long-poll) reads.
///
/// `fetch` resolves as soon as the query's index is greater than
/// `wait_index`, or when `wait` elapses, whichever comes first. Either way
/// the current snapshot is returned; callers compare indexes to decide
/// whether anything changed. A `wait_index` of zero never blocks.
#[allow(async_fn_in_trait)]
pub trait KvBackend: Send + Sync + 'static {
    /// Performs a blocking read of `query`.
    fn fetch(
        &self,
        query: &KvQuery,
        wait_index: u64,
        wait: Duration,
    ) -> impl Future<Output = KvResult<KvSnapshot>> + Send;
}

impl<B: KvBackend> KvBackend for Arc<B> {
    fn fetch(
        &self,
        query: &KvQuery,
        wait_index: u64,
        wait: Duration,
    ) -> impl Future<Output = KvResult<KvSnapshot>> + Send {
        B::fetch(self, query, wait_index, wait)
    }
}
