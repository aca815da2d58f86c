//! The user-facing entry point tying a query function to its shared cache.

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::QueryFn;
use crate::error::QueryResult;
use crate::options::{EndpointOptions, QueryOptions};
use crate::query::cache::QueryCache;
use crate::query::handle::Query;
use crate::{QueryArg, QueryData};

/// An asynchronous operation with a shared cache of its results.
///
/// An endpoint owns one [`QueryCache`] and mints [`Query`] handles against
/// it; every handle created from the same endpoint shares cached data and
/// in-flight invocations per argument. Cloning an endpoint clones the
/// reference, not the cache.
///
/// # Example
///
/// ```
/// use requery::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let endpoint = Endpoint::new(|id: u32, _token| async move {
///     Ok::<_, QueryError>(format!("user-{id}"))
/// });
///
/// let query = endpoint.query();
/// let user = query.set_arg(1).await.unwrap();
/// assert_eq!(user, "user-1");
/// # }
/// ```
pub struct Endpoint<K, V> {
    cache: Arc<QueryCache<K, V>>,
}

impl<K, V> Endpoint<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    /// Creates an endpoint with default options around an async query
    /// function.
    ///
    /// The function receives the argument and a cancellation token; honoring
    /// the token is optional, but a function that ignores it keeps running
    /// after its query state has been reset.
    pub fn new<F, Fut>(fetcher: F) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueryResult<V>> + Send + 'static,
    {
        Self::with_options(fetcher, EndpointOptions::default())
    }

    /// Creates an endpoint with the given options.
    pub fn with_options<F, Fut>(fetcher: F, options: EndpointOptions<K, V>) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueryResult<V>> + Send + 'static,
    {
        let query_fn: QueryFn<K, V> = Arc::new(move |arg, token| fetcher(arg, token).boxed());
        Self {
            cache: Arc::new(QueryCache::new(query_fn, options)),
        }
    }

    /// Mints a handle with the endpoint's default options.
    pub fn query(&self) -> Query<K, V> {
        self.query_with(QueryOptions::default())
    }

    /// Mints a handle with per-handle option overrides.
    pub fn query_with(&self, options: QueryOptions<K, V>) -> Query<K, V> {
        Query::new(Arc::clone(&self.cache), options, self.cache.options())
    }

    /// The cache shared by every handle of this endpoint.
    pub fn cache(&self) -> &Arc<QueryCache<K, V>> {
        &self.cache
    }

    /// Marks the cached result for `arg` stale; entries with attached
    /// observers refetch immediately.
    pub fn invalidate(&self, arg: &K) {
        self.cache.invalidate(arg);
    }

    /// Invalidates every cached result of this endpoint.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Replaces the cached data for `arg` without running the query
    /// function. Returns `false` if nothing is cached for `arg`.
    pub fn update_data(&self, arg: &K, data: V) -> bool {
        self.cache.update_data(arg, data)
    }

    /// Fetches and caches the result for `arg` ahead of time, so a later
    /// bind is served without loading. Does nothing when a fresh result is
    /// already cached or a fetch is in flight; errors are left on the entry.
    pub async fn prefetch(&self, arg: K) {
        let entry = self.cache.get_or_create(arg);
        if !entry.is_fetching() && entry.is_stale(self.cache.options().default_stale_time) {
            let _ = entry.fetch(None).await;
        }
    }
}

impl<K, V> Clone for Endpoint<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<K, V> std::fmt::Debug for Endpoint<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("cache", &self.cache).finish()
    }
}
