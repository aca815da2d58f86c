//! The argument-keyed registry of query entries.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::options::{EndpointOptions, RetentionPolicy};
use crate::query::entry::QueryEntry;
use crate::{QueryArg, QueryData, QueryFn};

/// An argument-keyed cache of [`QueryEntry`] instances.
///
/// The cache owns creation, lookup, and retention; it never invokes the
/// query function itself, it only hands the shared function reference to the
/// entries it creates. Lookup-or-create goes through the map's entry API, so
/// two concurrent lookups for an equal argument can never create two
/// instances.
pub struct QueryCache<K, V> {
    query_fn: QueryFn<K, V>,
    options: Arc<EndpointOptions<K, V>>,
    entries: DashMap<K, Arc<QueryEntry<K, V>>>,
}

impl<K, V> QueryCache<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    /// Creates an empty cache around the given query function.
    pub fn new(query_fn: QueryFn<K, V>, options: EndpointOptions<K, V>) -> Self {
        Self {
            query_fn,
            options: Arc::new(options),
            entries: DashMap::new(),
        }
    }

    pub(crate) fn query_fn(&self) -> &QueryFn<K, V> {
        &self.query_fn
    }

    pub(crate) fn options(&self) -> &Arc<EndpointOptions<K, V>> {
        &self.options
    }

    /// Returns the entry for `arg`, creating and registering an idle one if
    /// none exists. Repeated lookups for equal arguments return the same
    /// instance.
    pub fn get_or_create(&self, arg: K) -> Arc<QueryEntry<K, V>> {
        match self.entries.entry(arg) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                tracing::trace!(arg = ?vacant.key(), "creating query cache entry");
                let created = Arc::new(QueryEntry::new(
                    vacant.key().clone(),
                    self.query_fn.clone(),
                    Arc::clone(&self.options),
                ));
                vacant.insert(Arc::clone(&created));
                created
            }
        }
    }

    /// Builds a fresh entry for `arg` that is never registered in the cache.
    ///
    /// Used for invocations that must not share state with other callers of
    /// the same argument, typically side-effecting operations.
    pub fn create_uncached(&self, arg: K) -> Arc<QueryEntry<K, V>> {
        Arc::new(QueryEntry::new(
            arg,
            self.query_fn.clone(),
            Arc::clone(&self.options),
        ))
    }

    /// Looks up the registered entry for `arg` without creating one.
    pub fn get(&self, arg: &K) -> Option<Arc<QueryEntry<K, V>>> {
        self.entries.get(arg).map(|entry| Arc::clone(&entry))
    }

    /// The number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Marks the entry for `arg` stale, refetching if it has observers.
    pub fn invalidate(&self, arg: &K) {
        if let Some(entry) = self.get(arg) {
            entry.invalidate();
        }
    }

    /// Invalidates every registered entry.
    pub fn invalidate_all(&self) {
        // Collect first so no shard lock is held while entries notify.
        let entries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for entry in entries {
            entry.invalidate();
        }
    }

    /// Replaces the cached data for `arg` with a fresh success, without
    /// running an invocation. Returns `false` if no entry exists.
    pub fn update_data(&self, arg: &K, data: V) -> bool {
        match self.get(arg) {
            Some(entry) => {
                entry.set_data(data);
                true
            }
            None => false,
        }
    }

    /// Applies the retention policy to an entry whose observer may have just
    /// detached. Entries that still have observers are always kept.
    pub(crate) fn release(self: &Arc<Self>, arg: &K) {
        let Some(entry) = self.get(arg) else {
            return;
        };
        if entry.observer_count() > 0 {
            return;
        }
        match self.options.retention {
            RetentionPolicy::KeepForever => {}
            RetentionPolicy::EvictImmediately => self.evict_if_idle(arg),
            RetentionPolicy::KeepFor(delay) => {
                // Eviction needs a timer. Without a runtime on this thread
                // the entry is simply kept; a later release retries.
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let cache = Arc::downgrade(self);
                    let arg = arg.clone();
                    runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(cache) = cache.upgrade() {
                            cache.evict_if_idle(&arg);
                        }
                    });
                }
            }
        }
    }

    /// Removes the entry for `arg` unless an observer re-attached.
    fn evict_if_idle(&self, arg: &K) {
        let removed = self
            .entries
            .remove_if(arg, |_, entry| entry.observer_count() == 0);
        if removed.is_some() {
            tracing::trace!(?arg, "evicted idle query cache entry");
        }
    }
}

impl<K, V> std::fmt::Debug for QueryCache<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.entries.len())
            .field("retention", &self.options.retention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn echo_cache() -> Arc<QueryCache<u32, String>> {
        let query_fn: QueryFn<u32, String> =
            Arc::new(|arg, _token| async move { Ok(arg.to_string()) }.boxed());
        Arc::new(QueryCache::new(query_fn, EndpointOptions::default()))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let cache = echo_cache();

        let first = cache.get_or_create(1);
        let second = cache.get_or_create(1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        let other = cache.get_or_create(2);
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_uncached_entries_are_not_registered() {
        let cache = echo_cache();

        let uncached = cache.create_uncached(1);
        assert!(cache.is_empty());
        assert!(cache.get(&1).is_none());

        let registered = cache.get_or_create(1);
        assert!(!Arc::ptr_eq(&uncached, &registered));
    }

    #[test]
    fn test_get_does_not_create() {
        let cache = echo_cache();
        assert!(cache.get(&1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_data_requires_existing_entry() {
        let cache = echo_cache();
        assert!(!cache.update_data(&1, "value".to_string()));

        cache.get_or_create(1);
        assert!(cache.update_data(&1, "value".to_string()));
        assert_eq!(cache.get(&1).unwrap().data(), Some("value".to_string()));
    }

    #[tokio::test]
    async fn test_release_without_observers_evicts_immediately() {
        let query_fn: QueryFn<u32, String> =
            Arc::new(|arg, _token| async move { Ok(arg.to_string()) }.boxed());
        let cache = Arc::new(QueryCache::new(
            query_fn,
            EndpointOptions {
                retention: RetentionPolicy::EvictImmediately,
                ..Default::default()
            },
        ));

        cache.get_or_create(1);
        assert_eq!(cache.len(), 1);

        cache.release(&1);
        assert!(cache.is_empty());
    }
}
