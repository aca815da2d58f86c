//! The externally facing query handle.
//!
//! A [`Query`] binds to the cached [`QueryEntry`] for its current argument
//! and re-binds whenever the argument changes, with exactly one
//! unsubscribe-then-subscribe pair per change. All of its status/data
//! projections are computed from the bound entry at read time, so a handle
//! can never diverge from the instance's true state.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio_util::sync::CancellationToken;

use crate::error::{QueryError, QueryResult};
use crate::events::{Listeners, ListenerGuard, QueryEvent, QueryFailure, QuerySuccess, guard_callback};
use crate::options::{EndpointOptions, FailureCallback, QueryOptions, SuccessCallback};
use crate::query::cache::QueryCache;
use crate::query::entry::{EntryObserver, ObserverId, QueryEntry, SharedInvocation};
use crate::retry::RetryHandler;
use crate::status::QueryStatus;
use crate::{QueryArg, QueryData};

struct BoundEntry<K, V> {
    entry: Arc<QueryEntry<K, V>>,
    observer: ObserverId,
}

struct Binding<K, V> {
    current: Option<BoundEntry<K, V>>,
    /// Lookup-only back-reference to the most recent entry that succeeded,
    /// serving "last known good data" while a newer argument loads.
    last_successful: Option<Weak<QueryEntry<K, V>>>,
}

struct HandleCore<K, V> {
    cache: Arc<QueryCache<K, V>>,
    stale_time: Duration,
    retry: Option<Arc<dyn RetryHandler<K, V>>>,
    on_success: Option<SuccessCallback<K, V>>,
    on_failure: Option<FailureCallback<K>>,
    bound: Mutex<Binding<K, V>>,
    state_changed: Listeners<()>,
    succeeded: Listeners<QuerySuccess<K, V>>,
    failed: Listeners<QueryFailure<K>>,
}

impl<K, V> HandleCore<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    fn lock_bound(&self) -> std::sync::MutexGuard<'_, Binding<K, V>> {
        self.bound.lock().expect("query binding poisoned")
    }

    fn current_entry(&self) -> Option<Arc<QueryEntry<K, V>>> {
        self.lock_bound()
            .current
            .as_ref()
            .map(|bound| Arc::clone(&bound.entry))
    }

    fn detach(&self) {
        let previous = self.lock_bound().current.take();
        if let Some(previous) = previous {
            previous.entry.remove_observer(previous.observer);
            self.cache.release(previous.entry.arg());
        }
    }
}

impl<K, V> EntryObserver<K, V> for HandleCore<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    fn on_entry_event(&self, event: &QueryEvent<K, V>) {
        match event {
            QueryEvent::StateChanged => self.state_changed.emit(&()),
            QueryEvent::Succeeded(success) => {
                {
                    let mut bound = self.lock_bound();
                    bound.last_successful = bound
                        .current
                        .as_ref()
                        .map(|current| Arc::downgrade(&current.entry));
                }
                if let Some(callback) = &self.on_success {
                    guard_callback(|| callback(success));
                }
                self.succeeded.emit(success);
            }
            QueryEvent::Failed(failure) => {
                if let Some(callback) = &self.on_failure {
                    guard_callback(|| callback(failure));
                }
                self.failed.emit(failure);
            }
        }
    }
}

/// A handle observing the cached query state for one argument at a time.
///
/// Handles are minted by an [`Endpoint`](crate::endpoint::Endpoint); several
/// handles with the same argument share a single cached entry and a single
/// in-flight invocation. Dropping a handle detaches it.
pub struct Query<K: QueryArg, V: QueryData> {
    core: Arc<HandleCore<K, V>>,
}

impl<K, V> Query<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    pub(crate) fn new(
        cache: Arc<QueryCache<K, V>>,
        options: QueryOptions<K, V>,
        defaults: &EndpointOptions<K, V>,
    ) -> Self {
        let core = Arc::new(HandleCore {
            stale_time: options.stale_time.unwrap_or(defaults.default_stale_time),
            retry: options.retry.or_else(|| defaults.retry.clone()),
            on_success: options.on_success,
            on_failure: options.on_failure,
            cache,
            bound: Mutex::new(Binding {
                current: None,
                last_successful: None,
            }),
            state_changed: Listeners::new(),
            succeeded: Listeners::new(),
            failed: Listeners::new(),
        });
        Self { core }
    }

    /// Updates the argument, re-running the query if it changed.
    ///
    /// Binds to the cached entry for `arg` (creating it if absent) and
    /// starts an invocation when the entry is stale and not already
    /// fetching. The binding happens synchronously when this method is
    /// called; the returned future resolves with the entry's current
    /// invocation, immediately if a fresh success is cached. Setting an
    /// argument equal to the current one is a no-op.
    pub fn set_arg(&self, arg: K) -> BoxFuture<'static, QueryResult<V>> {
        self.bind(arg, false).boxed()
    }

    /// Like [`set_arg`](Self::set_arg), but always starts a new invocation,
    /// even when the argument is unchanged and the cached data is fresh.
    pub fn set_arg_forced(&self, arg: K) -> BoxFuture<'static, QueryResult<V>> {
        self.bind(arg, true).boxed()
    }

    /// Re-runs the query with the current argument.
    ///
    /// The invocation starts synchronously when this method is called.
    /// Resolves with [`QueryError::Uninitialized`] if no argument has ever
    /// been set.
    pub fn refetch(&self) -> BoxFuture<'static, QueryResult<V>> {
        match self.core.current_entry() {
            Some(entry) => entry.fetch(self.core.retry.clone()).boxed(),
            None => future::ready(Err(QueryError::Uninitialized)).boxed(),
        }
    }

    /// Runs the query without sharing state or cache with other handles.
    ///
    /// Builds a fresh, unregistered entry for `arg`, binds to it, and always
    /// invokes the query function. Use this for operations with side effects,
    /// where sharing an in-flight call between callers of the same argument
    /// would be incorrect.
    pub fn trigger(&self, arg: K) -> BoxFuture<'static, QueryResult<V>> {
        let entry = self.core.cache.create_uncached(arg);
        let previous = {
            let mut bound = self.core.lock_bound();
            let previous = bound.current.take();
            if let Some(previous) = &previous {
                previous.entry.remove_observer(previous.observer);
            }
            let core: Arc<dyn EntryObserver<K, V>> = Arc::clone(&self.core) as _;
            let sink: Weak<dyn EntryObserver<K, V>> = Arc::downgrade(&core);
            let observer = entry.add_observer(sink);
            bound.current = Some(BoundEntry {
                entry: Arc::clone(&entry),
                observer,
            });
            previous
        };
        if let Some(previous) = previous {
            self.core.cache.release(previous.entry.arg());
        }
        entry.fetch(self.core.retry.clone()).boxed()
    }

    /// Runs the raw query function once, bypassing the cache, the bound
    /// state, and any configured retry handler.
    pub fn invoke(&self, arg: K) -> BoxFuture<'static, QueryResult<V>> {
        (self.core.cache.query_fn())(arg, CancellationToken::new())
    }

    /// Cancels the bound entry's outstanding invocation, if any.
    pub fn cancel(&self) {
        if let Some(entry) = self.core.current_entry() {
            entry.cancel();
        }
    }

    /// Unsubscribes from the bound entry, leaving the handle uninitialized.
    pub fn detach(&self) {
        self.core.detach();
    }

    /// The entry this handle is currently bound to.
    pub fn current_entry(&self) -> Option<Arc<QueryEntry<K, V>>> {
        self.core.current_entry()
    }

    /// The current argument, if one has been set.
    pub fn arg(&self) -> Option<K> {
        self.core
            .current_entry()
            .map(|entry| entry.arg().clone())
    }

    /// The bound entry's status, or `Idle` when uninitialized.
    pub fn status(&self) -> QueryStatus {
        self.core
            .current_entry()
            .map_or(QueryStatus::Idle, |entry| entry.status())
    }

    /// The data cached for the current argument.
    pub fn data(&self) -> Option<V> {
        self.core.current_entry().and_then(|entry| entry.data())
    }

    /// The data for the current argument, falling back to the last
    /// successful argument's data while a newer argument is loading.
    pub fn last_data(&self) -> Option<V> {
        let bound = self.core.lock_bound();
        if let Some(current) = &bound.current {
            if current.entry.status() == QueryStatus::Success {
                return current.entry.data();
            }
        }
        let last = bound.last_successful.as_ref()?.upgrade()?;
        if last.status() == QueryStatus::Success {
            last.data()
        } else {
            None
        }
    }

    /// The bound entry's last failure, if any.
    pub fn error(&self) -> Option<QueryError> {
        self.core.current_entry().and_then(|entry| entry.error())
    }

    /// Returns `true` if no argument has ever been set.
    pub fn is_uninitialized(&self) -> bool {
        self.core.lock_bound().current.is_none()
    }

    /// Returns `true` while the bound entry is in the `Loading` state.
    pub fn is_loading(&self) -> bool {
        self.status().is_loading()
    }

    /// Returns `true` while the bound entry has an invocation outstanding.
    pub fn is_fetching(&self) -> bool {
        self.core
            .current_entry()
            .is_some_and(|entry| entry.is_fetching())
    }

    /// Returns `true` if the bound entry's last invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Returns `true` if the bound entry's last invocation failed.
    pub fn is_error(&self) -> bool {
        self.status().is_error()
    }

    /// Returns `true` if the query succeeded and data is available.
    pub fn has_data(&self) -> bool {
        self.is_success() && self.data().is_some()
    }

    /// Registers a callback fired on every state change of the bound entry.
    pub fn on_state_changed(&self, callback: impl Fn() + Send + Sync + 'static) -> ListenerGuard {
        self.core.state_changed.subscribe(move |()| callback())
    }

    /// Registers a callback fired whenever an observed invocation succeeds.
    pub fn on_success(
        &self,
        callback: impl Fn(&QuerySuccess<K, V>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.core.succeeded.subscribe(callback)
    }

    /// Registers a callback fired whenever an observed invocation fails.
    /// Cancellations do not fire it.
    pub fn on_failure(
        &self,
        callback: impl Fn(&QueryFailure<K>) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.core.failed.subscribe(callback)
    }

    /// Binds to the cached entry for `arg` and resolves the invocation the
    /// caller should await. No suspension occurs between checking the bound
    /// state and acting on it.
    fn bind(&self, arg: K, force: bool) -> SharedInvocation<V> {
        let entry = self.core.cache.get_or_create(arg);
        let (rebound, previous) = {
            let mut bound = self.core.lock_bound();
            let same = bound
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(&current.entry, &entry));
            if same {
                (false, None)
            } else {
                let previous = bound.current.take();
                if let Some(previous) = &previous {
                    previous.entry.remove_observer(previous.observer);
                }
                let core: Arc<dyn EntryObserver<K, V>> = Arc::clone(&self.core) as _;
                let sink: Weak<dyn EntryObserver<K, V>> = Arc::downgrade(&core);
                let observer = entry.add_observer(sink);
                bound.current = Some(BoundEntry {
                    entry: Arc::clone(&entry),
                    observer,
                });
                (true, previous)
            }
        };
        if let Some(previous) = previous {
            self.core.cache.release(previous.entry.arg());
        }

        if force || (rebound && !entry.is_fetching() && entry.is_stale(self.core.stale_time)) {
            return entry.fetch(self.core.retry.clone());
        }
        match entry.last_invocation() {
            Some(invocation) => invocation,
            None => match entry.data() {
                // Fresh data installed without an invocation (update_data).
                Some(data) => future::ready(Ok(data)).boxed().shared(),
                // Never invoked and nothing cached, so run it now.
                None => entry.fetch(self.core.retry.clone()),
            },
        }
    }
}

impl<K, V> std::fmt::Debug for Query<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("arg", &self.arg())
            .field("status", &self.status())
            .finish()
    }
}

impl<K, V> Drop for Query<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    fn drop(&mut self) {
        self.core.detach();
    }
}
