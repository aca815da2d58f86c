//! The fixed-argument query state machine.
//!
//! A [`QueryEntry`] owns everything the cache knows about one argument value:
//! the lifecycle status, the last data and error, the in-flight invocation,
//! and the observers interested in all of it. It is the unit of caching and
//! deduplication; handles binding to the same argument share one entry and
//! therefore one in-flight invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{QueryError, QueryResult};
use crate::events::{QueryEvent, QueryFailure, QuerySuccess, guard_callback};
use crate::options::EndpointOptions;
use crate::retry::RetryHandler;
use crate::status::QueryStatus;
use crate::{QueryArg, QueryData, QueryFn};

/// The outcome future of the most recently started invocation.
///
/// Cloneable, so late subscribers await the same in-flight call instead of
/// issuing their own, and completed invocations replay their result.
pub(crate) type SharedInvocation<V> = Shared<BoxFuture<'static, QueryResult<V>>>;

/// Unsubscribe token handed out by [`QueryEntry::add_observer`].
pub(crate) type ObserverId = u64;

/// Sink for events fanned out by a query entry.
pub(crate) trait EntryObserver<K, V>: Send + Sync {
    fn on_entry_event(&self, event: &QueryEvent<K, V>);
}

struct ObserverSlot<K, V> {
    id: ObserverId,
    sink: Weak<dyn EntryObserver<K, V>>,
}

struct EntryState<V> {
    status: QueryStatus,
    data: Option<V>,
    error: Option<QueryError>,
    updated_at: Option<Instant>,
    /// Identity of the most recently issued invocation. A completion only
    /// writes state while its generation is still current.
    generation: u64,
    fetching: bool,
    token: Option<CancellationToken>,
    invocation: Option<SharedInvocation<V>>,
}

/// The cached state machine for one specific argument value.
///
/// Entries are created by the [`QueryCache`](crate::query::QueryCache) and
/// shared by reference; two lookups for equal arguments yield the same
/// instance. All mutable state lives behind a mutex that is never held
/// across an await point or during event dispatch.
pub struct QueryEntry<K, V> {
    arg: K,
    query_fn: QueryFn<K, V>,
    options: Arc<EndpointOptions<K, V>>,
    state: Mutex<EntryState<V>>,
    observers: Mutex<Vec<ObserverSlot<K, V>>>,
    next_observer: AtomicU64,
}

impl<K, V> QueryEntry<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    pub(crate) fn new(arg: K, query_fn: QueryFn<K, V>, options: Arc<EndpointOptions<K, V>>) -> Self {
        Self {
            arg,
            query_fn,
            options,
            state: Mutex::new(EntryState {
                status: QueryStatus::Idle,
                data: None,
                error: None,
                updated_at: None,
                generation: 0,
                fetching: false,
                token: None,
                invocation: None,
            }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
        }
    }

    /// The argument this entry is fixed to.
    pub fn arg(&self) -> &K {
        &self.arg
    }

    /// The current lifecycle status.
    pub fn status(&self) -> QueryStatus {
        self.lock_state().status
    }

    /// The last successfully produced result, if any.
    ///
    /// Retained while a refetch is in flight, so consumers can keep showing
    /// the previous data until the new result lands.
    pub fn data(&self) -> Option<V> {
        self.lock_state().data.clone()
    }

    /// The last failure, if any. Cleared whenever a new invocation starts.
    pub fn error(&self) -> Option<QueryError> {
        self.lock_state().error.clone()
    }

    /// When the last successful completion landed.
    pub fn last_updated_at(&self) -> Option<Instant> {
        self.lock_state().updated_at
    }

    /// Returns `true` while an invocation is outstanding.
    pub fn is_fetching(&self) -> bool {
        self.lock_state().fetching
    }

    /// Returns `true` if this entry has no fresh success.
    ///
    /// Anything other than a success is stale, and a success goes stale once
    /// `stale_time` has elapsed since it was produced (or once the entry was
    /// explicitly invalidated).
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        let state = self.lock_state();
        if state.status != QueryStatus::Success {
            return true;
        }
        match state.updated_at {
            Some(updated_at) => updated_at.elapsed() >= stale_time,
            None => true,
        }
    }

    /// The most recently started invocation, if any.
    pub(crate) fn last_invocation(&self) -> Option<SharedInvocation<V>> {
        self.lock_state().invocation.clone()
    }

    /// Starts a new invocation for this entry's argument.
    ///
    /// Synchronously flips the status to `Loading`, fires a state-changed
    /// notification, and supersedes any outstanding invocation by signalling
    /// its cancellation token. The actual call runs on a spawned driver task;
    /// the returned future resolves with this invocation's outcome.
    pub(crate) fn fetch(
        self: &Arc<Self>,
        retry: Option<Arc<dyn RetryHandler<K, V>>>,
    ) -> SharedInvocation<V> {
        let token = CancellationToken::new();
        let (report, outcome_rx) = oneshot::channel::<QueryResult<V>>();
        let invocation: SharedInvocation<V> = async move {
            match outcome_rx.await {
                Ok(outcome) => outcome,
                // The driver was dropped before reporting (runtime shutdown).
                Err(_) => Err(QueryError::Cancelled),
            }
        }
        .boxed()
        .shared();

        let generation = {
            let mut state = self.lock_state();
            if let Some(previous) = state.token.take() {
                // Supersede the outstanding invocation. Its completion is
                // dropped even if the function ignores the signal.
                previous.cancel();
            }
            state.generation = state.generation.wrapping_add(1);
            state.status = QueryStatus::Loading;
            state.error = None;
            state.fetching = true;
            state.token = Some(token.clone());
            state.invocation = Some(invocation.clone());
            state.generation
        };

        // Observers see Loading before the invocation gets a chance to run.
        self.notify(&QueryEvent::StateChanged);

        tracing::trace!(arg = ?self.arg, generation, "starting query invocation");

        let future = match retry.or_else(|| self.options.retry.clone()) {
            Some(handler) => handler.invoke(self.query_fn.clone(), self.arg.clone(), token.clone()),
            None => (self.query_fn)(self.arg.clone(), token.clone()),
        };

        let entry = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = token.cancelled() => Err(QueryError::Cancelled),
                outcome = future => outcome,
            };
            entry.complete(generation, outcome.clone());
            let _ = report.send(outcome);
        });

        invocation
    }

    /// Applies a completed invocation to the entry state.
    ///
    /// A completion belonging to a superseded generation is dropped entirely:
    /// no state write, no events. Its awaiters still receive their own
    /// outcome through the shared invocation future.
    fn complete(&self, generation: u64, outcome: QueryResult<V>) {
        enum Fired<K, V> {
            Success(QuerySuccess<K, V>),
            Failure(QueryFailure<K>),
            Reset,
        }

        let fired = {
            let mut state = self.lock_state();
            if state.generation != generation {
                tracing::trace!(arg = ?self.arg, generation, "dropping superseded completion");
                return;
            }
            state.fetching = false;
            state.token = None;
            match outcome {
                Ok(data) => {
                    state.status = QueryStatus::Success;
                    state.data = Some(data.clone());
                    state.error = None;
                    state.updated_at = Some(Instant::now());
                    Fired::Success(QuerySuccess {
                        arg: self.arg.clone(),
                        data,
                    })
                }
                Err(QueryError::Cancelled) => {
                    state.status = QueryStatus::Idle;
                    state.data = None;
                    state.error = None;
                    state.updated_at = None;
                    Fired::Reset
                }
                Err(error) => {
                    state.status = QueryStatus::Error;
                    state.error = Some(error.clone());
                    Fired::Failure(QueryFailure {
                        arg: self.arg.clone(),
                        error,
                    })
                }
            }
        };

        match fired {
            Fired::Success(event) => {
                if let Some(callback) = &self.options.on_success {
                    guard_callback(|| callback(&event));
                }
                self.notify(&QueryEvent::Succeeded(event));
                self.notify(&QueryEvent::StateChanged);
            }
            Fired::Failure(event) => {
                if let Some(callback) = &self.options.on_failure {
                    guard_callback(|| callback(&event));
                }
                self.notify(&QueryEvent::Failed(event));
                self.notify(&QueryEvent::StateChanged);
            }
            Fired::Reset => self.notify(&QueryEvent::StateChanged),
        }
    }

    /// Signals the outstanding invocation's cancellation token.
    ///
    /// A no-op if nothing is in flight. The reset to `Idle` happens on the
    /// completion path once the cancellation is observed, not synchronously;
    /// await the invocation to see the final state.
    pub fn cancel(&self) {
        let token = self.lock_state().token.clone();
        if let Some(token) = token {
            tracing::trace!(arg = ?self.arg, "cancelling query invocation");
            token.cancel();
        }
    }

    /// Marks the cached success stale so the next bind refetches, and starts
    /// a refetch right away when observers are attached.
    pub fn invalidate(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            state.updated_at = None;
        }
        if self.observer_count() > 0 && !self.is_fetching() {
            let _ = self.fetch(None);
        }
    }

    /// Installs `data` as a fresh success without running an invocation.
    pub fn set_data(&self, data: V) {
        {
            let mut state = self.lock_state();
            state.status = QueryStatus::Success;
            state.data = Some(data);
            state.error = None;
            state.updated_at = Some(Instant::now());
        }
        self.notify(&QueryEvent::StateChanged);
    }

    /// Registers an observer sink and returns its unsubscribe token.
    pub(crate) fn add_observer(&self, sink: Weak<dyn EntryObserver<K, V>>) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.lock_observers().push(ObserverSlot { id, sink });
        id
    }

    /// Removes a previously registered observer.
    pub(crate) fn remove_observer(&self, id: ObserverId) {
        self.lock_observers().retain(|slot| slot.id != id);
    }

    /// The number of live observers currently bound to this entry.
    pub(crate) fn observer_count(&self) -> usize {
        let mut observers = self.lock_observers();
        observers.retain(|slot| slot.sink.strong_count() > 0);
        observers.len()
    }

    /// Fans an event out to every live observer.
    ///
    /// Sinks are upgraded under the lock but invoked outside it, so a
    /// callback may rebind or detach without deadlocking, and a panicking
    /// sink does not stop the remaining dispatch.
    pub(crate) fn notify(&self, event: &QueryEvent<K, V>) {
        let sinks: Vec<Arc<dyn EntryObserver<K, V>>> = {
            let mut observers = self.lock_observers();
            observers.retain(|slot| slot.sink.strong_count() > 0);
            observers
                .iter()
                .filter_map(|slot| slot.sink.upgrade())
                .collect()
        };
        for sink in sinks {
            guard_callback(|| sink.on_entry_event(event));
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EntryState<V>> {
        self.state.lock().expect("query entry state poisoned")
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<ObserverSlot<K, V>>> {
        self.observers.lock().expect("query entry observers poisoned")
    }
}

impl<K, V> std::fmt::Debug for QueryEntry<K, V>
where
    K: QueryArg,
    V: QueryData,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("QueryEntry")
            .field("arg", &self.arg)
            .field("status", &state.status)
            .field("fetching", &state.fetching)
            .field("generation", &state.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn entry_with<F, Fut>(fetcher: F) -> Arc<QueryEntry<u32, String>>
    where
        F: Fn(u32, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueryResult<String>> + Send + 'static,
    {
        let query_fn: QueryFn<u32, String> = Arc::new(move |arg, token| fetcher(arg, token).boxed());
        Arc::new(QueryEntry::new(
            1,
            query_fn,
            Arc::new(EndpointOptions::default()),
        ))
    }

    fn echo_entry() -> Arc<QueryEntry<u32, String>> {
        entry_with(|arg, _token| async move { Ok(arg.to_string()) })
    }

    struct CountingSink(AtomicUsize);

    impl EntryObserver<u32, String> for CountingSink {
        fn on_entry_event(&self, _event: &QueryEvent<u32, String>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_new_entry_is_idle() {
        let entry = echo_entry();
        assert_eq!(entry.status(), QueryStatus::Idle);
        assert_eq!(entry.data(), None);
        assert!(entry.error().is_none());
        assert!(!entry.is_fetching());
        assert!(entry.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn test_set_data_makes_fresh_success() {
        let entry = echo_entry();
        entry.set_data("patched".to_string());

        assert_eq!(entry.status(), QueryStatus::Success);
        assert_eq!(entry.data(), Some("patched".to_string()));
        assert!(!entry.is_stale(Duration::from_secs(60)));
        assert!(entry.is_stale(Duration::ZERO));
    }

    #[test]
    fn test_invalidate_marks_stale() {
        let entry = echo_entry();
        entry.set_data("value".to_string());
        assert!(!entry.is_stale(Duration::from_secs(60)));

        entry.invalidate();
        assert!(entry.is_stale(Duration::from_secs(60)));
        // Data survives invalidation; only freshness is lost.
        assert_eq!(entry.data(), Some("value".to_string()));
    }

    #[test]
    fn test_observer_registry() {
        let entry = echo_entry();
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));

        let sink_dyn: Arc<dyn EntryObserver<u32, String>> = Arc::clone(&sink) as _;
        let weak: Weak<dyn EntryObserver<u32, String>> = Arc::downgrade(&sink_dyn);
        let id = entry.add_observer(weak);
        assert_eq!(entry.observer_count(), 1);

        entry.notify(&QueryEvent::StateChanged);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        entry.remove_observer(id);
        assert_eq!(entry.observer_count(), 0);

        entry.notify(&QueryEvent::StateChanged);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_observer_is_pruned() {
        let entry = echo_entry();
        let sink: Arc<dyn EntryObserver<u32, String>> =
            Arc::new(CountingSink(AtomicUsize::new(0)));
        let weak: Weak<dyn EntryObserver<u32, String>> = Arc::downgrade(&sink);
        entry.add_observer(weak);

        drop(sink);
        assert_eq!(entry.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_success_updates_state() {
        let entry = echo_entry();
        let invocation = entry.fetch(None);

        assert_eq!(entry.status(), QueryStatus::Loading);
        assert!(entry.is_fetching());

        let result = invocation.await;
        assert_eq!(result.unwrap(), "1");
        assert_eq!(entry.status(), QueryStatus::Success);
        assert_eq!(entry.data(), Some("1".to_string()));
        assert!(!entry.is_fetching());
        assert!(entry.last_updated_at().is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_records_error() {
        let entry = entry_with(|_arg, _token| async move {
            Err(QueryError::failed(std::io::Error::other("boom")))
        });

        let result = entry.fetch(None).await;
        assert!(result.is_err());
        assert_eq!(entry.status(), QueryStatus::Error);
        assert_eq!(entry.error().map(|e| e.to_string()), Some("boom".into()));
    }

    #[tokio::test]
    async fn test_cancel_resets_to_idle() {
        let entry = entry_with(|_arg, _token| async move {
            futures::future::pending::<QueryResult<String>>().await
        });

        let invocation = entry.fetch(None);
        entry.cancel();

        let result = invocation.await;
        assert!(matches!(result, Err(QueryError::Cancelled)));
        assert_eq!(entry.status(), QueryStatus::Idle);
        assert_eq!(entry.data(), None);
        assert!(entry.error().is_none());
        assert!(entry.last_updated_at().is_none());
    }

    #[tokio::test]
    async fn test_cancel_without_invocation_is_noop() {
        let entry = echo_entry();
        entry.cancel();
        assert_eq!(entry.status(), QueryStatus::Idle);
    }

    #[tokio::test]
    async fn test_superseded_completion_is_dropped() {
        let entry = echo_entry();

        // The second invocation supersedes the first before either driver
        // runs; only the most recently issued completion may write state.
        let first = entry.fetch(None);
        let second = entry.fetch(None);

        let second_result = second.await;
        assert_eq!(second_result.unwrap(), "1");
        assert_eq!(entry.status(), QueryStatus::Success);

        // The superseded invocation resolved on its own (usually as a
        // cancellation) and left the state written by its successor untouched.
        match first.await {
            Ok(data) => assert_eq!(data, "1"),
            Err(error) => assert!(error.is_cancelled()),
        }
        assert_eq!(entry.status(), QueryStatus::Success);
        assert_eq!(entry.data(), Some("1".to_string()));
    }
}
