//! Event payloads and listener plumbing.
//!
//! Query state changes are fanned out synchronously through small callback
//! registries rather than channels, so observers see `Loading` before the
//! invocation ever suspends. Listeners are detached through RAII guards,
//! which guarantees no dangling callback survives a dropped subscription.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::QueryError;

/// Payload of a completed successful invocation.
#[derive(Debug, Clone)]
pub struct QuerySuccess<K, V> {
    /// The argument the invocation ran with.
    pub arg: K,
    /// The result it produced.
    pub data: V,
}

/// Payload of a completed failed invocation.
#[derive(Debug, Clone)]
pub struct QueryFailure<K> {
    /// The argument the invocation ran with.
    pub arg: K,
    /// The error it produced.
    pub error: QueryError,
}

/// Internal event fanned out by a query entry to its observers.
#[derive(Debug, Clone)]
pub(crate) enum QueryEvent<K, V> {
    StateChanged,
    Succeeded(QuerySuccess<K, V>),
    Failed(QueryFailure<K>),
}

/// Runs a listener or user callback, isolating panics.
///
/// Query state is committed before callbacks run, so a panicking callback
/// must not stop the remaining dispatch.
pub(crate) fn guard_callback(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("query event callback panicked");
    }
}

type ListenerCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An id-keyed registry of event callbacks.
pub(crate) struct Listeners<T> {
    entries: Arc<Mutex<Vec<(u64, ListenerCallback<T>)>>>,
    next_id: AtomicU64,
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a callback and returns the guard that removes it.
    pub(crate) fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> ListenerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("listener registry poisoned")
            .push((id, Arc::new(callback)));

        let entries = Arc::downgrade(&self.entries);
        ListenerGuard {
            detach: Some(Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    entries
                        .lock()
                        .expect("listener registry poisoned")
                        .retain(|(listener, _)| *listener != id);
                }
            })),
        }
    }

    /// Invokes every registered callback with `value`.
    ///
    /// Callbacks run outside the registry lock, so a callback may subscribe
    /// or unsubscribe listeners without deadlocking.
    pub(crate) fn emit(&self, value: &T) {
        let callbacks: Vec<ListenerCallback<T>> = self
            .entries
            .lock()
            .expect("listener registry poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            guard_callback(|| callback(value));
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("listener registry poisoned").len()
    }
}

/// Removes the associated listener when dropped.
///
/// Returned by the `on_*` subscription methods; hold on to it for as long as
/// the listener should stay registered, or [`forget`](Self::forget) it to
/// keep the listener for the lifetime of its registry.
#[must_use = "dropping the guard immediately unsubscribes the listener"]
pub struct ListenerGuard {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    /// Keeps the listener registered for the lifetime of its registry.
    pub fn forget(mut self) {
        self.detach = None;
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("active", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let _guard = listeners.subscribe(move |value: &u32| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        });

        listeners.emit(&2);
        listeners.emit(&3);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_guard_drop_unsubscribes() {
        let listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let guard = listeners.subscribe(move |_: &()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 1);

        drop(guard);
        assert_eq!(listeners.len(), 0);

        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_forget_keeps_listener() {
        let listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        listeners
            .subscribe(move |_: &()| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .forget();

        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_dispatch() {
        let listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _noisy = listeners.subscribe(|_: &()| panic!("listener panic"));
        let counter = Arc::clone(&count);
        let _quiet = listeners.subscribe(move |_: &()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_outliving_registry_is_harmless() {
        let listeners = Listeners::new();
        let guard = listeners.subscribe(|_: &()| {});
        drop(listeners);
        drop(guard);
    }
}
