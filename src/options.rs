//! Configuration for endpoints and individual query handles.

use std::sync::Arc;
use std::time::Duration;

use crate::events::{QueryFailure, QuerySuccess};
use crate::retry::RetryHandler;

/// Callback invoked when an invocation succeeds.
pub type SuccessCallback<K, V> = Arc<dyn Fn(&QuerySuccess<K, V>) + Send + Sync>;

/// Callback invoked when an invocation fails.
pub type FailureCallback<K> = Arc<dyn Fn(&QueryFailure<K>) + Send + Sync>;

/// How long a cached query entry is retained once its last observer detaches.
///
/// Retention is a pluggable policy applied by the cache; the entry itself
/// never tears its own state down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never evict entries. Useful for small, bounded argument spaces.
    KeepForever,
    /// Evict an entry after it has been observer-free for the given duration.
    /// An entry that regains an observer before the deadline is kept.
    KeepFor(Duration),
    /// Evict as soon as the last observer detaches.
    EvictImmediately,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepFor(Duration::from_secs(5 * 60))
    }
}

/// Per-handle configuration, overriding the endpoint defaults.
pub struct QueryOptions<K, V> {
    /// How long a success is considered fresh before a re-bind refetches.
    /// Falls back to the endpoint's default when unset.
    pub stale_time: Option<Duration>,
    /// Strategy invoked around the raw query function. Falls back to the
    /// endpoint's handler when unset.
    pub retry: Option<Arc<dyn RetryHandler<K, V>>>,
    /// Invoked whenever an invocation observed by this handle succeeds.
    pub on_success: Option<SuccessCallback<K, V>>,
    /// Invoked whenever an invocation observed by this handle fails.
    /// Not invoked for cancellations.
    pub on_failure: Option<FailureCallback<K>>,
}

impl<K, V> Default for QueryOptions<K, V> {
    fn default() -> Self {
        Self {
            stale_time: None,
            retry: None,
            on_success: None,
            on_failure: None,
        }
    }
}

impl<K, V> Clone for QueryOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            stale_time: self.stale_time,
            retry: self.retry.clone(),
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}

/// Endpoint-wide configuration shared by every query entry in a cache.
pub struct EndpointOptions<K, V> {
    /// Default staleness window for handles that do not override it.
    ///
    /// Zero means a cached success is immediately stale, so every re-bind
    /// refetches while still serving the cached data.
    pub default_stale_time: Duration,
    /// Retention applied when an entry's last observer detaches.
    pub retention: RetentionPolicy,
    /// Default retry strategy for invocations started without a handle-level
    /// override.
    pub retry: Option<Arc<dyn RetryHandler<K, V>>>,
    /// Invoked whenever any invocation on this endpoint succeeds.
    pub on_success: Option<SuccessCallback<K, V>>,
    /// Invoked whenever any invocation on this endpoint fails.
    /// Not invoked for cancellations.
    pub on_failure: Option<FailureCallback<K>>,
}

impl<K, V> Default for EndpointOptions<K, V> {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::ZERO,
            retention: RetentionPolicy::default(),
            retry: None,
            on_success: None,
            on_failure: None,
        }
    }
}

impl<K, V> Clone for EndpointOptions<K, V> {
    fn clone(&self) -> Self {
        Self {
            default_stale_time: self.default_stale_time,
            retention: self.retention,
            retry: self.retry.clone(),
            on_success: self.on_success.clone(),
            on_failure: self.on_failure.clone(),
        }
    }
}
