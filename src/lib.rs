//! # Requery - Asynchronous Query Caching
//!
//! Requery is an asynchronous state management library for data fetching,
//! built on top of [tokio](https://tokio.rs/). It provides caching,
//! request deduplication, staleness tracking, and observable query state,
//! similar to SWR or TanStack Query, without binding to any particular UI
//! framework.
//!
//! ## Architecture
//!
//! The crate is built from three layers plus an entry point:
//!
//! 1. **[`Endpoint`](endpoint::Endpoint)**: wraps an async query function
//!    and owns the shared cache for its results
//! 2. **[`QueryCache`](query::QueryCache)**: an argument-keyed registry of
//!    query entries; equal arguments always resolve to the same entry
//! 3. **[`QueryEntry`](query::QueryEntry)**: the state machine for one
//!    argument value, owning the in-flight invocation and its result
//! 4. **[`Query`](query::Query)**: the handle callers hold; it binds to the
//!    entry for its current argument and re-binds when the argument changes
//!
//! Several handles with the same argument share one entry, and therefore one
//! in-flight invocation: concurrent requests are deduplicated instead of
//! repeated. A cached success is served immediately and refetched once it is
//! older than the configured stale time.
//!
//! ## Example
//!
//! ```
//! use requery::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let endpoint = Endpoint::new(|id: u32, _token| async move {
//!     // Usually an HTTP call or database lookup.
//!     Ok::<_, QueryError>(format!("user-{id}"))
//! });
//!
//! let query = endpoint.query();
//!
//! // First call runs the query function...
//! let user = query.set_arg(1).await.unwrap();
//! assert_eq!(user, "user-1");
//!
//! // ...subsequent binds with an equal argument are served from the cache.
//! let cached = query.set_arg(1).await.unwrap();
//! assert_eq!(cached, "user-1");
//! assert!(query.is_success());
//! # }
//! ```
//!
//! ## Cancellation
//!
//! Every invocation receives a [`CancellationToken`]; cancelling a query
//! signals the token and resets the state to `Idle` once the cancellation is
//! observed. A query function that ignores the token keeps running, but its
//! outcome no longer reaches the shared state.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub mod endpoint;
pub mod error;
pub mod events;
pub mod options;
pub mod prelude;
pub mod query;
pub mod retry;
pub mod status;

pub use crate::error::{QueryError, QueryResult};

/// Requirements for a query argument: the cache key.
///
/// Blanket-implemented for every type that satisfies the bounds.
pub trait QueryArg: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static {}

impl<T> QueryArg for T where T: Clone + Eq + std::hash::Hash + std::fmt::Debug + Send + Sync + 'static
{}

/// Requirements for query result data.
///
/// Blanket-implemented for every type that satisfies the bounds.
pub trait QueryData: Clone + Send + Sync + 'static {}

impl<T> QueryData for T where T: Clone + Send + Sync + 'static {}

/// The injected asynchronous operation shared by all entries of a cache.
pub type QueryFn<K, V> =
    Arc<dyn Fn(K, CancellationToken) -> BoxFuture<'static, QueryResult<V>> + Send + Sync>;
