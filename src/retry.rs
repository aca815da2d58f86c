//! Retry strategy injection.
//!
//! The crate never retries on its own. When an endpoint or handle configures
//! a [`RetryHandler`], invocations call the handler *instead of* the raw
//! query function, passing the raw function in; the handler decides how many
//! times to run it and with what backoff.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::QueryFn;
use crate::error::QueryResult;

/// A decorator composed around the raw query function.
///
/// Implementations must forward the cancellation token to every attempt and
/// surface [`QueryError::Cancelled`](crate::QueryError::Cancelled) unchanged,
/// so cancelling a query still resets it instead of triggering another
/// attempt.
///
/// Matching closures implement the trait directly:
///
/// ```
/// use futures::FutureExt;
/// use requery::prelude::*;
/// use tokio_util::sync::CancellationToken;
///
/// let retry_once: std::sync::Arc<dyn RetryHandler<u32, String>> =
///     std::sync::Arc::new(|query_fn: QueryFn<u32, String>, arg: u32, token: CancellationToken| {
///         async move {
///             match query_fn(arg.clone(), token.clone()).await {
///                 Err(error) if !error.is_cancelled() => query_fn(arg, token).await,
///                 outcome => outcome,
///             }
///         }
///         .boxed()
///     });
/// ```
pub trait RetryHandler<K, V>: Send + Sync {
    /// Runs the query function, possibly more than once.
    fn invoke(
        &self,
        query_fn: QueryFn<K, V>,
        arg: K,
        token: CancellationToken,
    ) -> BoxFuture<'static, QueryResult<V>>;
}

impl<K, V, F> RetryHandler<K, V> for F
where
    F: Fn(QueryFn<K, V>, K, CancellationToken) -> BoxFuture<'static, QueryResult<V>> + Send + Sync,
{
    fn invoke(
        &self,
        query_fn: QueryFn<K, V>,
        arg: K,
        token: CancellationToken,
    ) -> BoxFuture<'static, QueryResult<V>> {
        self(query_fn, arg, token)
    }
}
