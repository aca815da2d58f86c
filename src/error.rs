use std::sync::Arc;

use thiserror::Error;

/// Error type for query operations.
///
/// Cloneable so a single failure can be cached on the query state and handed
/// out to every caller awaiting the same invocation.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The invocation was cancelled, either through [`cancel`] or because a
    /// newer invocation superseded it before it resolved.
    ///
    /// Cancellations are never reported through failure events.
    ///
    /// [`cancel`]: crate::query::Query::cancel
    #[error("query was cancelled")]
    Cancelled,

    /// A refetch was requested on a handle that has never had an argument set.
    #[error("cannot refetch a query with no argument set")]
    Uninitialized,

    /// The query function itself failed.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl QueryError {
    /// Wraps an arbitrary error returned by a query function.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }

    /// Returns `true` if this error represents a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The outcome of a query invocation.
pub type QueryResult<V> = Result<V, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(QueryError::Cancelled.to_string(), "query was cancelled");
        assert_eq!(
            QueryError::Uninitialized.to_string(),
            "cannot refetch a query with no argument set"
        );

        let err = QueryError::failed(std::io::Error::other("boom"));
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(QueryError::Cancelled.is_cancelled());
        assert!(!QueryError::Uninitialized.is_cancelled());
        assert!(!QueryError::failed(std::io::Error::other("boom")).is_cancelled());
    }

    #[test]
    fn test_clone_preserves_source() {
        let err = QueryError::failed(std::io::Error::other("boom"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
