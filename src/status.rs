/// The lifecycle state of a query.
///
/// A query starts out [`Idle`](Self::Idle) and moves to
/// [`Loading`](Self::Loading) whenever an invocation starts. Once an
/// invocation completes, the query stays [`Success`](Self::Success) or
/// [`Error`](Self::Error) until the next invocation begins; there is no
/// terminal state. Cancelling an in-flight invocation resets the query back
/// to [`Idle`](Self::Idle).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No invocation has run yet, or the last one was cancelled.
    #[default]
    Idle,
    /// An invocation is in flight and no previous result is authoritative.
    Loading,
    /// The most recent invocation succeeded.
    Success,
    /// The most recent invocation failed.
    Error,
}

impl QueryStatus {
    /// Returns `true` if the query is idle.
    #[must_use]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns `true` if the query is loading.
    #[must_use]
    pub const fn is_loading(self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns `true` if the query succeeded.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns `true` if the query failed.
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error)
    }
}
