//! Prelude module for convenient imports.
//!
//! ```
//! use requery::prelude::*;
//! ```

pub use crate::endpoint::Endpoint;
pub use crate::error::{QueryError, QueryResult};
pub use crate::events::{ListenerGuard, QueryFailure, QuerySuccess};
pub use crate::options::{EndpointOptions, QueryOptions, RetentionPolicy};
pub use crate::query::{Query, QueryCache, QueryEntry};
pub use crate::retry::RetryHandler;
pub use crate::status::QueryStatus;
pub use crate::{QueryArg, QueryData, QueryFn};
