//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use requery::prelude::*;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Resolves one parked invocation of a controlled endpoint.
pub type Responder = oneshot::Sender<QueryResult<String>>;

/// An endpoint whose invocations park until the test resolves them.
///
/// Each invocation pushes `(arg, responder)` into the returned channel, so
/// the test decides the completion order. The query function ignores its
/// cancellation token. The counter tracks invocation issuance.
pub fn controlled_endpoint() -> (
    Endpoint<u32, String>,
    mpsc::UnboundedReceiver<(u32, Responder)>,
    Arc<AtomicUsize>,
) {
    controlled_endpoint_with(EndpointOptions::default())
}

/// Same as [`controlled_endpoint`], with endpoint options.
pub fn controlled_endpoint_with(
    options: EndpointOptions<u32, String>,
) -> (
    Endpoint<u32, String>,
    mpsc::UnboundedReceiver<(u32, Responder)>,
    Arc<AtomicUsize>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let endpoint = Endpoint::with_options(
        move |arg: u32, _token: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            let requests = tx.clone();
            async move {
                let (reply, outcome) = oneshot::channel();
                if requests.send((arg, reply)).is_err() {
                    return Err(QueryError::Cancelled);
                }
                outcome.await.unwrap_or(Err(QueryError::Cancelled))
            }
        },
        options,
    );
    (endpoint, rx, calls)
}

/// An endpoint that resolves immediately with `arg.to_string()`.
pub fn echo_endpoint() -> (Endpoint<u32, String>, Arc<AtomicUsize>) {
    echo_endpoint_with(EndpointOptions::default())
}

/// Same as [`echo_endpoint`], with endpoint options.
pub fn echo_endpoint_with(
    options: EndpointOptions<u32, String>,
) -> (Endpoint<u32, String>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let endpoint = Endpoint::with_options(
        move |arg: u32, _token: CancellationToken| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(arg.to_string()) }
        },
        options,
    );
    (endpoint, calls)
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within two seconds");
}
