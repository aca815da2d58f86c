//! User lookup demo showing caching, deduplication, and invalidation.
//!
//! Two handles bind to the same argument: the slow "fetch" runs once and
//! both share its result. Invalidating the endpoint refetches in the
//! background while the cached value stays visible.
//!
//! Run with: `cargo run --example user_lookup`

use std::time::Duration;

use requery::prelude::*;

#[tokio::main]
async fn main() {
    let endpoint = Endpoint::with_options(
        |id: u32, _token| async move {
            // Stands in for an HTTP call or database lookup.
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, QueryError>(format!("user-{id}"))
        },
        EndpointOptions {
            default_stale_time: Duration::from_secs(30),
            ..Default::default()
        },
    );

    let list_view = endpoint.query();
    let detail_view = endpoint.query();

    // Both views ask for the same user concurrently; the query function
    // runs once and the in-flight call is shared.
    let (list, detail) = tokio::join!(list_view.set_arg(1), detail_view.set_arg(1));
    println!("list view:   {}", list.unwrap());
    println!("detail view: {}", detail.unwrap());

    // A later bind with the same argument is served from the cache.
    let cached = detail_view.set_arg(1).await.unwrap();
    println!("cached:      {cached} (status: {:?})", detail_view.status());

    // Invalidation refetches in the background; the old data stays
    // available until the new result lands.
    endpoint.invalidate(&1);
    println!(
        "invalidated: fetching={} data={:?}",
        detail_view.is_fetching(),
        detail_view.data()
    );

    let refreshed = detail_view.refetch().await.unwrap();
    println!("refreshed:   {refreshed}");
}
