//! The two retrieval flows run by the binary
//!
//! 1. Start a transient worker, generate a table on it, and snapshot it back
//! 2. Attach to a persistent query and snapshot the tail of one of its tables
//!
//! Both close their session on every exit path.

use crate::config::ClientConfig;
use crate::engine::{LocalTable, QuerySpec, Result, SessionFactory};
use futures::FutureExt;
use tracing::info;

/// `RowIdx` holds the row index and `MyCol` random doubles in `[0, 1000)`
pub fn example_spec(rows: u64) -> QuerySpec {
    QuerySpec::empty(rows).update(["RowIdx=ii", "MyCol = randomDouble(0, 1000)"])
}

/// Generate the example table on a new worker and return a local copy
pub async fn create_and_retrieve_table_from_new_worker(
    factory: &SessionFactory,
    config: &ClientConfig,
) -> Result<LocalTable> {
    let session = factory
        .new_worker(
            &config.worker_name,
            config.heap_mb,
            config.start_timeout(),
            config.operation_timeout(),
        )
        .await?;

    let spec = example_spec(config.example_rows);
    session
        .scoped(|s| {
            async move {
                let handle = s.execute(&spec).await?;
                info!("Created table {} on worker", handle.ticket());
                s.snapshot_of(&handle).await
            }
            .boxed()
        })
        .await
}

/// Snapshot the last `tail_rows` rows of `table_name` in a running query
pub async fn retrieve_table_from_persistent_query(
    factory: &SessionFactory,
    query_name: &str,
    table_name: &str,
    tail_rows: u64,
) -> Result<LocalTable> {
    let session = factory.persistent_query(query_name).await?;
    let spec = QuerySpec::scope(table_name).tail(tail_rows);
    session
        .scoped(|s| async move { s.snapshot_of(spec).await }.boxed())
        .await
}
