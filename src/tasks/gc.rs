//! Garbage Collection Task
//!
//! Background task that periodically evicts unobserved cache entries whose
//! GC time has elapsed.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::QueryClient;

/// Spawns a background task that runs garbage collection on `client` every
/// `gc_interval_secs` seconds.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let gc_handle = spawn_gc_task(client.clone(), 1);
/// // Later, during shutdown:
/// gc_handle.abort();
/// ```
pub fn spawn_gc_task(client: QueryClient, gc_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(gc_interval_secs.max(1));

    tokio::spawn(async move {
        info!("Starting GC task with interval of {} seconds", interval.as_secs());

        loop {
            tokio::time::sleep(interval).await;

            let evicted = client.run_garbage_collection();
            if evicted > 0 {
                info!("GC: evicted {} unused entries", evicted);
            } else {
                debug!("GC: nothing to evict");
            }
        }
    })
}
