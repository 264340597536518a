//! Periodic background ledger flush
//!
//! Spawns a task that mirrors the pool's buffered operations into the ledger
//! on a fixed interval. Failures leave the operations buffered; the next tick
//! retries them in order.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::pool::Pool;

/// Spawn a background task that flushes the pool every `interval`.
///
/// Returns a `JoinHandle` for the spawned task. Abort it on shutdown and call
/// [`Pool::flush`] once more to drain what is left.
pub fn spawn_flush_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, nothing is buffered yet
        ticker.tick().await;

        loop {
            ticker.tick().await;
            flush_cycle(&pool).await;
        }
    })
}

/// Run one flush. Errors are already logged and counted by the pool.
async fn flush_cycle(pool: &Pool) {
    match pool.flush().await {
        Ok(0) => {}
        Ok(persisted) => debug!(persisted, "background ledger flush"),
        Err(e) => debug!(error = %e, "background ledger flush failed, will retry next cycle"),
    }
}
