pub mod interval;

pub use interval::{IntervalTask, IntervalWorker};

use tokio::task::JoinHandle;

/// Wait for every spawned worker, logging the ones that panicked or were
/// cancelled. Returns how many did not finish cleanly.
pub async fn join_workers(handles: Vec<JoinHandle<()>>) -> usize {
    let mut failed = 0;
    for handle in handles {
        if let Err(e) = handle.await {
            failed += 1;
            if e.is_panic() {
                tracing::error!(error = %e, "Worker task panicked");
            } else {
                tracing::warn!(error = %e, "Worker task cancelled");
            }
        }
    }
    failed
}
