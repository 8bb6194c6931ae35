//! Background maintenance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use z_recon_store::Store;

/// How often the ledger pruner runs.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodically delete ledger records older than `retention`.
///
/// Pruned keys are forgotten: a redelivery older than the retention window
/// would be processed again, so retention must exceed the providers' retry
/// horizon.
pub fn spawn_ledger_pruner(store: Arc<dyn Store>, retention: chrono::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let store = Arc::clone(&store);
            let cutoff = Utc::now() - retention;
            match tokio::task::spawn_blocking(move || store.prune_ledger(cutoff)).await {
                Ok(Ok(removed)) => {
                    tracing::info!(removed = %removed, cutoff = %cutoff, "Ledger pruned");
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Ledger prune failed"),
                Err(e) => tracing::error!(error = %e, "Ledger prune task aborted"),
            }
        }
    })
}
