//! Startup crash recovery.

use tracing::{info, warn};

use crate::error::TaskError;
use crate::store::TaskStore;

/// Fail every task a previous process left `queued` or `running`.
///
/// Must run before the worker starts and before submissions are accepted:
/// the in-memory queue does not survive a restart, so those tasks would
/// otherwise never reach a terminal state.
pub async fn reconcile_on_startup(store: &dyn TaskStore) -> Result<u64, TaskError> {
    let reconciled = store.reconcile_on_startup().await?;
    if reconciled > 0 {
        warn!(reconciled, "Failed tasks interrupted by the previous shutdown");
    } else {
        info!("No interrupted tasks to reconcile");
    }
    Ok(reconciled)
}
