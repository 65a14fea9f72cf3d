//! Node reconciliation loop
//!
//! Consumes node change events, applies the compiled rule set to each
//! node's labels, and issues a single label update when the result differs
//! from what the node already carries. Failed updates are logged and
//! dropped; the next event for the node retries naturally.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::{NodeDirectory, NodeEvent};
use crate::rules::RuleSet;

/// Errors that abort the reconciliation run entirely.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to sync the node cache")]
    CacheSyncFailed,
}

/// Drives relabeling from node watch events until stopped.
pub struct Reconciler {
    rules: RuleSet,
}

impl Reconciler {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    /// Runs the reconciliation loop.
    ///
    /// Blocks until the directory's initial snapshot has loaded, then
    /// handles events until `stop` fires. `sync_cancel` aborts only the
    /// initial sync wait, so callers can cut that phase short without
    /// affecting a loop already watching.
    pub async fn run<D: NodeDirectory>(
        &self,
        directory: &mut D,
        stop: CancellationToken,
        sync_cancel: CancellationToken,
    ) -> Result<(), FatalError> {
        if !directory.wait_for_sync(&sync_cancel).await {
            return Err(FatalError::CacheSyncFailed);
        }
        info!("Node cache synced; watching for node changes");

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                event = directory.next_event() => match event {
                    Some(event) => self.handle_event(directory, event).await,
                    None => {
                        warn!("Node event stream ended");
                        break;
                    }
                },
            }
        }
        info!("Reconciler stopped");
        Ok(())
    }

    /// Handles one node notification. Adds are updates with no prior state,
    /// so both variants take the same path.
    async fn handle_event<D: NodeDirectory>(&self, directory: &mut D, event: NodeEvent) {
        let snapshot = event.into_snapshot();
        info!(node = %snapshot.name, "Received node update");

        let replacements = self.rules.apply_to(&snapshot.labels);
        let name = snapshot.name;
        let mut labels = snapshot.labels;
        let mut changed = false;
        for (key, value) in replacements {
            match labels.get(&key) {
                Some(current) if *current == value => {}
                current => {
                    if let Some(old_value) = current {
                        debug!(node = %name, key = %key, new_value = %value, old_value = %old_value, "Updating node label");
                    } else {
                        debug!(node = %name, key = %key, new_value = %value, "Updating node label");
                    }
                    changed = true;
                }
            }
            labels.insert(key, value);
        }

        if changed {
            info!(node = %name, "Updating node");
            if let Err(err) = directory.update_labels(&name, &labels).await {
                error!(node = %name, error = %err, "Failed to update node");
            }
        }
    }
}
