//! Abstraction over the cluster's node metadata
//!
//! The reconciler only needs three things from the cluster: a signal that
//! the initial node snapshot has loaded, a sequential stream of node change
//! events, and a way to write labels back. Keeping that behind a trait lets
//! the tests drive the reconciler without a cluster.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A node's identity and labels as observed at event time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// A single node change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added(NodeSnapshot),
    Updated(NodeSnapshot),
}

impl NodeEvent {
    pub fn into_snapshot(self) -> NodeSnapshot {
        match self {
            NodeEvent::Added(snapshot) | NodeEvent::Updated(snapshot) => snapshot,
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("{0}")]
    Other(String),
}

/// Source of node change events and sink for label updates.
///
/// Implementations deliver at most one event at a time; the reconciler
/// relies on that for per-node serialization.
#[async_trait]
pub trait NodeDirectory {
    /// Blocks until the initial node snapshot has fully loaded or `cancel`
    /// fires. Returns whether the sync completed.
    async fn wait_for_sync(&mut self, cancel: &CancellationToken) -> bool;

    /// Returns the next node add or update notification, or `None` when the
    /// event source has ended.
    async fn next_event(&mut self) -> Option<NodeEvent>;

    /// Writes the given label set onto the node. Best-effort; the caller
    /// does not retry.
    async fn update_labels(
        &mut self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DirectoryError>;
}
