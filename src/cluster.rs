//! Kubernetes-backed node directory
//!
//! Watches the cluster's nodes through a reflector and exposes them as the
//! sequential event stream the reconciler consumes. Label writes go out as
//! JSON merge patches against the node's metadata.

use std::collections::BTreeMap;

use futures::{pin_mut, Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        reflector,
        reflector::Store,
        watcher::{self, Event},
    },
    Client,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::directory::{DirectoryError, NodeDirectory, NodeEvent, NodeSnapshot};

/// Node directory backed by a cluster-scoped node watch.
pub struct KubeNodeDirectory {
    nodes: Api<Node>,
    store: Store<Node>,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    driver: JoinHandle<()>,
}

impl KubeNodeDirectory {
    /// Starts watching nodes on the given cluster. The watch runs on a
    /// background task until the directory is dropped.
    pub fn new(client: Client) -> Self {
        let nodes: Api<Node> = Api::all(client);
        let (store, writer) = reflector::store();
        let (tx, rx) = mpsc::unbounded_channel();

        let watch = reflector(
            writer,
            watcher::watcher(nodes.clone(), watcher::Config::default().any_semantic()),
        );
        let driver = tokio::spawn(drive_watch(watch, tx));

        Self {
            nodes,
            store,
            events: rx,
            driver,
        }
    }
}

/// Forwards watch events into the channel; polling the stream is also what
/// applies events to the reflector store. The channel is unbounded: nothing
/// drains it until the initial sync completes, so a bounded send here would
/// stall the stream before the store ever becomes ready.
async fn drive_watch<S>(watch: S, tx: mpsc::UnboundedSender<NodeEvent>)
where
    S: Stream<Item = Result<Event<Node>, watcher::Error>>,
{
    pin_mut!(watch);
    while let Some(event) = watch.next().await {
        let forwarded = match event {
            Ok(Event::InitApply(node)) => snapshot_of(&node).map(NodeEvent::Added),
            Ok(Event::Apply(node)) => snapshot_of(&node).map(NodeEvent::Updated),
            Ok(Event::Init | Event::InitDone | Event::Delete(_)) => None,
            Err(err) => {
                warn!(error = %err, "Node watch error");
                None
            }
        };
        if let Some(event) = forwarded {
            if tx.send(event).is_err() {
                break;
            }
        }
    }
}

impl Drop for KubeNodeDirectory {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait::async_trait]
impl NodeDirectory for KubeNodeDirectory {
    async fn wait_for_sync(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            // A dropped writer means the watch task died before the initial
            // list completed; that counts as a failed sync.
            ready = self.store.wait_until_ready() => ready.is_ok(),
            () = cancel.cancelled() => false,
        }
    }

    async fn next_event(&mut self) -> Option<NodeEvent> {
        self.events.recv().await
    }

    async fn update_labels(
        &mut self,
        node: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), DirectoryError> {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.nodes
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn snapshot_of(node: &Node) -> Option<NodeSnapshot> {
    let Some(name) = node.metadata.name.clone() else {
        warn!("Received node object without a name; skipping");
        return None;
    };
    Some(NodeSnapshot {
        name,
        labels: node.metadata.labels.clone().unwrap_or_default(),
    })
}
