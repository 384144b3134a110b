use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DiscoveryError;
use crate::protocol::Node;
use crate::transport::NodeSource;

/// Default bounded wait for the discovery call
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Looks up the peers reachable right now. Nothing is cached between calls.
#[derive(Clone)]
pub struct NodeRegistry {
    source: Arc<dyn NodeSource>,
    timeout: Duration,
}

impl NodeRegistry {
    pub fn new(source: Arc<dyn NodeSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Queries the transport, waiting at most the configured timeout.
    pub async fn list_reachable_nodes(&self) -> Result<Vec<Node>, DiscoveryError> {
        info!("Looking for connected nodes...");
        let nodes = tokio::time::timeout(self.timeout, self.source.connected_nodes())
            .await
            .map_err(|_| DiscoveryError::Timeout(self.timeout))??;
        info!("Found {} connected device(s).", nodes.len());
        Ok(nodes)
    }

    /// Like [`list_reachable_nodes`](Self::list_reachable_nodes), but a failed
    /// lookup degrades to an empty snapshot.
    pub async fn snapshot(&self) -> Vec<Node> {
        match self.list_reachable_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("Node discovery failed, treating as no reachable nodes: {}", e);
                Vec::new()
            }
        }
    }
}
