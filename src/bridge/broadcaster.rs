use log::{info, warn};
use std::sync::Arc;

use super::registry::NodeRegistry;
use crate::error::SendError;
use crate::protocol::ControlMessage;
use crate::transport::MessageSender;

/// Number of nodes a message was handed to. Delivery is not acknowledged.
pub type CompletionCount = usize;

/// Sends a control message to every node in the registry's current snapshot.
#[derive(Clone)]
pub struct Broadcaster {
    registry: NodeRegistry,
    sender: Arc<dyn MessageSender>,
}

impl Broadcaster {
    pub fn new(registry: NodeRegistry, sender: Arc<dyn MessageSender>) -> Self {
        Self { registry, sender }
    }

    /// Submits one send per reachable node. A node that cannot be reached is
    /// skipped; only a transport-wide failure aborts the broadcast.
    pub async fn broadcast(&self, message: ControlMessage) -> Result<CompletionCount, SendError> {
        let nodes = self.registry.snapshot().await;
        let mut submitted = 0;

        for node in &nodes {
            info!("Sending message: [{}] to node: {}", message.path(), node.id);
            match self.sender.send_message(&node.id, message.path(), &[]).await {
                Ok(()) => submitted += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Skipping node {} ({}): {}", node.id, node.display_name, e),
            }
        }

        info!(
            "Message [{}] submitted to {} of {} node(s)",
            message.path(),
            submitted,
            nodes.len()
        );
        Ok(submitted)
    }
}
