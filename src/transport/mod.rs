//! Seams to the device-to-device transport.
//!
//! The core only ever talks to these traits; `networking::CompanionTransport`
//! is the LAN implementation and tests use in-memory doubles.

mod callbacks;
#[cfg(test)]
pub(crate) mod mock;

pub use callbacks::CallbackRegistry;

use async_trait::async_trait;
use std::fs::File;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{DiscoveryError, SendError, TransferError};
use crate::protocol::{Channel, CloseReason, Node};

/// Identifies one registered channel callback.
pub type ListenerId = Uuid;

/// Point-in-time lookup of connected peers.
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn connected_nodes(&self) -> Result<Vec<Node>, DiscoveryError>;
}

/// Fire-and-forget messaging keyed by node id and path.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, node_id: &str, path: &str, payload: &[u8]) -> Result<(), SendError>;
}

/// Channel lifecycle notifications, delivered on the transport's own tasks.
pub trait ChannelCallback: Send + Sync {
    fn on_channel_opened(&self, channel: &Channel) -> Result<(), TransferError>;

    fn on_input_closed(
        &self,
        channel: &Channel,
        reason: CloseReason,
        app_error: i32,
    ) -> Result<(), TransferError>;
}

/// Channel-based file transfer.
pub trait ChannelTransport: Send + Sync {
    fn register_channel_callback(
        &self,
        id: ListenerId,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<(), TransferError>;

    /// Returns whether a callback was registered under `id`.
    fn unregister_channel_callback(&self, id: &ListenerId) -> bool;

    /// Starts copying the channel's input into `sink`. Returns once the copy
    /// is scheduled; completion is signalled through `on_input_closed`.
    fn receive_file(&self, channel: &Channel, sink: File) -> Result<(), TransferError>;

    fn close(&self, channel: &Channel) -> Result<(), TransferError>;
}
