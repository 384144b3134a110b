use std::time::Duration;

/// Failures of the node discovery call. Never fatal to a broadcast.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("node discovery timed out after {0:?}")]
    Timeout(Duration),

    #[error("discovery transport unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a single fire-and-forget message send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("node {0} has no known address")]
    UnknownNode(String),

    #[error("send to node {0} timed out")]
    Timeout(String),

    #[error("failed to send to node {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("message transport is shut down")]
    TransportShutdown,
}

impl SendError {
    /// Whether the error concerns the transport as a whole rather than one node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportShutdown)
    }
}

/// Failures while registering a transfer listener or receiving a file.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to register channel callback: {0}")]
    Registration(String),

    #[error("channel {rejected} rejected: transfer on {active} still in progress")]
    ChannelBusy { active: String, rejected: String },

    #[error("listener is closed")]
    ListenerClosed,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("channel transport is shut down")]
    TransportShutdown,
}

/// Malformed frames on the companion wire.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("{field} too long: {len} bytes (max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("peer sent nothing within {0:?}")]
    Timeout(Duration),
}

/// Everything a command can fail with. Only ever logged; the host sees a
/// generic reply.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}
