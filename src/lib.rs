pub mod bridge;
pub mod config;
pub mod error;
pub mod networking;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use bridge::{Command, CommandResult, SensorBridge};
pub use config::BridgeConfig;
pub use error::{BridgeError, DiscoveryError, SendError, TransferError};
