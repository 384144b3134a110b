pub mod companion;
pub mod discovery;
pub mod interface;
pub mod wire;

// Re-export key components for easier access
pub use companion::{CompanionTransport, MessageEvent, MessageHandler, ReportHandler};
pub use discovery::{AddressBook, CompanionAdvertiser, MdnsNodeSource, PeerRecord};
pub use interface::{advertised_ip, LinkAddress, LinkKind};
