use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::DiscoveryError;
use crate::protocol::Node;
use crate::transport::NodeSource;

pub const SERVICE_TYPE: &str = "_wear-companion._tcp.local.";
pub const DEFAULT_BROWSE_WINDOW: Duration = Duration::from_millis(1500);

/// Last known socket address of each peer, shared between discovery and the
/// transport that has to connect to them.
#[derive(Clone, Default)]
pub struct AddressBook {
    entries: Arc<RwLock<HashMap<String, SocketAddr>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node_id: &str, addr: SocketAddr) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.insert(node_id.to_string(), addr) != Some(addr) {
            debug!("Address of node {} is now {}", node_id, addr);
        }
    }

    pub fn get(&self, node_id: &str) -> Option<SocketAddr> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(node_id).copied()
    }
}

/// A resolved mDNS advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub node: Node,
    pub addr: SocketAddr,
}

impl PeerRecord {
    fn from_service_info(info: &ServiceInfo) -> Option<Self> {
        let ip = info.get_addresses().iter().next().map(|addr| IpAddr::from(*addr))?;

        let mut txt = HashMap::new();
        for prop in info.get_properties().iter() {
            if let Some(val) = prop.val() {
                if let Ok(value) = String::from_utf8(val.to_vec()) {
                    txt.insert(prop.key().to_string(), value);
                }
            }
        }

        Some(Self {
            node: Node::new(txt.get("id")?.clone(), txt.get("name")?.clone()),
            addr: SocketAddr::new(ip, info.get_port()),
        })
    }
}

/// Advertises this device so companions can find it.
pub struct CompanionAdvertiser {
    mdns: ServiceDaemon,
    fullname: String,
}

impl CompanionAdvertiser {
    pub fn start(local: &Node, ip: IpAddr, port: u16) -> Result<Self> {
        let mdns = ServiceDaemon::new().context("Failed to start mDNS daemon")?;
        let host_name = format!("{}.local.", ip);

        let mut properties = HashMap::new();
        properties.insert("id".to_string(), local.id.clone());
        properties.insert("name".to_string(), local.display_name.clone());
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &local.id,
            &host_name,
            ip.to_string().as_str(),
            port,
            properties,
        )
        .context("Failed to build service info")?;
        let fullname = service_info.get_fullname().to_string();

        mdns.register(service_info)
            .context("Failed to register companion service")?;
        info!("Node '{}' advertising on {} port {}", local.display_name, ip, port);

        Ok(Self { mdns, fullname })
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.mdns.unregister(&self.fullname) {
            warn!("Failed to unregister service: {}", e);
        }
        if let Err(e) = self.mdns.shutdown() {
            warn!("Failed to stop mDNS daemon: {}", e);
        }
    }
}

/// Lists companions by browsing mDNS for a short window on every call.
pub struct MdnsNodeSource {
    mdns: ServiceDaemon,
    local_id: String,
    addresses: AddressBook,
    window: Duration,
}

impl MdnsNodeSource {
    pub fn new(local_id: impl Into<String>, addresses: AddressBook, window: Duration) -> Result<Self> {
        let mdns = ServiceDaemon::new().context("Failed to start mDNS daemon")?;
        Ok(Self {
            mdns,
            local_id: local_id.into(),
            addresses,
            window,
        })
    }
}

#[async_trait]
impl NodeSource for MdnsNodeSource {
    async fn connected_nodes(&self) -> Result<Vec<Node>, DiscoveryError> {
        let receiver = self
            .mdns
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::Unavailable(format!("failed to browse mDNS: {}", e)))?;

        let deadline = Instant::now() + self.window;
        let mut found: HashMap<String, Node> = HashMap::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let Some(peer) = PeerRecord::from_service_info(&info) else {
                        debug!("Ignoring incomplete advertisement {}", info.get_fullname());
                        continue;
                    };
                    if peer.node.id == self.local_id {
                        continue;
                    }
                    self.addresses.insert(&peer.node.id, peer.addr);
                    found.insert(peer.node.id.clone(), peer.node);
                }
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if let Err(e) = self.mdns.stop_browse(SERVICE_TYPE) {
            debug!("Failed to stop browsing: {}", e);
        }

        let mut nodes: Vec<Node> = found.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }
}
