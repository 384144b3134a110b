use anyhow::{anyhow, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, info, warn};
use std::net::IpAddr;

/// Kind of link a companion may be reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Wifi,
    Ethernet,
    Loopback,
    Other,
}

impl LinkKind {
    /// Higher is preferred. Wearables pair over Wi-Fi.
    fn priority(self) -> u8 {
        match self {
            LinkKind::Wifi => 100,
            LinkKind::Ethernet => 80,
            LinkKind::Other => 20,
            LinkKind::Loopback => 1,
        }
    }

    fn detect(name: &str, ip: &IpAddr) -> Self {
        if ip.is_loopback() || name == "lo" || name.starts_with("lo0") {
            LinkKind::Loopback
        } else if name.starts_with("wl") || name.contains("wifi") || name.contains("wlan") {
            LinkKind::Wifi
        } else if name.starts_with("eth") || name.starts_with("en") {
            LinkKind::Ethernet
        } else {
            LinkKind::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddress {
    pub name: String,
    pub ip: IpAddr,
    pub kind: LinkKind,
}

impl LinkAddress {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        let name = name.into();
        let kind = LinkKind::detect(&name, &ip);
        Self { name, ip, kind }
    }
}

/// Orders IPv4 candidates best first, dropping unusable addresses.
pub fn rank_links(mut links: Vec<LinkAddress>) -> Vec<LinkAddress> {
    links.retain(|link| link.ip.is_ipv4() && !link.ip.is_unspecified() && !link.ip.is_multicast());
    links.sort_by(|a, b| b.kind.priority().cmp(&a.kind.priority()));
    links
}

/// Lists the IPv4 addresses of this machine, best first.
pub fn discover_links() -> Result<Vec<LinkAddress>> {
    let addrs = get_if_addrs().map_err(|e| anyhow!("Failed to get network interfaces: {}", e))?;
    let links = rank_links(
        addrs
            .into_iter()
            .map(|interface| {
                let ip = match interface.addr {
                    IfAddr::V4(addr) => IpAddr::V4(addr.ip),
                    IfAddr::V6(addr) => IpAddr::V6(addr.ip),
                };
                LinkAddress::new(interface.name, ip)
            })
            .collect(),
    );

    for link in &links {
        debug!("Interface {} ({:?}): {}", link.name, link.kind, link.ip);
    }
    if links.is_empty() {
        warn!("No usable network interfaces found!");
    }
    Ok(links)
}

/// Address to advertise to companions.
pub fn advertised_ip() -> Result<IpAddr> {
    let best = discover_links()?
        .into_iter()
        .find(|link| link.kind != LinkKind::Loopback);

    match best {
        Some(link) => {
            info!("Advertising on {} ({:?}) - {}", link.name, link.kind, link.ip);
            Ok(link.ip)
        }
        None => local_ip().map_err(|e| anyhow!("Failed to determine local IP: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_wifi_and_drops_ipv6() {
        let links = rank_links(vec![
            LinkAddress::new("lo", "127.0.0.1".parse().unwrap()),
            LinkAddress::new("eth0", "10.0.0.4".parse().unwrap()),
            LinkAddress::new("wlan0", "192.168.1.20".parse().unwrap()),
            LinkAddress::new("wlan0", "fe80::1".parse().unwrap()),
        ]);

        let names: Vec<(&str, LinkKind)> = links.iter().map(|l| (l.name.as_str(), l.kind)).collect();
        assert_eq!(
            names,
            vec![
                ("wlan0", LinkKind::Wifi),
                ("eth0", LinkKind::Ethernet),
                ("lo", LinkKind::Loopback)
            ]
        );
    }
}
