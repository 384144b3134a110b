use anyhow::{Context, Result};
use companion_bridge::networking::{advertised_ip, AddressBook, CompanionAdvertiser, CompanionTransport};
use companion_bridge::peer::{CompanionPeer, DEFAULT_SAMPLE_INTERVAL};
use companion_bridge::protocol::Node;
use companion_bridge::BridgeConfig;
use dotenv::dotenv;
use log::info;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("=== Wear Companion Peer ===");
    println!("Waits for recording commands and streams sensor data back.");
    println!();

    // Name from args, then env, then hostname
    let config = BridgeConfig::from_env();
    let name = std::env::args().nth(1).unwrap_or(config.node_name);
    let port = std::env::args()
        .nth(2)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(0);

    let local = Node::new(format!("{}_{}", name, Uuid::new_v4()), name);
    let transport = Arc::new(CompanionTransport::new(local.clone(), AddressBook::new(), config.send_timeout));
    let bound = transport
        .start_server(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        .await
        .context("Failed to start companion server")?;

    let ip = advertised_ip()?;
    let advertiser = CompanionAdvertiser::start(&local, ip, bound.port())?;

    let recording_dir = std::env::temp_dir().join("wear-peer");
    let events = CompanionPeer::attach(&transport);
    let peer = CompanionPeer::new(transport.clone(), recording_dir, DEFAULT_SAMPLE_INTERVAL);
    let worker = tokio::spawn(peer.run(events));

    println!("Node {} listening on {}:{} (Ctrl+C to quit)", local.id, ip, bound.port());

    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })?;
    let _ = stop_rx.changed().await;

    info!("Shutting down");
    advertiser.shutdown();
    transport.stop_server().await;
    worker.abort();
    Ok(())
}
