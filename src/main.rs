use anyhow::{Context, Result};
use companion_bridge::bridge::{Broadcaster, NodeRegistry, SensorBridge, TransferStatus};
use companion_bridge::networking::{AddressBook, CompanionTransport, MdnsNodeSource};
use companion_bridge::protocol::{CompanionReport, Node};
use companion_bridge::BridgeConfig;
use dotenv::dotenv;
use log::{error, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use uuid::Uuid;

fn report_transfer(status: TransferStatus) {
    match status {
        TransferStatus::Started { channel_path, node_id, file } => {
            info!("Receiving {} from {} into {}", channel_path, node_id, file.display());
        }
        TransferStatus::Completed { node_id, recording, .. } => {
            info!(
                "Recording from {} saved to {} ({} bytes, sha256 {})",
                node_id,
                recording.path.display(),
                recording.bytes,
                recording.sha256
            );
        }
        TransferStatus::Failed { node_id, error } => {
            error!("Transfer from {} failed: {}", node_id, error);
        }
        TransferStatus::Rejected { channel_path, node_id } => {
            warn!("Rejected channel {} from {}: a transfer is already running", channel_path, node_id);
        }
    }
}

fn report_companion(node_id: &str, report: CompanionReport) {
    match report {
        CompanionReport::SensorCount(count) => info!("Received sensor number from {}: {}", node_id, count),
        CompanionReport::Prediction(label) => info!("Received prediction from {}: {}", node_id, label),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let config = BridgeConfig::from_env();
    info!("Starting companion bridge '{}'", config.node_name);
    info!("Recordings will be saved to {}", config.receive_dir.display());

    let local = Node::new(format!("{}_{}", config.node_name, Uuid::new_v4()), config.node_name.clone());
    let addresses = AddressBook::new();
    let transport = Arc::new(CompanionTransport::new(local.clone(), addresses.clone(), config.send_timeout));
    transport.set_report_handler(Arc::new(report_companion));
    transport
        .start_server(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port))
        .await
        .context("Failed to start companion server")?;

    let discovery = Arc::new(
        MdnsNodeSource::new(local.id.clone(), addresses, config.browse_window)
            .context("Failed to start companion discovery")?,
    );
    let registry = NodeRegistry::new(discovery, config.discovery_timeout);
    let bridge = SensorBridge::new(
        Broadcaster::new(registry, transport.clone()),
        transport.clone(),
        config.receive_dir.clone(),
    )
    .with_status_callback(Arc::new(report_transfer));

    let (stop_tx, mut stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })?;

    println!("Type startRecording or stopRecording (Ctrl+C to quit)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let action = line.trim();
                if action.is_empty() {
                    continue;
                }
                match bridge.execute(action).await {
                    Some(result) => println!("{}", serde_json::to_string(&result)?),
                    None => println!("{} is not handled", action),
                }
            }
            _ = stop_rx.changed() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    transport.stop_server().await;
    info!("Companion bridge stopped");
    Ok(())
}
