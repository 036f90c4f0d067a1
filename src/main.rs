//! PeerMesh node
//!
//! Runs a headless peer-network node until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Run a node with LAN discovery
//! peermesh
//!
//! # Run a second instance with its own identity, database and port,
//! # pointing it at the first one
//! peermesh --name bob --port 7451 --no-mdns --peer alice=abc123@127.0.0.1:7450
//!
//! # Show the local identity
//! peermesh identity
//!
//! # List peers remembered from earlier runs
//! peermesh peers
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peermesh_core::{
    LocalIdentity, MeshConfig, NetworkEvent, PeerDescriptor, PeerNetwork, PeerRoute, Storage,
    TcpTransport,
};
use tracing::{info, warn};

const IDENTITY_FILE: &str = "identity.json";
const DATABASE_FILE: &str = "peermesh.redb";

/// PeerMesh - headless peer-network node
#[derive(Parser)]
#[command(name = "peermesh")]
#[command(version = "0.1.0")]
#[command(about = "PeerMesh - discovery, supervised connections and offline sync")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: <data dir>/peermesh)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Instance name (creates data dir: peermesh-<name>)
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Disable mDNS discovery
    #[arg(long)]
    no_mdns: bool,

    /// Signaling port to listen on (also advertised over mDNS)
    #[arg(long, default_value_t = 7450)]
    port: u16,

    /// Seed peer as name=publicKey[@host:port] (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerDescriptor>,

    /// Without a subcommand the node runs until Ctrl+C
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the local identity
    Identity,

    /// List peers stored in the database
    Peers,
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn default_data_dir(name: Option<&str>) -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    match name {
        Some(name) => base.join(format!("peermesh-{name}")),
        None => base.join("peermesh"),
    }
}

/// Parse a seed peer from `name=publicKey[@host:port]`
fn parse_peer(s: &str) -> Result<PeerDescriptor> {
    let (name, rest) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected name=publicKey[@host:port], got '{}'", s))?;
    let (key, address) = match rest.rsplit_once('@') {
        Some((key, address)) => (key, Some(address)),
        None => (rest, None),
    };
    if name.is_empty() || key.is_empty() {
        anyhow::bail!("Peer name and public key must not be empty");
    }

    let descriptor = PeerDescriptor::new(name, key);
    let Some(address) = address else {
        return Ok(descriptor);
    };
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Expected host:port, got '{}'", address))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in '{}'", address))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || port == 0 {
        anyhow::bail!("Invalid peer address '{}'", address);
    }
    Ok(descriptor.with_metadata(PeerRoute::new(host, port).to_metadata()))
}

/// The identity must survive restarts or every run would look like a new peer
fn load_or_create_identity(data_dir: &Path, name: Option<&str>) -> Result<LocalIdentity> {
    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let data = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return serde_json::from_slice(&data).context("Invalid identity file");
    }

    let mut identity = LocalIdentity::default();
    if let Some(name) = name {
        identity.name = name.to_string();
    }
    std::fs::write(&path, serde_json::to_vec_pretty(&identity)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), "Created new identity");
    Ok(identity)
}

fn load_config(cli: &Cli, data_dir: &Path) -> Result<MeshConfig> {
    let mut config = match &cli.config {
        Some(path) => MeshConfig::load(path)?,
        None => MeshConfig::default(),
    };
    // An identity in the config file wins over the stored one
    let has_identity = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read(path).ok())
        .and_then(|data| serde_json::from_slice::<serde_json::Value>(&data).ok())
        .is_some_and(|value| value.get("identity").is_some());
    if !has_identity {
        config.identity = load_or_create_identity(data_dir, cli.name.as_deref())?;
    }
    Ok(config)
}

async fn run(
    config: MeshConfig,
    data_dir: &Path,
    no_mdns: bool,
    port: u16,
    seeds: Vec<PeerDescriptor>,
) -> Result<()> {
    let store = Arc::new(Storage::new(data_dir.join(DATABASE_FILE))?);
    let (transport, mut inbound) = TcpTransport::bind(
        config.identity.peer_id(),
        ("0.0.0.0", port),
        config.max_message_size,
    )
    .await
    .with_context(|| format!("Failed to listen on port {}", port))?;

    let mut builder = PeerNetwork::builder(config.clone())
        .store(store)
        .transport(transport.clone());
    if !no_mdns {
        let mdns = peermesh_core::MdnsDiscovery::new(
            config.service_type.clone(),
            config.discovery_window(),
            port,
        )?;
        builder = builder.discovery(Arc::new(mdns));
    }
    let network = builder.build()?;

    println!("Peer ID: {}", network.local_peer_id());
    println!("Name:    {}", config.identity.name);
    println!("Listen:  {}", transport.local_addr());

    for seed in seeds {
        match network.add_peer(seed) {
            Ok(peer_id) => info!(peer_id = %peer_id.short(), "Added seed peer"),
            Err(e) => warn!(error = %e, "Failed to add seed peer"),
        }
    }

    let mut events = network.subscribe();
    network.start().await;
    println!("Running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            Some(msg) = inbound.recv() => {
                if let Err(e) = network.handle_inbound(&msg.from, &msg.payload).await {
                    warn!(from = %msg.from.short(), error = %e, "Dropped inbound message");
                }
            }
            event = events.recv() => match event {
                Ok(NetworkEvent::PeerAdded { peer_id, name }) => {
                    println!("+ {} ({})", name, peer_id.short());
                }
                Ok(NetworkEvent::PeerRemoved { peer_id }) => {
                    println!("- {}", peer_id.short());
                }
                Ok(NetworkEvent::ConnectionChanged { peer_id, status }) => {
                    println!("  {} is {}", peer_id.short(), status);
                }
                Ok(NetworkEvent::RetriesExhausted { peer_id, retries }) => {
                    println!("! {} unreachable after {} retries", peer_id.short(), retries);
                }
                Ok(NetworkEvent::SyncCompleted { synced, failed }) => {
                    info!(synced, failed, "Sync pass finished");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event listener lagged");
                }
                Err(_) => break,
            },
        }
    }

    network.shutdown().await?;
    transport.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_with_address() {
        let descriptor = parse_peer("alice=abc123@127.0.0.1:7450").unwrap();
        assert_eq!(descriptor.name, "alice");
        assert_eq!(descriptor.public_key, "abc123");
        assert_eq!(
            PeerRoute::from_metadata(&descriptor.metadata),
            Some(PeerRoute::new("127.0.0.1", 7450))
        );
    }

    #[test]
    fn test_parse_peer_without_address() {
        let descriptor = parse_peer("bob=key").unwrap();
        assert_eq!(descriptor.public_key, "key");
        assert!(PeerRoute::from_metadata(&descriptor.metadata).is_none());
    }

    #[test]
    fn test_parse_peer_rejects_bad_input() {
        assert!(parse_peer("no-separator").is_err());
        assert!(parse_peer("=key").is_err());
        assert!(parse_peer("alice=key@host").is_err());
        assert!(parse_peer("alice=key@host:0").is_err());
        assert!(parse_peer("alice=key@[::1]:notaport").is_err());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| default_data_dir(cli.name.as_deref()));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let config = load_config(&cli, &data_dir)?;

    match cli.command {
        None => run(config, &data_dir, cli.no_mdns, cli.port, cli.peers).await?,
        Some(Commands::Identity) => {
            println!("Name:       {}", config.identity.name);
            println!("Public key: {}", config.identity.public_key);
            println!("Peer ID:    {}", config.identity.peer_id());
        }
        Some(Commands::Peers) => {
            let store = Arc::new(Storage::new(data_dir.join(DATABASE_FILE))?);
            let records = peermesh_core::storage::Records::new(store);
            let peers = records.list_peers()?;
            if peers.is_empty() {
                println!("No peers stored.");
            }
            for peer in peers {
                println!("{}  {:<20} {}", peer.id.short(), peer.name, peer.status);
            }
        }
    }

    Ok(())
}
