use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use raft_core::transport::{serve_connection, TcpTransport};
use raft_core::{RaftConfig, Replica};
use tokio::net::TcpListener;

/// A single entry in the replicated log: an opaque, JSON-shaped client
/// payload. The core treats this as transparent (§3), so a plain string is
/// as good a rendering as any other `Serialize + DeserializeOwned` type.
type Payload = String;

#[derive(Parser)]
#[command(version, about = "Runs a single Raft replica.")]
struct Cli {
    /// This replica's own listen address, e.g. 127.0.0.1:9001.
    #[arg(long)]
    id: String,

    /// Addresses of every other replica in the cluster.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Newline-delimited peer list file; used instead of repeated --peer flags.
    #[arg(long)]
    peers_file: Option<std::path::PathBuf>,

    #[arg(long, default_value_t = 1000)]
    request_timeout_ms: u64,

    #[arg(long, default_value_t = 5000)]
    min_voting_ms: u64,

    #[arg(long, default_value_t = 10000)]
    max_voting_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut peers = cli.peers;
    if let Some(path) = &cli.peers_file {
        peers.extend(raft_core::config::load_peers_file(path)?);
    }
    if peers.is_empty() {
        info!("[{}] starting as a single-node cluster (no peers configured)", cli.id);
    }

    let mut config = RaftConfig::new(cli.id.clone(), peers);
    config.request_timeout = Duration::from_millis(cli.request_timeout_ms);
    config.min_voting = Duration::from_millis(cli.min_voting_ms);
    config.max_voting = Duration::from_millis(cli.max_voting_ms);

    let replica = Arc::new(Replica::new(config, TcpTransport::<Payload>::new()));
    replica.run();

    let listener = TcpListener::bind(&cli.id).await?;
    info!("[{}] listening on {}", cli.id, cli.id);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("[{}] accepted connection from {addr}", cli.id);
                let replica = Arc::clone(&replica);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, replica).await {
                        error!("error serving connection from {addr}: {e}");
                    }
                });
            }
            Err(e) => error!("failed to accept connection: {e}"),
        }
    }
}
