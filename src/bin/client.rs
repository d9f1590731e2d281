use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use raft_core::config::load_peers_file;
use raft_core::transport::TcpTransport;
use raft_core::Client;

type Payload = String;

#[derive(Parser)]
#[command(version, about = "Appends an entry to a Raft cluster.")]
struct Cli {
    /// Newline-delimited file listing every replica's address.
    #[arg(long)]
    servers_file: PathBuf,

    /// The payload to append.
    entry: String,

    #[arg(long, default_value_t = 1000)]
    request_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let servers = load_peers_file(&cli.servers_file)?;

    let mut client = Client::<Payload, _>::new(
        servers,
        Duration::from_millis(cli.request_timeout_ms),
        TcpTransport::new(),
    );
    client.append_entries(cli.entry).await;
    println!("entry committed");
    Ok(())
}
