use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshdht::{Keypair, MemoryStorage, Node, NodeConfig, TcpConnector, Transport};

#[derive(Parser, Debug)]
#[command(name = "meshdht")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address. Relayed offers need a concrete IP here, not a wildcard.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Address of a node to join through (IP:PORT). Repeatable.
    #[arg(short, long = "seed", value_name = "ADDR")]
    seed: Vec<SocketAddr>,

    /// Bucket capacity and lookup fan-out.
    #[arg(short, long, default_value_t = meshdht::NodeConfig::default().k)]
    k: usize,

    /// Announce no listen address; reachable only through signaling.
    #[arg(long)]
    unreachable: bool,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,

    /// Ed25519 secret key (64 hex chars) for a stable identity across restarts.
    #[arg(long, value_name = "HEX", value_parser = parse_secret_key)]
    secret_key: Option<Keypair>,
}

fn parse_secret_key(s: &str) -> Result<Keypair, String> {
    Keypair::from_secret_hex(s).map_err(|e| format!("invalid secret key: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let local_addr = listener.local_addr()?;

    let mut config = NodeConfig {
        k: args.k,
        ..NodeConfig::default()
    };
    if !args.unreachable {
        config.listen_addrs = vec![local_addr.to_string()];
    }
    let max_frame = config.max_message_size;

    let keypair = args.secret_key.clone().unwrap_or_else(Keypair::generate);
    let storage = Arc::new(MemoryStorage::new());
    let connector = Arc::new(TcpConnector::new(local_addr.ip(), max_frame));
    let node = Arc::new(Node::spawn(keypair, config, storage.clone(), connector));
    info!(identity = %node.identity(), addr = %local_addr, "node identity");

    let seeds: Vec<String> = args.seed.iter().map(|s| s.to_string()).collect();
    node.startup(&seeds).await.context("startup failed")?;

    let acceptor = {
        let node = node.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                stream.set_nodelay(true).ok();
                debug!(peer = %peer, "inbound connection");
                let transport = Transport::from_tcp(stream, max_frame).with_remote_addr(peer.to_string());
                if let Err(e) = node.accept(transport).await {
                    warn!(error = %e, "failed to accept inbound connection");
                    break;
                }
            }
        })
    };

    let mut inbox = node.messages().await?;
    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(record) = inbox.recv() => {
                info!(
                    from = %record.author(),
                    bytes = record.value().len(),
                    "message received"
                );
            }
            _ = interval.tick() => {
                let contacts = node.routing_contacts().await;
                info!(
                    routing_contacts = contacts.len(),
                    stored_records = storage.record_count().await,
                    "status"
                );
            }
        }
    }

    acceptor.abort();
    node.shutdown().await;
    Ok(())
}
