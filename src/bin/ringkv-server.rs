//! Storage node process.
//!
//! Started by the coordinator's launcher as
//! `ringkv-server <port> <cache-size> <cache-strategy> <coord-host> <coord-port> <name>`.

use anyhow::Context;
use clap::Parser;
use ringkv::cache::CacheStrategy;
use ringkv::cluster::RemoteCoordination;
use ringkv::config::{KeyMaterial, NodeConfig};
use ringkv::node::StorageNode;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ringkv-server")]
#[command(about = "ringkv storage node", long_about = None)]
struct Args {
    /// Port to accept clients, peers and the coordinator on
    port: u16,

    /// Cache capacity in entries; 0 or less disables the cache
    #[arg(allow_negative_numbers = true)]
    cache_size: i64,

    /// Cache policy: FIFO, LRU, LFU or CONCURRENT
    cache_strategy: CacheStrategy,

    /// Coordination service host
    coordination_host: String,

    /// Coordination service port
    coordination_port: u16,

    /// Ring identity of this node
    name: String,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Root directory for partition files
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ringkv=info".into()),
        )
        .init();

    let args = Args::parse();
    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", args.bind))?;

    let config = NodeConfig::new(args.name.clone(), listen_addr)
        .with_cache(args.cache_size, args.cache_strategy)
        .with_data_dir(args.data_dir)
        .with_keys(KeyMaterial::from_env());

    let coordination_addr = format!("{}:{}", args.coordination_host, args.coordination_port);
    let coordination = RemoteCoordination::connect(
        &coordination_addr,
        config.connect_timeout,
        Duration::from_secs(10),
    )
    .await
    .with_context(|| format!("cannot reach coordination service at {}", coordination_addr))?;

    let node = StorageNode::start(config, Arc::new(coordination))
        .await
        .context("failed to start storage node")?;
    info!(node = %node.name(), addr = %node.addr(), "Serving");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            info!("Interrupted, shutting down");
            node.shutdown();
        }
        _ = node.services().ctx.shutdown.cancelled() => {}
    }
    node.wait().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_arguments() {
        let args = Args::try_parse_from([
            "ringkv-server", "5001", "-1", "FIFO", "127.0.0.1", "2181", "node-1",
        ])
        .unwrap();
        assert_eq!(args.port, 5001);
        assert_eq!(args.cache_size, -1);
        assert_eq!(args.name, "node-1");
        assert_eq!(args.data_dir, PathBuf::from("./data"));

        assert!(Args::try_parse_from(["ringkv-server", "5001", "-1"]).is_err());
    }
}
