//! Coordinator process.
//!
//! Hosts the coordination service, launches the initial nodes from a pool
//! file and then takes commands on stdin:
//!
//! ```text
//! start | stop | addNode | addNodes <n> | removeNode <name> | status | shutDown | quit | help
//! ```

use anyhow::Context;
use clap::Parser;
use ringkv::cache::CacheStrategy;
use ringkv::cluster::{parse_pool, CoordinationServer, Coordinator, InMemoryCoordination, SshLauncher};
use ringkv::config::CoordinatorConfig;
use ringkv::security::MessageSigner;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ringkv-ecs")]
#[command(about = "ringkv coordinator", long_about = None)]
struct Args {
    /// Pool file, one `name host port` per line
    pool: PathBuf,

    /// Port the coordination service listens on
    coordination_port: u16,

    /// Number of nodes to launch at startup
    initial_nodes: usize,

    /// Host nodes use to reach the coordination service
    #[arg(long, default_value = "127.0.0.1")]
    coordination_host: String,

    /// Cache capacity handed to launched nodes
    #[arg(long, default_value_t = 100, allow_negative_numbers = true)]
    cache_size: i64,

    /// Cache policy handed to launched nodes
    #[arg(long, default_value = "LRU")]
    cache_strategy: CacheStrategy,

    /// Hex-encoded seed of the coordinator signing key
    #[arg(long, env = "RINGKV_ECS_SEED")]
    ecs_seed: Option<String>,
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
    let pool_text = std::fs::read_to_string(&args.pool)
        .with_context(|| format!("cannot read pool file {}", args.pool.display()))?;
    let pool = parse_pool(&pool_text)?;
    anyhow::ensure!(
        args.initial_nodes <= pool.len(),
        "requested {} nodes but the pool has {}",
        args.initial_nodes,
        pool.len()
    );

    let signer = match &args.ecs_seed {
        Some(seed) => MessageSigner::from_hex(seed)?,
        None => MessageSigner::development_ecs(),
    };

    let tree = InMemoryCoordination::new();
    let shutdown = CancellationToken::new();
    let server = CoordinationServer::bind(
        SocketAddr::from(([0, 0, 0, 0], args.coordination_port)),
        tree.clone(),
        shutdown.clone(),
    )
    .await?;
    let server_task = tokio::spawn(server.run());

    let config = CoordinatorConfig::default()
        .with_node_cache(args.cache_size, args.cache_strategy)
        .with_coordination_addr(args.coordination_host.clone(), args.coordination_port);
    let coordinator = Coordinator::new(
        config,
        signer,
        tree.connect(),
        Arc::new(SshLauncher::new()),
        pool,
    )
    .await?;

    coordinator
        .add_nodes(args.initial_nodes)
        .await
        .context("failed to launch initial nodes")?;
    info!(nodes = args.initial_nodes, "Initial nodes launched");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let outcome = match tokens.as_slice() {
            [] => continue,
            ["start"] => coordinator.start().await,
            ["stop"] => coordinator.stop().await,
            ["addNode"] => coordinator.add_node().await.map(|node| {
                println!("added {} at {} owning {}", node.name, node.addr(), node.range());
            }),
            ["addNodes", count] => match count.parse::<usize>() {
                Ok(count) => coordinator.add_nodes(count).await.map(|nodes| {
                    println!("added {} nodes", nodes.len());
                }),
                Err(_) => {
                    println!("addNodes expects a number, got {:?}", count);
                    continue;
                }
            },
            ["removeNode", name] => coordinator.remove_node(name).await,
            ["status"] => {
                for node in coordinator.metadata().nodes() {
                    println!("{:<12} {:<22} {}", node.name, node.addr(), node.range());
                }
                for (name, state) in coordinator.node_states() {
                    println!("{:<12} {:?}", name, state);
                }
                continue;
            }
            ["shutDown"] => coordinator.shutdown().await,
            ["quit"] => {
                if let Err(e) = coordinator.shutdown().await {
                    error!(error = %e, "Shutdown incomplete");
                }
                break;
            }
            ["help"] => {
                println!("start | stop | addNode | addNodes <n> | removeNode <name> | status | shutDown | quit");
                continue;
            }
            other => {
                println!("unknown command {:?}, try help", other.join(" "));
                continue;
            }
        };
        match outcome {
            Ok(()) => println!("ok"),
            Err(e) => println!("failed: {}", e),
        }
    }

    coordinator.close().await?;
    shutdown.cancel();
    server_task.await??;
    Ok(())
}
