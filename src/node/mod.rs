//! Storage node: the process that owns a slice of the ring.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────── StorageNode ───────────────────────┐
//!   clients ─────►│ NetworkServer ──► NodeHandler ──► KvManager ──► DiskStorage │
//!   coordinator ─►│                       │              │                     │
//!   peers ───────►│                       │           KvCache                  │
//!                 │                       ▼                                    │
//!                 │              ReplicationService ──────────────────────────►│── replicas
//!                 │                       ▲                                    │
//!   /metadata ───►│ watcher ──► NodeServices::install_metadata                 │
//!                 └────────────────────────────────────────────────────────────┘
//! ```
//!
//! A node registers itself as an ephemeral child of `/nodes` once it is
//! listening, and mirrors the coordinator-signed ring published at
//! `/metadata`. Each newly installed ring triggers replica reconciliation.

pub mod context;
pub mod handler;
pub mod manager;
pub mod subscribers;

pub use context::NodeContext;
pub use handler::NodeHandler;
pub use manager::KvManager;
pub use subscribers::SubscriberRegistry;

use crate::cluster::coordination::{
    CoordinationClient, CreateMode, WatchEvent, METADATA_PATH, NODES_PATH,
};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::network::rpc::ClusterControl;
use crate::network::server::NetworkServer;
use crate::replication::ReplicationService;
use crate::storage::DiskStorage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Run blocking storage work off the async threads.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

/// Everything a node runs, shared by its handler and background tasks.
#[derive(Debug)]
pub struct NodeServices {
    pub ctx: Arc<NodeContext>,
    pub manager: Arc<KvManager>,
    pub replication: Arc<ReplicationService>,
    pub subscribers: Arc<SubscriberRegistry>,
    metadata_lock: Mutex<()>,
}

impl NodeServices {
    /// Open storage and start the replication consumer.
    pub fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let ctx = Arc::new(NodeContext::new(config)?);
        let storage = DiskStorage::open(
            ctx.config().node_dir(),
            ctx.client_verifier().clone(),
            ctx.replay.clone(),
        )?;
        let subscribers = Arc::new(SubscriberRegistry::new());
        let manager = Arc::new(KvManager::new(ctx.clone(), storage, subscribers.clone()));
        let replication = ReplicationService::start(ctx.clone(), manager.clone());
        Ok(Arc::new(Self {
            ctx,
            manager,
            replication,
            subscribers,
            metadata_lock: Mutex::new(()),
        }))
    }

    /// Install the ring carried by a verified coordinator command.
    ///
    /// Commands older than the installed one are ignored, so a ring delivered
    /// both directly and through the watch can arrive in either order.
    pub async fn install_metadata(&self, ctrl: ClusterControl) {
        let Some(ring) = ctrl.metadata.clone() else {
            return;
        };
        let _guard = self.metadata_lock.lock().await;

        if let Some(current) = self.ctx.authorization() {
            if current.timestamp > ctrl.timestamp {
                debug!(node = %self.ctx.name(), "Ignoring stale metadata");
                return;
            }
        }
        self.ctx.set_authorization(ctrl);
        let old = self.ctx.install_ring(ring);
        let new = self.ctx.ring();
        if *old == *new {
            return;
        }

        info!(node = %self.ctx.name(), nodes = new.len(), "Installed metadata");
        self.manager.clear_cache();
        self.replication.reconcile(&old, &new).await;
    }
}

/// Entry point for starting a node.
pub struct StorageNode;

impl StorageNode {
    /// Start a node: open storage, listen, follow `/metadata`, then announce
    /// the node under `/nodes`.
    pub async fn start(
        config: NodeConfig,
        coordination: Arc<dyn CoordinationClient>,
    ) -> Result<NodeHandle> {
        let listen_addr = config.listen_addr;
        let max_frame = config.max_frame_bytes;
        let services = NodeServices::start(config)?;
        let ctx = services.ctx.clone();

        let handler = Arc::new(NodeHandler::new(services.clone()));
        let server =
            NetworkServer::bind(listen_addr, handler, ctx.shutdown.clone(), max_frame).await?;
        let addr = server.local_addr()?;
        let server_task = tokio::spawn(server.run());

        let watch = coordination.watch_data(METADATA_PATH).await?;
        let watcher = tokio::spawn(follow_metadata(services.clone(), watch));

        let path = format!("{}/{}", NODES_PATH, ctx.name());
        coordination
            .create(&path, addr.to_string().into_bytes(), CreateMode::Ephemeral)
            .await?;
        info!(node = %ctx.name(), %addr, "Storage node started");

        let supervisor = tokio::spawn(supervise(
            ctx.clone(),
            server_task,
            watcher,
            coordination,
        ));
        Ok(NodeHandle {
            services,
            addr,
            supervisor,
        })
    }
}

async fn follow_metadata(services: Arc<NodeServices>, mut watch: mpsc::UnboundedReceiver<WatchEvent>) {
    let ctx = services.ctx.clone();
    loop {
        let event = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            event = watch.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let WatchEvent::DataChanged { data, .. } = event else {
            continue;
        };
        let ctrl: ClusterControl = match serde_json::from_slice(&data) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                warn!(node = %ctx.name(), error = %e, "Unreadable metadata");
                continue;
            }
        };
        if let Err(e) = ctx.verify_control(&ctrl, false) {
            warn!(node = %ctx.name(), error = %e, "Rejected published metadata");
            continue;
        }
        services.install_metadata(ctrl).await;
    }
    debug!(node = %ctx.name(), "Metadata watcher stopped");
}

async fn supervise(
    ctx: Arc<NodeContext>,
    server: JoinHandle<Result<()>>,
    watcher: JoinHandle<()>,
    coordination: Arc<dyn CoordinationClient>,
) -> Result<()> {
    let served = server
        .await
        .map_err(|e| Error::Internal(format!("server task failed: {}", e)))
        .and_then(|r| r);
    ctx.shutdown.cancel();
    watcher.abort();
    if let Err(e) = coordination.close().await {
        debug!(node = %ctx.name(), error = %e, "Closing coordination session failed");
    }
    info!(node = %ctx.name(), "Storage node stopped");
    served
}

/// A running node.
#[derive(Debug)]
pub struct NodeHandle {
    services: Arc<NodeServices>,
    addr: SocketAddr,
    supervisor: JoinHandle<Result<()>>,
}

impl NodeHandle {
    /// Address the node listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Ring identity.
    pub fn name(&self) -> &str {
        self.services.ctx.name()
    }

    /// Node internals, for inspection.
    pub fn services(&self) -> &Arc<NodeServices> {
        &self.services
    }

    /// Ask the node to stop.
    pub fn shutdown(&self) {
        self.services.ctx.shutdown.cancel();
    }

    /// Check if the node has stopped.
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait until the node has stopped and left the coordination service.
    pub async fn wait(self) -> Result<()> {
        self.supervisor
            .await
            .map_err(|e| Error::Internal(format!("node supervisor failed: {}", e)))?
    }
}
