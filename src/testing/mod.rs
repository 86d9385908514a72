//! In-process cluster harness.
//!
//! Runs a coordinator and any number of storage nodes inside one process,
//! sharing an [`InMemoryCoordination`] tree. Nodes listen on OS-assigned
//! ports and keep their partitions under a caller-supplied directory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── TestCluster ─────────────────────────────┐
//! │                                                                      │
//! │   Coordinator ──launch──► InProcessLauncher ──► StorageNode × N      │
//! │        │                         │                    │              │
//! │        └──────── session ────────┴──── session ───────┘              │
//! │                          InMemoryCoordination                        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A crash is modelled by expiring the node's coordination session and
//! stopping its server, which the coordinator cannot tell apart from a dead
//! process.
//!
//! # Example
//!
//! ```rust,ignore
//! let dir = tempfile::tempdir()?;
//! let cluster = TestCluster::start(dir.path(), 3, TestCluster::fast_config()).await?;
//! cluster.coordinator.add_nodes(3).await?;
//! cluster.coordinator.start().await?;
//!
//! let mut client = cluster.client("alice").await?;
//! client.put("key", "value").await?;
//! ```

mod cluster_tests;
mod utils;

pub use utils::{allocate_os_ports, wait_for, wait_for_result};

use crate::client::KvClient;
use crate::cluster::coordination::{InMemoryCoordination, InMemorySession};
use crate::cluster::coordinator::Coordinator;
use crate::cluster::launcher::{NodeDefinition, NodeLauncher};
use crate::config::{CoordinatorConfig, NodeConfig, ReplicationConfig};
use crate::error::{Error, MembershipError, Result};
use crate::node::{NodeHandle, NodeServices, StorageNode};
use crate::security::MessageSigner;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

struct RunningNode {
    handle: NodeHandle,
    session: Arc<InMemorySession>,
}

/// Starts storage nodes as tasks in the current runtime.
pub struct InProcessLauncher {
    tree: InMemoryCoordination,
    data_dir: PathBuf,
    replication: ReplicationConfig,
    nodes: DashMap<String, RunningNode>,
}

impl InProcessLauncher {
    pub fn new(tree: InMemoryCoordination, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            tree,
            data_dir: data_dir.into(),
            replication: ReplicationConfig::default(),
            nodes: DashMap::new(),
        }
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Internals of a launched node that is still running.
    pub fn services(&self, name: &str) -> Option<Arc<NodeServices>> {
        self.nodes
            .get(name)
            .filter(|n| !n.handle.is_finished())
            .map(|n| n.handle.services().clone())
    }

    /// Address of a launched node.
    pub fn addr_of(&self, name: &str) -> Option<SocketAddr> {
        self.nodes.get(name).map(|n| n.handle.addr())
    }

    /// Names of launched nodes that are still running.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| !n.handle.is_finished())
            .map(|n| n.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Kill a node without telling the coordinator.
    pub async fn crash(&self, name: &str) -> bool {
        let Some((_, node)) = self.nodes.remove(name) else {
            return false;
        };
        node.session.expire();
        node.handle.shutdown();
        if let Err(e) = node.handle.wait().await {
            debug!(node = %name, error = %e, "Crashed node stopped with error");
        }
        info!(node = %name, "Node crashed");
        true
    }

    /// Stop every node.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        for name in names {
            if let Some((_, node)) = self.nodes.remove(&name) {
                node.handle.shutdown();
                let _ = node.handle.wait().await;
            }
        }
    }
}

#[async_trait]
impl NodeLauncher for InProcessLauncher {
    async fn launch(&self, node: &NodeDefinition, config: &CoordinatorConfig) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", node.host, node.port)
            .parse()
            .map_err(|e| MembershipError::LaunchFailed {
                node: node.name.clone(),
                reason: format!("bad address: {}", e),
            })?;
        if let Some((_, previous)) = self.nodes.remove(&node.name) {
            previous.handle.shutdown();
            let _ = previous.handle.wait().await;
        }

        let node_config = NodeConfig::new(node.name.clone(), addr)
            .with_cache(config.cache_size, config.cache_strategy)
            .with_data_dir(&self.data_dir)
            .with_replication(self.replication.clone());
        let session = self.tree.connect();
        let handle = StorageNode::start(node_config, session.clone()).await?;
        self.nodes
            .insert(node.name.clone(), RunningNode { handle, session });
        Ok(())
    }
}

/// A coordinator plus its in-process node pool.
pub struct TestCluster {
    pub tree: InMemoryCoordination,
    pub launcher: Arc<InProcessLauncher>,
    pub coordinator: Arc<Coordinator>,
}

impl TestCluster {
    /// Coordinator settings with short grace periods.
    pub fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_membership_timeouts(Duration::from_secs(10), Duration::from_secs(10))
            .with_recovery_grace(Duration::from_millis(200))
    }

    /// Start a coordinator with a pool of `pool_size` nodes named
    /// `node-1..=node-N`. No node is added yet.
    pub async fn start(data_dir: &Path, pool_size: usize, config: CoordinatorConfig) -> Result<Self> {
        let ports = allocate_os_ports(pool_size)
            .await
            .map_err(|e| Error::Internal(format!("port allocation failed: {}", e)))?;
        let pool: Vec<NodeDefinition> = ports
            .into_iter()
            .enumerate()
            .map(|(i, port)| NodeDefinition::new(format!("node-{}", i + 1), "127.0.0.1", port))
            .collect();

        let tree = InMemoryCoordination::new();
        let launcher = Arc::new(
            InProcessLauncher::new(tree.clone(), data_dir)
                .with_replication(ReplicationConfig::default().with_join_grace(Duration::from_millis(100))),
        );
        let coordinator = Coordinator::new(
            config,
            MessageSigner::development_ecs(),
            tree.connect(),
            launcher.clone(),
            pool,
        )
        .await?;
        Ok(Self {
            tree,
            launcher,
            coordinator,
        })
    }

    /// Address of the node owning `key` on the coordinator's ring.
    pub fn owner_addr(&self, key: &str) -> Option<String> {
        self.coordinator.metadata().owner_of(key).map(|n| n.addr())
    }

    /// Names of the nodes replicating the owner of `key`.
    pub fn replica_addrs(&self, key: &str) -> Vec<String> {
        let ring = self.coordinator.metadata();
        ring.owner_of(key)
            .and_then(|owner| ring.replicas_of(&owner.name))
            .map(|replicas| replicas.iter().map(|n| n.addr()).collect())
            .unwrap_or_default()
    }

    /// Connect a client to the first node on the ring.
    pub async fn client(&self, client_id: &str) -> Result<KvClient> {
        let ring = self.coordinator.metadata();
        let node = ring
            .nodes()
            .first()
            .ok_or(MembershipError::NoAvailableNode)?;
        KvClient::connect(&node.addr(), client_id).await
    }

    /// Connect a client to the owner of `key`.
    pub async fn client_for(&self, key: &str, client_id: &str) -> Result<KvClient> {
        let addr = self
            .owner_addr(key)
            .ok_or(MembershipError::NoAvailableNode)?;
        KvClient::connect(&addr, client_id).await
    }

    /// Stop the coordinator and every node.
    pub async fn stop(&self) {
        let _ = self.coordinator.close().await;
        self.launcher.stop_all().await;
    }
}
