//! Configuration types for storage nodes and the coordinator.

use crate::cache::CacheStrategy;
use crate::error::{Error, Result};
use crate::network::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::security::{MessageSigner, MessageVerifier};
use crate::types::NodeName;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the client public key (hex).
pub const CLIENT_PUBLIC_KEY_ENV: &str = "RINGKV_CLIENT_PUBLIC_KEY";

/// Environment variable overriding the coordinator public key (hex).
pub const ECS_PUBLIC_KEY_ENV: &str = "RINGKV_ECS_PUBLIC_KEY";

/// Public keys a node verifies against.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// Hex-encoded Ed25519 key clients sign with.
    pub client_public_key: String,

    /// Hex-encoded Ed25519 key the coordinator signs with.
    pub ecs_public_key: String,
}

impl Default for KeyMaterial {
    fn default() -> Self {
        Self {
            client_public_key: MessageSigner::development_client().public_key_hex(),
            ecs_public_key: MessageSigner::development_ecs().public_key_hex(),
        }
    }
}

impl KeyMaterial {
    /// Defaults, overridden by the environment where set.
    pub fn from_env() -> Self {
        let mut keys = Self::default();
        if let Ok(key) = std::env::var(CLIENT_PUBLIC_KEY_ENV) {
            keys.client_public_key = key;
        }
        if let Ok(key) = std::env::var(ECS_PUBLIC_KEY_ENV) {
            keys.ecs_public_key = key;
        }
        keys
    }

    /// Verifier for client-signed messages.
    pub fn client_verifier(&self) -> Result<MessageVerifier> {
        MessageVerifier::from_hex(&self.client_public_key)
            .map_err(|e| Error::Config(format!("client public key: {}", e)))
    }

    /// Verifier for coordinator-signed messages.
    pub fn ecs_verifier(&self) -> Result<MessageVerifier> {
        MessageVerifier::from_hex(&self.ecs_public_key)
            .map_err(|e| Error::Config(format!("ecs public key: {}", e)))
    }
}

/// Configuration of one storage node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Ring identity of this node.
    pub name: NodeName,

    /// Address to accept connections on.
    pub listen_addr: SocketAddr,

    /// Cache capacity in entries; zero or less disables the cache.
    pub cache_size: i64,

    /// Cache eviction policy.
    pub cache_strategy: CacheStrategy,

    /// Root directory; partitions live in `<data_dir>/<name>/`.
    pub data_dir: PathBuf,

    /// Largest accepted wire frame.
    pub max_frame_bytes: usize,

    /// Timeout for connecting to peers.
    pub connect_timeout: Duration,

    /// Timeout for a peer to answer a request.
    pub request_timeout: Duration,

    /// Keys to verify clients and the coordinator with.
    pub keys: KeyMaterial,

    /// Replication settings.
    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node-1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            cache_size: 100,
            cache_strategy: CacheStrategy::Lru,
            data_dir: PathBuf::from("./data"),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            keys: KeyMaterial::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a configuration for a named node listening on `listen_addr`.
    pub fn new(name: impl Into<NodeName>, listen_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            listen_addr,
            ..Default::default()
        }
    }

    /// Set cache size and policy.
    pub fn with_cache(mut self, size: i64, strategy: CacheStrategy) -> Self {
        self.cache_size = size;
        self.cache_strategy = strategy;
        self
    }

    /// Set the data directory root.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set peer timeouts.
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    /// Set verification keys.
    pub fn with_keys(mut self, keys: KeyMaterial) -> Self {
        self.keys = keys;
        self
    }

    /// Set replication configuration.
    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Directory holding this node's partitions.
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(&self.name)
    }
}

/// Replication settings.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Delay before a freshly joined node pushes its replicas, giving the
    /// coordinator time to move the node's primary data in.
    pub join_grace: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            join_grace: Duration::from_secs(2),
        }
    }
}

impl ReplicationConfig {
    /// Set the join grace period.
    pub fn with_join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = grace;
        self
    }
}

/// Default node launch command: start the server over ssh, detached.
pub const DEFAULT_LAUNCH_COMMAND: &str = "ssh -n {host} nohup ringkv-server {port} {cache_size} {cache_strategy} {coord_host} {coord_port} {name}";

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long to wait for a launched node to show up.
    pub join_timeout: Duration,

    /// How long to wait for a shut down node to disappear.
    pub leave_timeout: Duration,

    /// Delay before a crashed node is re-added.
    pub recovery_grace: Duration,

    /// Cache size passed to launched nodes.
    pub cache_size: i64,

    /// Cache policy passed to launched nodes.
    pub cache_strategy: CacheStrategy,

    /// Coordination service host passed to launched nodes.
    pub coordination_host: String,

    /// Coordination service port passed to launched nodes.
    pub coordination_port: u16,

    /// Timeout for connecting to nodes.
    pub connect_timeout: Duration,

    /// Timeout for nodes to acknowledge a control message.
    pub request_timeout: Duration,

    /// Command that starts a node on a remote host. Placeholders: `{host}`,
    /// `{port}`, `{cache_size}`, `{cache_strategy}`, `{coord_host}`,
    /// `{coord_port}`, `{name}`.
    pub launch_command: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(30),
            leave_timeout: Duration::from_secs(30),
            recovery_grace: Duration::from_secs(5),
            cache_size: 100,
            cache_strategy: CacheStrategy::Lru,
            coordination_host: "127.0.0.1".to_string(),
            coordination_port: 2181,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            launch_command: DEFAULT_LAUNCH_COMMAND.to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Set join and leave confirmation timeouts.
    pub fn with_membership_timeouts(mut self, join: Duration, leave: Duration) -> Self {
        self.join_timeout = join;
        self.leave_timeout = leave;
        self
    }

    /// Set the crash recovery delay.
    pub fn with_recovery_grace(mut self, grace: Duration) -> Self {
        self.recovery_grace = grace;
        self
    }

    /// Set cache parameters for launched nodes.
    pub fn with_node_cache(mut self, size: i64, strategy: CacheStrategy) -> Self {
        self.cache_size = size;
        self.cache_strategy = strategy;
        self
    }

    /// Set the node launch command template.
    pub fn with_launch_command(mut self, command: impl Into<String>) -> Self {
        self.launch_command = command.into();
        self
    }

    /// Set the coordination service address handed to launched nodes.
    pub fn with_coordination_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.coordination_host = host.into();
        self.coordination_port = port;
        self
    }
}
