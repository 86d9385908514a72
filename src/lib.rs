//! Partitioned, replicated key-value store on a consistent-hashing ring.
//!
//! This crate provides the storage node, the coordinator (ECS) that manages
//! the ring, and a client library:
//! - **MD5 ring** assigning every key to one primary and up to two replicas
//! - **Coordination service** with ephemeral registrations and watches, used
//!   for membership and to publish the signed ring
//! - **Ed25519-signed** client and coordinator messages with replay rejection
//! - **Per-node cache** (FIFO, LRU, LFU or a concurrent TinyLFU) in front of
//!   JSON-lines partition files
//!
//! # Example
//!
//! ```rust,no_run
//! use ringkv::client::KvClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = KvClient::connect("127.0.0.1:5000", "alice").await?;
//!
//!     // Requests reaching the wrong node are rerouted with the ring it returns
//!     client.put("user:1", "Alice").await?;
//!
//!     let reply = client.get("user:1").await?;
//!     println!("{:?} {:?}", reply.status, reply.value);
//!
//!     // A PUT without a value deletes
//!     client.delete("user:1").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  Clients                    │
//! └─────────────────────────────────────────────┘
//!                     │ signed JSON frames
//!                     ▼
//! ┌─────────────────────────────────────────────┐        ┌──────────────┐
//! │               Storage nodes                 │◄─ctl───│ Coordinator  │
//! │  • primary for (predecessor, self]          │        │  (ECS)       │
//! │  • replica 1 / 2 for the two predecessors   │        └──────────────┘
//! └─────────────────────────────────────────────┘               │
//!        │ /nodes/<name>        ▲ /metadata                     │
//!        ▼                      │                               ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Coordination service                           │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: applied by the key's primary, then forwarded to its replicas
//!   asynchronously
//! - **Reads**: served by the primary or either replica; replicas may lag
//! - **Membership**: every change is driven by the coordinator, which moves
//!   data under a write lock before releasing the new owner

pub mod cache;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod node;
pub mod partitioning;
pub mod replication;
pub mod security;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::{CacheStrategy, KvCache};
pub use client::{ClientOptions, KvClient};
pub use config::{CoordinatorConfig, KeyMaterial, NodeConfig, ReplicationConfig};
pub use error::{Error, Result};
pub use types::{HashRange, KeyHash, NodeName, Partition};

// Re-export cluster types
pub use cluster::{
    Coordinator, CoordinationClient, InMemoryCoordination, MemberEvent, NodeDefinition,
    NodeLauncher, NodeState, RemoteCoordination,
};

// Re-export node types
pub use node::{NodeHandle, StorageNode};

// Re-export partitioning types
pub use partitioning::{Ring, RingNode};

// Re-export wire types
pub use network::rpc::{KvMessage, Message, StatusType};

// Re-export security types
pub use security::{MessageSigner, MessageVerifier};

// Re-export metrics types
pub use metrics::{Counter, Gauge, MetricsSnapshot, NodeMetrics};

// Re-export testing types
pub use testing::{InProcessLauncher, TestCluster};
