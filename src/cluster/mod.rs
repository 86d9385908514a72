//! Cluster membership: the coordination service, the coordinator that
//! drives it and the launcher that starts node processes.

pub mod coordination;
pub mod coordinator;
pub mod events;
pub mod launcher;

pub use coordination::{
    CoordinationClient, CoordinationServer, CreateMode, InMemoryCoordination, InMemorySession,
    RemoteCoordination, WatchEvent, METADATA_PATH, NODES_PATH,
};
pub use coordinator::{Coordinator, NodeState};
pub use events::{classify_membership, LoggingEventListener, MemberEvent, MemberEventListener};
pub use launcher::{parse_pool, NodeDefinition, NodeLauncher, SshLauncher};
