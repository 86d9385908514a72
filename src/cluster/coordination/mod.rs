//! Coordination service: a tree of small data nodes with ephemeral entries
//! and persistent watches.
//!
//! ```text
//!   /
//!   ├── nodes/
//!   │   ├── node-1     ephemeral, lives as long as node-1's session
//!   │   └── node-2
//!   └── metadata       signed UPDATE_METADATA control, JSON
//! ```
//!
//! Storage nodes announce themselves under `/nodes` and follow `/metadata`;
//! the coordinator watches `/nodes` and writes `/metadata`. Two backends are
//! provided: an in-process store and a TCP server/client pair exposing it to
//! separate processes.

mod memory;
mod remote;

pub use memory::{InMemoryCoordination, InMemorySession};
pub use remote::{CoordinationServer, RemoteCoordination};

use crate::error::{CoordinationError, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Parent of the per-node ephemeral entries.
pub const NODES_PATH: &str = "/nodes";

/// Entry holding the published ring.
pub const METADATA_PATH: &str = "/metadata";

/// Lifetime of a created entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Stays until deleted.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// A change seen by a watch.
///
/// Watches are persistent: every registration first receives the current
/// state, then one event per change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    /// The set of children under `path` changed.
    ChildrenChanged { path: String, children: Vec<String> },
    /// The data at `path` was created or replaced.
    DataChanged { path: String, data: Vec<u8> },
    /// `path` was deleted, or does not exist yet.
    Deleted { path: String },
}

/// Client side of a coordination session.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Create an entry. The parent must exist.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()>;

    /// Replace the data of an existing entry.
    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Read the data of an entry.
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete an entry without children.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check whether an entry exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names of the direct children of an entry, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Follow the children of `path`.
    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;

    /// Follow the data of `path`.
    async fn watch_data(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>>;

    /// End the session, removing its ephemeral entries.
    async fn close(&self) -> Result<()>;
}

/// Create `path` as a persistent entry unless it exists.
pub async fn ensure_path(client: &dyn CoordinationClient, path: &str) -> Result<()> {
    match client.create(path, Vec::new(), CreateMode::Persistent).await {
        Err(Error::Coordination(CoordinationError::NodeExists(_))) => Ok(()),
        other => other,
    }
}

/// Write `data` to `path`, creating a persistent entry if needed.
pub async fn put_data(client: &dyn CoordinationClient, path: &str, data: Vec<u8>) -> Result<()> {
    match client.set_data(path, data.clone()).await {
        Err(Error::Coordination(CoordinationError::NoNode(_))) => {
            client.create(path, data, CreateMode::Persistent).await
        }
        other => other,
    }
}

/// Parent path of an entry; `/` for top-level entries.
pub(crate) fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last component of a path.
pub(crate) fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_of("/nodes/a"), "/nodes");
        assert_eq!(parent_of("/nodes"), "/");
        assert_eq!(name_of("/nodes/a"), "a");
        assert_eq!(name_of("/metadata"), "metadata");
    }
}
