//! In-process coordination store.
//!
//! One [`InMemoryCoordination`] is the shared tree; every participant
//! connects to get its own [`InMemorySession`]. Expiring a session removes
//! its ephemeral entries and fires the watches exactly as a process crash
//! would.

use super::{name_of, parent_of, CoordinationClient, CreateMode, WatchEvent};
use crate::error::{CoordinationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    /// Session owning an ephemeral entry.
    owner: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Children,
    Data,
}

#[derive(Debug)]
struct Watch {
    session: u64,
    path: String,
    kind: WatchKind,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Store {
    entries: BTreeMap<String, Entry>,
    watches: Vec<Watch>,
    live: HashSet<u64>,
    next_session: u64,
}

impl Store {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.entries.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.entries
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| &p[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn children_event(&self, path: &str) -> WatchEvent {
        if self.exists(path) {
            WatchEvent::ChildrenChanged {
                path: path.to_string(),
                children: self.children(path),
            }
        } else {
            WatchEvent::Deleted {
                path: path.to_string(),
            }
        }
    }

    fn data_event(&self, path: &str) -> WatchEvent {
        match self.entries.get(path) {
            Some(entry) => WatchEvent::DataChanged {
                path: path.to_string(),
                data: entry.data.clone(),
            },
            None => WatchEvent::Deleted {
                path: path.to_string(),
            },
        }
    }

    /// Fire watches after `path` changed. Watches whose receiver is gone are
    /// dropped.
    fn fire(&mut self, path: &str, membership_changed: bool) {
        let parent = parent_of(path);
        let children = membership_changed.then(|| self.children_event(parent));
        let data = self.data_event(path);
        self.watches.retain(|w| {
            let event = match w.kind {
                WatchKind::Children if w.path == parent => match &children {
                    Some(event) => event,
                    None => return true,
                },
                WatchKind::Data if w.path == path => &data,
                _ => return true,
            };
            w.tx.send(event.clone()).is_ok()
        });
    }

    fn check(&self, session: u64) -> std::result::Result<(), CoordinationError> {
        if self.live.contains(&session) {
            Ok(())
        } else {
            Err(CoordinationError::SessionExpired)
        }
    }

    fn end_session(&mut self, session: u64) -> bool {
        if !self.live.remove(&session) {
            return false;
        }
        self.watches.retain(|w| w.session != session);
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in &owned {
            self.entries.remove(path);
            self.fire(path, true);
        }
        debug!(session, removed = owned.len(), "Coordination session ended");
        true
    }
}

/// Shared in-process coordination tree.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordination {
    store: Arc<Mutex<Store>>,
}

impl InMemoryCoordination {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session.
    pub fn connect(&self) -> Arc<InMemorySession> {
        let mut store = self.store.lock();
        store.next_session += 1;
        let id = store.next_session;
        store.live.insert(id);
        Arc::new(InMemorySession {
            id,
            store: self.store.clone(),
        })
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.store.lock().live.len()
    }
}

/// One participant's session on an [`InMemoryCoordination`].
#[derive(Debug)]
pub struct InMemorySession {
    id: u64,
    store: Arc<Mutex<Store>>,
}

impl InMemorySession {
    /// Session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// End the session abruptly, as if its process had died.
    pub fn expire(&self) -> bool {
        self.store.lock().end_session(self.id)
    }

    /// Check if the session is still open.
    pub fn is_alive(&self) -> bool {
        self.store.lock().live.contains(&self.id)
    }

    fn watch(&self, path: &str, kind: WatchKind) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let mut store = self.store.lock();
        store.check(self.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = match kind {
            WatchKind::Children => store.children_event(path),
            WatchKind::Data => store.data_event(path),
        };
        let _ = tx.send(initial);
        store.watches.push(Watch {
            session: self.id,
            path: path.to_string(),
            kind,
            tx,
        });
        Ok(rx)
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.store.lock().end_session(self.id);
    }
}

#[async_trait]
impl CoordinationClient for InMemorySession {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        let mut store = self.store.lock();
        store.check(self.id)?;
        if store.exists(path) {
            return Err(CoordinationError::NodeExists(path.to_string()).into());
        }
        if !store.exists(parent_of(path)) || name_of(path).is_empty() {
            return Err(CoordinationError::NoParent(path.to_string()).into());
        }
        let owner = (mode == CreateMode::Ephemeral).then_some(self.id);
        store.entries.insert(path.to_string(), Entry { data, owner });
        store.fire(path, true);
        Ok(())
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let mut store = self.store.lock();
        store.check(self.id)?;
        match store.entries.get_mut(path) {
            Some(entry) => entry.data = data,
            None => return Err(CoordinationError::NoNode(path.to_string()).into()),
        }
        store.fire(path, false);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let store = self.store.lock();
        store.check(self.id)?;
        store
            .entries
            .get(path)
            .map(|e| e.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()).into())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut store = self.store.lock();
        store.check(self.id)?;
        if !store.entries.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()).into());
        }
        if !store.children(path).is_empty() {
            return Err(CoordinationError::NotEmpty(path.to_string()).into());
        }
        store.entries.remove(path);
        store.fire(path, true);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let store = self.store.lock();
        store.check(self.id)?;
        Ok(store.exists(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let store = self.store.lock();
        store.check(self.id)?;
        if !store.exists(path) {
            return Err(CoordinationError::NoNode(path.to_string()).into());
        }
        Ok(store.children(path))
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        self.watch(path, WatchKind::Children)
    }

    async fn watch_data(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        self.watch(path, WatchKind::Data)
    }

    async fn close(&self) -> Result<()> {
        self.store.lock().end_session(self.id);
        Ok(())
    }
}
