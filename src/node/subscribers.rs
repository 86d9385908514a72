//! Live client connections, keyed by client id, for change notifications.
//!
//! A record's subscriber set holds client ids only; the connection behind an
//! id is looked up at notification time. A client that reconnects replaces
//! its registration, and the old connection's cleanup removes the entry only
//! if it still belongs to that old connection.

use crate::network::rpc::{KvMessage, Message};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Registration {
    conn_id: u64,
    sender: mpsc::Sender<Message>,
}

/// Client id → live connection.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    conns: DashMap<String, Registration>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the connection of a client.
    pub fn register(&self, client_id: &str, conn_id: u64, sender: mpsc::Sender<Message>) {
        self.conns
            .insert(client_id.to_string(), Registration { conn_id, sender });
    }

    /// Drop a client's registration if it still points at `conn_id`.
    pub fn unregister(&self, client_id: &str, conn_id: u64) -> bool {
        self.conns
            .remove_if(client_id, |_, reg| reg.conn_id == conn_id)
            .is_some()
    }

    /// Connection id currently registered for a client.
    pub fn connection_of(&self, client_id: &str) -> Option<u64> {
        self.conns.get(client_id).map(|reg| reg.conn_id)
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Check if no client is registered.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn lookup(&self, client_id: &str) -> Option<Registration> {
        self.conns.get(client_id).map(|reg| reg.clone())
    }

    /// Send `notice` to every subscriber on a detached task.
    ///
    /// Subscribers whose connection is gone are pruned. Outside a runtime the
    /// notices are queued without waiting.
    pub fn notify(self: &Arc<Self>, subscribers: BTreeSet<String>, notice: KvMessage) {
        if subscribers.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.clone();
                handle.spawn(async move {
                    for client_id in subscribers {
                        let Some(reg) = registry.lookup(&client_id) else {
                            continue;
                        };
                        let msg = Message::Kv(KvMessage {
                            client_id: client_id.clone(),
                            ..notice.clone()
                        });
                        if reg.sender.send(msg).await.is_err() {
                            registry.unregister(&client_id, reg.conn_id);
                            debug!(client = %client_id, "Pruned stale subscriber connection");
                        }
                    }
                });
            }
            Err(_) => {
                for client_id in subscribers {
                    let Some(reg) = self.lookup(&client_id) else {
                        continue;
                    };
                    let msg = Message::Kv(KvMessage {
                        client_id: client_id.clone(),
                        ..notice.clone()
                    });
                    if let Err(mpsc::error::TrySendError::Closed(_)) = reg.sender.try_send(msg) {
                        self.unregister(&client_id, reg.conn_id);
                    }
                }
            }
        }
    }
}
