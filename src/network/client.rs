//! Outbound connections: a single framed connection and a per-peer pool.

use crate::error::{Error, NetworkError, Result};
use crate::network::codec::FrameCodec;
use crate::network::rpc::{Identification, Message};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::debug;

/// A framed connection to a node.
#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, FrameCodec<Message>>,
    addr: String,
    request_timeout: Duration,
}

impl Connection {
    /// Connect with a bounded wait.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            addr: addr.to_string(),
            request_timeout,
        })
    }

    /// Remote address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one message.
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.framed.send(msg).await
    }

    /// Wait for the next message, bounded by the request timeout.
    pub async fn recv(&mut self) -> Result<Message> {
        match tokio::time::timeout(self.request_timeout, self.framed.next()).await {
            Err(_) => Err(Error::Timeout),
            Ok(None) => Err(NetworkError::ConnectionClosed.into()),
            Ok(Some(frame)) => frame,
        }
    }

    /// Send a message and wait for the next one.
    pub async fn request(&mut self, msg: Message) -> Result<Message> {
        self.send(msg).await?;
        self.recv().await
    }

    /// Announce an identity; the node echoes it back.
    pub async fn identify(&mut self, client_id: &str) -> Result<()> {
        let ident = Message::Identification(Identification {
            client_id: client_id.to_string(),
        });
        match self.request(ident).await? {
            Message::Identification(_) => Ok(()),
            other => Err(Error::Protocol(format!(
                "expected identification ack, got {:?}",
                other
            ))),
        }
    }
}

type Slot = Arc<Mutex<Option<Connection>>>;

/// Cached, identified connections to peer nodes, one per address.
///
/// Requests to the same peer are serialized on its connection. A broken
/// connection is dropped and the request retried once on a fresh one.
#[derive(Debug)]
pub struct PeerPool {
    local_id: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    peers: DashMap<String, Slot>,
}

impl PeerPool {
    /// Create a pool that identifies as `local_id`.
    pub fn new(local_id: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            connect_timeout,
            request_timeout,
            peers: DashMap::new(),
        }
    }

    async fn open(&self, addr: &str) -> Result<Connection> {
        let mut conn = Connection::connect(addr, self.connect_timeout, self.request_timeout).await?;
        conn.identify(&self.local_id).await?;
        Ok(conn)
    }

    /// Send a request to `addr` and wait for its response.
    pub async fn request(&self, addr: &str, msg: Message) -> Result<Message> {
        let slot = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut guard = slot.lock().await;

        let reused = guard.is_some();
        if !reused {
            *guard = Some(self.open(addr).await?);
        }

        let first = match guard.as_mut() {
            Some(conn) => conn.request(msg.clone()).await,
            None => Err(NetworkError::ConnectionClosed.into()),
        };
        match first {
            Ok(response) => Ok(response),
            Err(e) if reused => {
                debug!(peer = %addr, error = %e, "Cached connection failed, reconnecting");
                *guard = None;
                let mut conn = self.open(addr).await?;
                let result = conn.request(msg).await;
                if result.is_ok() {
                    *guard = Some(conn);
                }
                result
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Forget the connection to `addr`.
    pub fn evict(&self, addr: &str) {
        self.peers.remove(addr);
    }

    /// Number of peers with a slot.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
