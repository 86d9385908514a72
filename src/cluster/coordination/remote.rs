//! Coordination over TCP.
//!
//! [`CoordinationServer`] exposes an [`InMemoryCoordination`] tree to other
//! processes; each TCP connection is one session, so a process that dies
//! loses its ephemeral entries when the socket closes. [`RemoteCoordination`]
//! is the client. Frames use the same `\n\r`-terminated JSON codec as node
//! traffic.

use super::{CoordinationClient, CreateMode, InMemoryCoordination, WatchEvent};
use crate::error::{CoordinationError, Error, NetworkError, Result};
use crate::network::codec::FrameCodec;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum CoordOp {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
    },
    GetData {
        path: String,
    },
    Delete {
        path: String,
    },
    Exists {
        path: String,
    },
    Children {
        path: String,
    },
    WatchChildren {
        path: String,
        watch_id: u64,
    },
    WatchData {
        path: String,
        watch_id: u64,
    },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CoordReply {
    Done,
    Data(Vec<u8>),
    Exists(bool),
    Children(Vec<String>),
}

type CoordResult = std::result::Result<CoordReply, CoordinationError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
enum CoordFrame {
    Request { id: u64, op: CoordOp },
    Response { id: u64, result: CoordResult },
    Watch { watch_id: u64, event: WatchEvent },
}

/// Serves a coordination tree over TCP.
pub struct CoordinationServer {
    listener: TcpListener,
    tree: InMemoryCoordination,
    shutdown: CancellationToken,
}

impl CoordinationServer {
    /// Bind the listening socket.
    pub async fn bind(
        addr: SocketAddr,
        tree: InMemoryCoordination,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            listener,
            tree,
            shutdown,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Coordination server listening");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let tree = self.tree.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        serve_session(stream, peer, tree, shutdown).await;
                    });
                }
            }
        }
        info!("Coordination server stopped");
        Ok(())
    }
}

async fn serve_session(
    stream: TcpStream,
    peer: SocketAddr,
    tree: InMemoryCoordination,
    shutdown: CancellationToken,
) {
    let session = tree.connect();
    debug!(%peer, session = session.id(), "Coordination session opened");
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::<CoordFrame>::new()).split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<CoordFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "Bad coordination frame");
                    break;
                }
                None => break,
            },
        };
        let CoordFrame::Request { id, op } = frame else {
            continue;
        };
        let close = op == CoordOp::Close;
        let result = execute(session.as_ref(), op, &out_tx).await;
        if out_tx.send(CoordFrame::Response { id, result }).is_err() || close {
            break;
        }
    }

    session.expire();
    drop(out_tx);
    let _ = writer.await;
    debug!(%peer, "Coordination session closed");
}

async fn execute(
    session: &dyn CoordinationClient,
    op: CoordOp,
    out: &mpsc::UnboundedSender<CoordFrame>,
) -> CoordResult {
    let result = match op {
        CoordOp::Create { path, data, mode } => {
            session.create(&path, data, mode).await.map(|_| CoordReply::Done)
        }
        CoordOp::SetData { path, data } => {
            session.set_data(&path, data).await.map(|_| CoordReply::Done)
        }
        CoordOp::GetData { path } => session.get_data(&path).await.map(CoordReply::Data),
        CoordOp::Delete { path } => session.delete(&path).await.map(|_| CoordReply::Done),
        CoordOp::Exists { path } => session.exists(&path).await.map(CoordReply::Exists),
        CoordOp::Children { path } => session.children(&path).await.map(CoordReply::Children),
        CoordOp::WatchChildren { path, watch_id } => session
            .watch_children(&path)
            .await
            .map(|rx| forward_watch(watch_id, rx, out.clone())),
        CoordOp::WatchData { path, watch_id } => session
            .watch_data(&path)
            .await
            .map(|rx| forward_watch(watch_id, rx, out.clone())),
        CoordOp::Close => Ok(CoordReply::Done),
    };
    result.map_err(|e| match e {
        Error::Coordination(e) => e,
        _ => CoordinationError::SessionExpired,
    })
}

fn forward_watch(
    watch_id: u64,
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    out: mpsc::UnboundedSender<CoordFrame>,
) -> CoordReply {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if out.send(CoordFrame::Watch { watch_id, event }).is_err() {
                break;
            }
        }
    });
    CoordReply::Done
}

type Pending = DashMap<u64, oneshot::Sender<CoordResult>>;
type Watches = DashMap<u64, mpsc::UnboundedSender<WatchEvent>>;

/// Coordination client talking to a [`CoordinationServer`].
pub struct RemoteCoordination {
    outbound: mpsc::UnboundedSender<CoordFrame>,
    pending: Arc<Pending>,
    watches: Arc<Watches>,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: CancellationToken,
}

impl RemoteCoordination {
    /// Connect and open a session.
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

        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::<CoordFrame>::new()).split();
        let (outbound, mut out_rx) = mpsc::unbounded_channel::<CoordFrame>();
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let watches: Arc<Watches> = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let (reader_pending, reader_watches, reader_closed) =
            (pending.clone(), watches.clone(), closed.clone());
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(CoordFrame::Response { id, result })) => {
                        if let Some((_, tx)) = reader_pending.remove(&id) {
                            let _ = tx.send(result);
                        }
                    }
                    Some(Ok(CoordFrame::Watch { watch_id, event })) => {
                        let delivered = reader_watches
                            .get(&watch_id)
                            .map(|tx| tx.send(event).is_ok());
                        if delivered == Some(false) {
                            reader_watches.remove(&watch_id);
                        }
                    }
                    Some(Ok(CoordFrame::Request { .. })) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Coordination connection failed");
                        break;
                    }
                    None => break,
                }
            }
            reader_closed.cancel();
            reader_pending.clear();
            reader_watches.clear();
        });

        debug!(%addr, "Connected to coordination service");
        Ok(Self {
            outbound,
            pending,
            watches,
            next_id: AtomicU64::new(1),
            request_timeout,
            closed,
        })
    }

    async fn call(&self, op: CoordOp) -> Result<CoordReply> {
        if self.closed.is_cancelled() {
            return Err(CoordinationError::SessionExpired.into());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.outbound.send(CoordFrame::Request { id, op }).is_err() {
            self.pending.remove(&id);
            return Err(CoordinationError::SessionExpired.into());
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout)
            }
            Ok(Err(_)) => Err(CoordinationError::SessionExpired.into()),
            Ok(Ok(result)) => result.map_err(Into::into),
        }
    }

    async fn watch(
        &self,
        op: impl FnOnce(u64) -> CoordOp,
    ) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let watch_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        // Registered first so the initial event cannot race the response.
        self.watches.insert(watch_id, tx);
        match self.call(op(watch_id)).await {
            Ok(_) => Ok(rx),
            Err(e) => {
                self.watches.remove(&watch_id);
                Err(e)
            }
        }
    }
}

fn unexpected(reply: CoordReply) -> Error {
    Error::Protocol(format!("unexpected coordination reply: {:?}", reply))
}

#[async_trait]
impl CoordinationClient for RemoteCoordination {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        self.call(CoordOp::Create {
            path: path.to_string(),
            data,
            mode,
        })
        .await
        .map(|_| ())
    }

    async fn set_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.call(CoordOp::SetData {
            path: path.to_string(),
            data,
        })
        .await
        .map(|_| ())
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        match self
            .call(CoordOp::GetData {
                path: path.to_string(),
            })
            .await?
        {
            CoordReply::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.call(CoordOp::Delete {
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self
            .call(CoordOp::Exists {
                path: path.to_string(),
            })
            .await?
        {
            CoordReply::Exists(exists) => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        match self
            .call(CoordOp::Children {
                path: path.to_string(),
            })
            .await?
        {
            CoordReply::Children(children) => Ok(children),
            other => Err(unexpected(other)),
        }
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let path = path.to_string();
        self.watch(move |watch_id| CoordOp::WatchChildren { path, watch_id })
            .await
    }

    async fn watch_data(&self, path: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let path = path.to_string();
        self.watch(move |watch_id| CoordOp::WatchData { path, watch_id })
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        let result = self.call(CoordOp::Close).await.map(|_| ());
        self.closed.cancel();
        result
    }
}

impl Drop for RemoteCoordination {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordination::{ensure_path, NODES_PATH};

    async fn server() -> (InMemoryCoordination, SocketAddr, CancellationToken) {
        let tree = InMemoryCoordination::new();
        let shutdown = CancellationToken::new();
        let server = CoordinationServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            tree.clone(),
            shutdown.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (tree, addr, shutdown)
    }

    async fn client(addr: SocketAddr) -> RemoteCoordination {
        RemoteCoordination::connect(
            &addr.to_string(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_remote_operations() {
        let (_tree, addr, shutdown) = server().await;
        let c = client(addr).await;

        ensure_path(&c, NODES_PATH).await.unwrap();
        assert!(c.exists(NODES_PATH).await.unwrap());
        c.create("/nodes/a", b"addr".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(c.get_data("/nodes/a").await.unwrap(), b"addr".to_vec());
        assert_eq!(c.children(NODES_PATH).await.unwrap(), vec!["a"]);

        let err = c.get_data("/missing").await.unwrap_err();
        assert!(matches!(err, Error::Coordination(CoordinationError::NoNode(_))));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_removes_ephemerals() {
        let (tree, addr, shutdown) = server().await;
        let watcher = tree.connect();
        ensure_path(watcher.as_ref(), NODES_PATH).await.unwrap();
        let mut watch = watcher.watch_children(NODES_PATH).await.unwrap();
        watch.recv().await.unwrap();

        let node = client(addr).await;
        node.create("/nodes/n1", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(
            watch.recv().await.unwrap(),
            WatchEvent::ChildrenChanged {
                path: NODES_PATH.to_string(),
                children: vec!["n1".to_string()],
            }
        );

        drop(node);
        assert_eq!(
            watch.recv().await.unwrap(),
            WatchEvent::ChildrenChanged {
                path: NODES_PATH.to_string(),
                children: Vec::new(),
            }
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_remote_watch_delivers_initial_state_and_changes() {
        let (tree, addr, shutdown) = server().await;
        let c = client(addr).await;
        let mut watch = c.watch_data("/metadata").await.unwrap();
        assert!(matches!(watch.recv().await.unwrap(), WatchEvent::Deleted { .. }));

        let writer = tree.connect();
        writer
            .create("/metadata", b"ring".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        match watch.recv().await.unwrap() {
            WatchEvent::DataChanged { data, .. } => assert_eq!(data, b"ring".to_vec()),
            other => panic!("unexpected {:?}", other),
        }
        c.close().await.unwrap();
        shutdown.cancel();
    }
}
