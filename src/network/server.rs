//! TCP server: accept loop plus one reader task and one writer task per
//! connection.
//!
//! The writer task drains an mpsc queue, so anything holding the session's
//! outbound sender (the subscriber registry, for instance) can push frames
//! to the peer without touching the socket.

use crate::error::{NetworkError, Result};
use crate::network::codec::FrameCodec;
use crate::network::rpc::Message;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Frames buffered per connection before senders wait.
const OUTBOUND_QUEUE: usize = 64;

/// How long a closing connection may take to flush queued frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection state visible to the handler.
#[derive(Debug)]
pub struct Session {
    /// Unique per server, never reused.
    pub conn_id: u64,

    /// Remote address.
    pub peer: SocketAddr,

    /// Identity announced by the peer's identification message.
    pub client_id: Option<String>,

    outbound: mpsc::Sender<Message>,
}

impl Session {
    /// Sender feeding this connection's writer task.
    pub fn outbound(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }
}

/// What to do after handling a message.
#[derive(Debug)]
pub enum Reply {
    /// Send a response.
    Send(Message),
    /// Send nothing.
    Silent,
    /// Send a response, flush, then stop the whole server.
    SendAndShutdown(Message),
    /// Close this connection.
    Close,
}

/// Handler for incoming messages.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message from a connection.
    async fn handle(&self, session: &mut Session, msg: Message) -> Reply;

    /// Called once when a connection is accepted.
    fn on_connect(&self, _session: &Session) {}

    /// Called once when a connection ends, before its writer is drained.
    fn on_disconnect(&self, _session: &Session) {}
}

/// TCP server for node traffic.
pub struct NetworkServer {
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
    max_frame_bytes: usize,
    next_conn_id: Arc<AtomicU64>,
}

impl NetworkServer {
    /// Bind the listening socket.
    ///
    /// Binding happens here rather than in [`run`](Self::run) so callers can
    /// bind port 0 and learn the real address before serving.
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            listener,
            handler,
            shutdown,
            max_frame_bytes,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                            debug!(%peer, conn_id, "Accepted connection");
                            let handler = self.handler.clone();
                            let shutdown = self.shutdown.clone();
                            let max_frame = self.max_frame_bytes;
                            tokio::spawn(async move {
                                Self::handle_connection(stream, peer, conn_id, handler, shutdown, max_frame).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(%addr, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        conn_id: u64,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
        max_frame_bytes: usize,
    ) {
        let framed = Framed::new(stream, FrameCodec::<Message>::with_max_frame(max_frame_bytes));
        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(%peer, error = %e, "Write failed");
                    break;
                }
            }
        });

        let mut session = Session {
            conn_id,
            peer,
            client_id: None,
            outbound: tx,
        };
        handler.on_connect(&session);

        let mut stop_server = false;
        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = shutdown.cancelled() => break,
            };
            let msg = match frame {
                None => break,
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "Dropping connection on bad frame");
                    break;
                }
            };

            match handler.handle(&mut session, msg).await {
                Reply::Send(response) => {
                    if session.outbound.send(response).await.is_err() {
                        break;
                    }
                }
                Reply::Silent => {}
                Reply::SendAndShutdown(response) => {
                    let _ = session.outbound.send(response).await;
                    stop_server = true;
                    break;
                }
                Reply::Close => break,
            }
        }

        handler.on_disconnect(&session);
        drop(session);
        if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
            debug!(%peer, conn_id, "Writer did not drain in time");
        }
        debug!(%peer, conn_id, "Connection closed");

        if stop_server {
            shutdown.cancel();
        }
    }
}
