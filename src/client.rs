//! Client library.
//!
//! A [`KvClient`] holds one identified connection and the last ring it was
//! given. Requests answered with NOT_RESPONSIBLE update that ring and are
//! retried once on the owner. NOTIFY messages that arrive while a request is
//! in flight are buffered and handed out by [`KvClient::next_notification`].

use crate::error::{Error, Result};
use crate::network::client::Connection;
use crate::network::rpc::{KvMessage, Message, MetadataUpdate, StatusType};
use crate::partitioning::Ring;
use crate::security::MessageSigner;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client connection options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    pub signer: MessageSigner,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            signer: MessageSigner::development_client(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_signer(mut self, signer: MessageSigner) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }
}

/// A signing client bound to one node at a time.
#[derive(Debug)]
pub struct KvClient {
    options: ClientOptions,
    connection: Connection,
    ring: Ring,
    notifications: VecDeque<KvMessage>,
}

impl KvClient {
    /// Connect with the development client key.
    pub async fn connect(addr: &str, client_id: impl Into<String>) -> Result<Self> {
        Self::connect_with(addr, ClientOptions::new(client_id)).await
    }

    /// Connect and identify.
    pub async fn connect_with(addr: &str, options: ClientOptions) -> Result<Self> {
        let connection = Self::open(addr, &options).await?;
        Ok(Self {
            options,
            connection,
            ring: Ring::new(),
            notifications: VecDeque::new(),
        })
    }

    async fn open(addr: &str, options: &ClientOptions) -> Result<Connection> {
        let mut connection =
            Connection::connect(addr, options.connect_timeout, options.request_timeout).await?;
        connection.identify(&options.client_id).await?;
        debug!(addr, client = %options.client_id, "Client connected");
        Ok(connection)
    }

    pub fn client_id(&self) -> &str {
        &self.options.client_id
    }

    /// Address of the node currently connected.
    pub fn addr(&self) -> &str {
        self.connection.addr()
    }

    /// Last ring received.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Store a value.
    pub async fn put(&mut self, key: &str, value: &str) -> Result<KvMessage> {
        self.execute(StatusType::Put, key, Some(value.to_string())).await
    }

    /// Delete a key, a PUT without a value.
    pub async fn delete(&mut self, key: &str) -> Result<KvMessage> {
        self.execute(StatusType::Put, key, None).await
    }

    pub async fn get(&mut self, key: &str) -> Result<KvMessage> {
        self.execute(StatusType::Get, key, None).await
    }

    /// Receive NOTIFY messages for changes to `key` on this connection.
    pub async fn subscribe(&mut self, key: &str) -> Result<KvMessage> {
        self.execute(StatusType::Subscribe, key, None).await
    }

    pub async fn unsubscribe(&mut self, key: &str) -> Result<KvMessage> {
        self.execute(StatusType::Unsubscribe, key, None).await
    }

    /// Ask the connected node for its ring.
    pub async fn metadata(&mut self) -> Result<Ring> {
        let request_id = Uuid::new_v4();
        self.connection
            .send(Message::MetadataUpdate(MetadataUpdate {
                ring: None,
                request_id,
            }))
            .await?;
        loop {
            match self.connection.recv().await? {
                Message::MetadataUpdate(MetadataUpdate {
                    ring: Some(ring),
                    request_id: id,
                }) if id == request_id => {
                    self.ring = ring.clone();
                    return Ok(ring);
                }
                other => self.buffer(other)?,
            }
        }
    }

    /// Build a signed request without sending it.
    pub fn signed_request(&self, status: StatusType, key: &str, value: Option<String>) -> KvMessage {
        let mut msg = KvMessage::request(status, key, value, self.options.client_id.clone());
        self.options.signer.sign(&mut msg);
        msg
    }

    /// Send a prepared request on the current connection and wait for its
    /// response. No routing or retry.
    pub async fn send_request(&mut self, msg: KvMessage) -> Result<KvMessage> {
        let request_id = msg.request_id;
        self.connection.send(Message::Kv(msg)).await?;
        loop {
            match self.connection.recv().await? {
                Message::Kv(reply) if reply.request_id == request_id => return Ok(reply),
                other => self.buffer(other)?,
            }
        }
    }

    /// Wait for the next NOTIFY, up to `timeout`.
    pub async fn next_notification(&mut self, timeout: Duration) -> Result<KvMessage> {
        if let Some(notice) = self.notifications.pop_front() {
            return Ok(notice);
        }
        tokio::time::timeout(timeout, async {
            loop {
                match self.connection.recv().await? {
                    Message::Kv(msg) if msg.status == StatusType::Notify => return Ok(msg),
                    other => debug!(message = ?other, "Dropping unsolicited message"),
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Reconnect to another node.
    pub async fn reconnect(&mut self, addr: &str) -> Result<()> {
        self.connection = Self::open(addr, &self.options).await?;
        Ok(())
    }

    async fn execute(
        &mut self,
        status: StatusType,
        key: &str,
        value: Option<String>,
    ) -> Result<KvMessage> {
        let reply = self
            .send_request(self.signed_request(status, key, value.clone()))
            .await?;
        if reply.status != StatusType::NotResponsible {
            return Ok(reply);
        }
        let Some(ring) = reply.metadata.clone() else {
            return Ok(reply);
        };
        self.ring = ring;

        let Some(owner) = self.ring.owner_of(key).map(|n| n.addr()) else {
            return Ok(reply);
        };
        if owner == self.connection.addr() {
            return Ok(reply);
        }
        debug!(key, %owner, "Routing to key owner");
        self.reconnect(&owner).await?;
        self.send_request(self.signed_request(status, key, value))
            .await
    }

    fn buffer(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::Kv(notice) if notice.status == StatusType::Notify => {
                self.notifications.push_back(notice);
                Ok(())
            }
            other => Err(Error::Protocol(format!("unexpected message {:?}", other))),
        }
    }
}
