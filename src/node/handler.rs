//! Connection handler of a storage node.
//!
//! Classifies every incoming frame and authenticates it by kind before it
//! reaches the engine:
//!
//! | kind             | accepted when                                           |
//! |------------------|---------------------------------------------------------|
//! | key-value        | peer identified, client signature valid, not a node id  |
//! | metadata request | always                                                  |
//! | replication      | peer is the key's primary; storage checks the signature |
//! | control          | coordinator signature, sender `ecs`, tag never seen     |
//! | data transfer    | a coordinator command scoped to sender, range, target   |

use crate::error::{AuthError, Error, Result};
use crate::network::client::Connection;
use crate::network::rpc::{
    ActionStatus, ClusterControl, ControlAction, DataTransfer, Identification, KvMessage, Message,
    MetadataUpdate, StatusType, TransferKind,
};
use crate::network::server::{MessageHandler, Reply, Session};
use crate::node::{blocking, NodeContext, NodeServices};
use crate::partitioning::RingNode;
use crate::storage::{chunk_records, Record};
use crate::types::{Partition, ECS_SENDER_ID};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handles node traffic for one [`NodeServices`].
#[derive(Debug, Clone)]
pub struct NodeHandler {
    services: Arc<NodeServices>,
}

impl NodeHandler {
    pub fn new(services: Arc<NodeServices>) -> Self {
        Self { services }
    }

    fn on_identification(&self, session: &mut Session, ident: Identification) -> Reply {
        let ctx = &self.services.ctx;
        let id = ident.client_id.clone();
        if id != ECS_SENDER_ID && !ctx.is_node_identity(&id) {
            self.services
                .subscribers
                .register(&id, session.conn_id, session.outbound());
        }
        debug!(node = %ctx.name(), peer = %session.peer, client = %id, "Peer identified");
        session.client_id = Some(id);
        Reply::Send(Message::Identification(ident))
    }

    async fn on_client_request(&self, session: &Session, msg: KvMessage) -> KvMessage {
        let ctx = &self.services.ctx;
        let Some(identity) = session.client_id.as_deref() else {
            return msg
                .respond(StatusType::Failed)
                .with_error("identification required");
        };
        ctx.metrics.requests.inc();

        if !msg.status.is_request() {
            return msg
                .respond(StatusType::Failed)
                .with_error(format!("{} is not a request", msg.status));
        }
        if !ctx.is_accepting() {
            return msg.respond(StatusType::ServerStopped);
        }
        if msg.client_id != identity || ctx.is_node_identity(identity) {
            ctx.metrics.auth_failures.inc();
            warn!(node = %ctx.name(), claimed = %msg.client_id, identity, "Client identity mismatch");
            return msg.respond(StatusType::AuthFailed);
        }
        if let Err(e) = ctx.client_verifier().verify(&msg) {
            ctx.metrics.auth_failures.inc();
            warn!(node = %ctx.name(), client = %msg.client_id, error = %e, "Rejected client request");
            return msg.respond(StatusType::AuthFailed).with_error(e.to_string());
        }

        let manager = self.services.manager.clone();
        let request = msg.clone();
        let response = match blocking(move || Ok(manager.handle_client_request(&request))).await {
            Ok(response) => response,
            Err(e) => return msg.respond(StatusType::Failed).with_error(e.to_string()),
        };

        if msg.status.is_write() && response.status.is_write_success() {
            self.services.replication.enqueue(msg);
        }
        response
    }

    async fn on_replication(&self, session: &Session, msg: KvMessage) -> KvMessage {
        let ctx = &self.services.ctx;
        if !msg.status.is_write() {
            return msg.respond(StatusType::Failed);
        }
        if let Err(e) = authorize_replication(ctx, session.client_id.as_deref(), &msg) {
            ctx.metrics.auth_failures.inc();
            warn!(node = %ctx.name(), key = %msg.key, error = %e, "Rejected replicated write");
            return msg.respond(StatusType::AuthFailed).with_error(e.to_string());
        }
        let manager = self.services.manager.clone();
        let request = msg.clone();
        match blocking(move || Ok(manager.handle_server_request(&request))).await {
            Ok(response) => response,
            Err(e) => msg.respond(StatusType::Failed).with_error(e.to_string()),
        }
    }

    async fn on_control(&self, ctrl: ClusterControl) -> Reply {
        let ctx = &self.services.ctx;
        if let Err(e) = ctx.verify_control(&ctrl, true) {
            ctx.metrics.auth_failures.inc();
            warn!(node = %ctx.name(), action = %ctrl.action, error = %e, "Rejected control message");
            return Reply::Send(Message::Control(ctrl.acknowledge(ActionStatus::Failure)));
        }
        info!(node = %ctx.name(), action = %ctrl.action, "Control command");

        let status = match ctrl.action {
            ControlAction::Init => {
                ctx.set_accepting(false);
                self.spawn_install(ctrl.clone())
            }
            ControlAction::UpdateMetadata => self.spawn_install(ctrl.clone()),
            ControlAction::Start => {
                ctx.set_accepting(true);
                ActionStatus::Success
            }
            ControlAction::Stop => {
                ctx.set_accepting(false);
                ActionStatus::Success
            }
            ControlAction::LockWrite => {
                self.services.manager.set_write_enabled(false);
                ActionStatus::Success
            }
            ControlAction::UnlockWrite => {
                self.services.manager.set_write_enabled(true);
                ActionStatus::Success
            }
            ControlAction::MoveData => self.move_data(&ctrl).await,
            ControlAction::Shutdown => {
                ctx.set_accepting(false);
                return Reply::SendAndShutdown(Message::Control(
                    ctrl.acknowledge(ActionStatus::Success),
                ));
            }
        };
        Reply::Send(Message::Control(ctrl.acknowledge(status)))
    }

    fn spawn_install(&self, ctrl: ClusterControl) -> ActionStatus {
        if ctrl.metadata.is_none() {
            return ActionStatus::Failure;
        }
        let services = self.services.clone();
        tokio::spawn(async move { services.install_metadata(ctrl).await });
        ActionStatus::Success
    }

    /// Hand a range of primary data to another node.
    ///
    /// The records leave the local partition before sending; if any part of
    /// the send fails they are put back.
    async fn move_data(&self, ctrl: &ClusterControl) -> ActionStatus {
        let ctx = &self.services.ctx;
        let (Some(target), Some(range)) = (ctrl.target_node.clone(), ctrl.hash_range) else {
            warn!(node = %ctx.name(), "MOVE_DATA without target or range");
            return ActionStatus::Failure;
        };

        let manager = self.services.manager.clone();
        let records =
            match blocking(move || manager.extract_range(&range, Partition::Primary, true)).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(node = %ctx.name(), error = %e, "Failed to extract range");
                    return ActionStatus::Failure;
                }
            };
        if records.is_empty() {
            debug!(node = %ctx.name(), %range, target = %target.name, "Nothing to move");
            return ActionStatus::Success;
        }

        let count = records.len();
        match self.send_records(&target, records.clone(), ctrl).await {
            Ok(()) => {
                ctx.metrics.transfers_out.inc_by(count as u64);
                info!(node = %ctx.name(), target = %target.name, %range, count, "Moved data");
                ActionStatus::Success
            }
            Err(e) => {
                warn!(node = %ctx.name(), target = %target.name, error = %e, "Move failed, restoring records");
                let manager = self.services.manager.clone();
                if let Err(e) =
                    blocking(move || manager.restore(&records, Partition::Primary)).await
                {
                    warn!(node = %ctx.name(), error = %e, "Failed to restore records");
                }
                ActionStatus::Failure
            }
        }
    }

    async fn send_records(
        &self,
        target: &RingNode,
        records: Vec<Record>,
        ctrl: &ClusterControl,
    ) -> Result<()> {
        let ctx = &self.services.ctx;
        let config = ctx.config();
        let mut conn =
            Connection::connect(&target.addr(), config.connect_timeout, config.request_timeout)
                .await?;
        conn.identify(ctx.name()).await?;

        for chunk in chunk_records(records, config.max_frame_bytes / 2) {
            let transfer = DataTransfer::new(TransferKind::Request, Partition::Primary)
                .with_payload(chunk)
                .with_authorization(Some(ctrl.clone()));
            match conn.request(Message::DataTransfer(transfer)).await? {
                Message::DataTransfer(reply) if reply.kind == TransferKind::Success => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "transfer to {} not accepted: {:?}",
                        target.name, other
                    )))
                }
            }
        }
        Ok(())
    }

    async fn on_transfer(&self, session: &Session, transfer: DataTransfer) -> DataTransfer {
        let ctx = &self.services.ctx;
        let sender = session.client_id.as_deref();
        if let Err(e) = ctx.authorize_transfer(sender, &transfer) {
            ctx.metrics.auth_failures.inc();
            warn!(node = %ctx.name(), sender = ?sender, kind = ?transfer.kind, error = %e, "Rejected data transfer");
            return transfer.reply(false, Some(format!("{}: {}", StatusType::AuthFailed, e)));
        }

        let manager = self.services.manager.clone();
        let request = transfer.clone();
        let reply = match blocking(move || Ok(manager.handle_data_transfer(&request))).await {
            Ok(reply) => reply,
            Err(e) => return transfer.reply(false, Some(e.to_string())),
        };

        if reply.kind == TransferKind::Success
            && transfer.kind == TransferKind::Request
            && transfer.partition == Partition::Primary
        {
            let replication = self.services.replication.clone();
            tokio::spawn(async move { replication.replicate_records(transfer.payload).await });
        }
        reply
    }
}

/// Only the key's primary forwards writes to its replicas.
fn authorize_replication(
    ctx: &NodeContext,
    sender: Option<&str>,
    msg: &KvMessage,
) -> std::result::Result<(), AuthError> {
    let sender = sender.ok_or_else(|| AuthError::UnexpectedSender("anonymous".to_string()))?;
    if sender == ctx.name() || !ctx.is_node_identity(sender) {
        return Err(AuthError::UnexpectedSender(sender.to_string()));
    }
    match ctx.ring().owner_of(&msg.key) {
        Some(owner) if owner.name == sender => Ok(()),
        _ => Err(AuthError::UnexpectedSender(format!(
            "{} is not the primary of {}",
            sender, msg.key
        ))),
    }
}

#[async_trait]
impl MessageHandler for NodeHandler {
    async fn handle(&self, session: &mut Session, msg: Message) -> Reply {
        match msg {
            Message::Identification(ident) => self.on_identification(session, ident),
            Message::Kv(msg) => Reply::Send(Message::Kv(self.on_client_request(session, msg).await)),
            Message::MetadataUpdate(req) => Reply::Send(Message::MetadataUpdate(MetadataUpdate {
                ring: Some((*self.services.ctx.ring()).clone()),
                request_id: req.request_id,
            })),
            Message::Replication(envelope) => Reply::Send(Message::Kv(
                self.on_replication(session, envelope.message).await,
            )),
            Message::Control(ctrl) => self.on_control(ctrl).await,
            Message::DataTransfer(transfer) => {
                Reply::Send(Message::DataTransfer(self.on_transfer(session, transfer).await))
            }
        }
    }

    fn on_connect(&self, _session: &Session) {
        self.services.ctx.metrics.active_connections.inc();
    }

    fn on_disconnect(&self, session: &Session) {
        self.services.ctx.metrics.active_connections.dec();
        if let Some(id) = &session.client_id {
            self.services.subscribers.unregister(id, session.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::partitioning::Ring;
    use crate::security::MessageSigner;
    use std::net::SocketAddr;

    fn context_with_ring() -> (NodeContext, Ring) {
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let ctx = NodeContext::new(NodeConfig::new("node-1", addr)).unwrap();
        let mut ring = Ring::new();
        for name in ["node-1", "node-2", "node-3"] {
            ring.place(RingNode::new(name, "127.0.0.1", 1));
        }
        ctx.install_ring(ring.clone());
        (ctx, ring)
    }

    fn signed_put(ring: &Ring, owner: &str) -> KvMessage {
        let key = (0..)
            .map(|i| format!("key-{}", i))
            .find(|k| ring.owner_of(k).map(|n| n.name.as_str()) == Some(owner))
            .unwrap();
        let mut msg = KvMessage::request(StatusType::Put, key, Some("v".into()), "alice");
        MessageSigner::development_client().sign(&mut msg);
        msg
    }

    #[test]
    fn test_replicated_write_accepted_from_primary_only() {
        let (ctx, ring) = context_with_ring();
        let pred = ring.replicated_by("node-1").unwrap()[0].name.clone();
        let msg = signed_put(&ring, &pred);

        assert!(authorize_replication(&ctx, Some(pred.as_str()), &msg).is_ok());
        assert!(authorize_replication(&ctx, Some("alice"), &msg).is_err());
        assert!(authorize_replication(&ctx, None, &msg).is_err());

        let other = ring
            .names()
            .into_iter()
            .find(|n| n != "node-1" && *n != pred)
            .unwrap();
        assert!(authorize_replication(&ctx, Some(other.as_str()), &msg).is_err());
        assert!(authorize_replication(&ctx, Some("node-1"), &msg).is_err());
    }
}
