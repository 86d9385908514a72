//! State shared by every component of one storage node.

use crate::config::NodeConfig;
use crate::error::{AuthError, Result};
use crate::metrics::NodeMetrics;
use crate::network::rpc::{ClusterControl, ControlAction, DataTransfer, TransferKind};
use crate::partitioning::Ring;
use crate::security::{MessageVerifier, ReplayGuard};
use crate::types::{HashRange, Partition, ECS_SENDER_ID};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-node context, built once at start and handed to every component.
#[derive(Debug)]
pub struct NodeContext {
    config: NodeConfig,

    /// Read-only ring mirror, swapped whole on every update.
    ring: RwLock<Arc<Ring>>,

    /// The coordinator-signed UPDATE_METADATA or INIT the ring came from.
    /// Attached to transfers this node starts during reconciliation.
    authorization: RwLock<Option<ClusterControl>>,

    /// Whether client requests are served.
    accepting: AtomicBool,

    client_verifier: MessageVerifier,
    ecs_verifier: MessageVerifier,

    /// Seen tags, shared by storage and control handling.
    pub replay: Arc<ReplayGuard>,

    pub metrics: NodeMetrics,

    /// Cancelled to stop the node.
    pub shutdown: CancellationToken,
}

impl NodeContext {
    /// Build the context. Nodes start with an empty ring, not accepting
    /// clients, until the coordinator says otherwise.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let client_verifier = config.keys.client_verifier()?;
        let ecs_verifier = config.keys.ecs_verifier()?;
        Ok(Self {
            config,
            ring: RwLock::new(Arc::new(Ring::new())),
            authorization: RwLock::new(None),
            accepting: AtomicBool::new(false),
            client_verifier,
            ecs_verifier,
            replay: Arc::new(ReplayGuard::new()),
            metrics: NodeMetrics::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// This node's ring identity.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Current ring mirror.
    pub fn ring(&self) -> Arc<Ring> {
        self.ring.read().clone()
    }

    /// Replace the ring mirror, returning the previous one.
    pub fn install_ring(&self, ring: Ring) -> Arc<Ring> {
        std::mem::replace(&mut *self.ring.write(), Arc::new(ring))
    }

    /// Signed command the current ring came from.
    pub fn authorization(&self) -> Option<ClusterControl> {
        self.authorization.read().clone()
    }

    /// Remember the signed command the current ring came from.
    pub fn set_authorization(&self, control: ClusterControl) {
        *self.authorization.write() = Some(control);
    }

    /// Whether client requests are served.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Start or stop serving client requests.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Verifier for client signatures.
    pub fn client_verifier(&self) -> &MessageVerifier {
        &self.client_verifier
    }

    /// Check that an identity belongs to a storage node.
    pub fn is_node_identity(&self, id: &str) -> bool {
        id == self.name() || self.ring().contains(id)
    }

    /// Authenticate a coordinator command.
    ///
    /// Commands arriving directly are also checked against the seen set.
    /// Commands carried as a transfer's authorization are not, since the same
    /// command legitimately authorizes several transfers.
    pub fn verify_control(
        &self,
        control: &ClusterControl,
        check_replay: bool,
    ) -> std::result::Result<(), AuthError> {
        if control.sender_id != ECS_SENDER_ID {
            return Err(AuthError::UnexpectedSender(control.sender_id.clone()));
        }
        self.ecs_verifier.verify(control)?;
        if check_replay {
            let tag = control.tag.as_deref().ok_or(AuthError::MissingTag)?;
            self.replay.check_and_record(tag)?;
        }
        Ok(())
    }

    /// Decide whether `sender` may apply `transfer` to this node.
    ///
    /// Two commands can authorize a transfer:
    ///
    /// - a MOVE_DATA naming this node as target, for primary records inside
    ///   its range;
    /// - a ring update carrying the ring installed here, or a newer one, for
    ///   the replica copies the sender keeps for its own range under it.
    ///   Primary partitions are never touched this way.
    pub fn authorize_transfer(
        &self,
        sender: Option<&str>,
        transfer: &DataTransfer,
    ) -> std::result::Result<(), AuthError> {
        let sender = sender.ok_or_else(|| AuthError::UnexpectedSender("anonymous".to_string()))?;
        let control = transfer.authorization.as_ref().ok_or(AuthError::MissingTag)?;
        self.verify_control(control, false)?;

        match control.action {
            ControlAction::MoveData => self.authorize_move(control, transfer),
            ControlAction::UpdateMetadata | ControlAction::Init => {
                self.authorize_reconciliation(sender, control, transfer)
            }
            other => Err(AuthError::OutOfScope(format!("{} does not authorize transfers", other))),
        }
    }

    fn authorize_move(
        &self,
        control: &ClusterControl,
        transfer: &DataTransfer,
    ) -> std::result::Result<(), AuthError> {
        let (Some(target), Some(range)) = (&control.target_node, &control.hash_range) else {
            return Err(AuthError::OutOfScope("MOVE_DATA without target or range".to_string()));
        };
        if target.name != self.name() {
            return Err(AuthError::OutOfScope(format!("MOVE_DATA targets {}", target.name)));
        }
        if transfer.kind != TransferKind::Request || transfer.partition != Partition::Primary {
            return Err(AuthError::OutOfScope(format!(
                "MOVE_DATA does not cover {:?} on {}",
                transfer.kind, transfer.partition
            )));
        }
        payload_within(transfer, range)
    }

    fn authorize_reconciliation(
        &self,
        sender: &str,
        control: &ClusterControl,
        transfer: &DataTransfer,
    ) -> std::result::Result<(), AuthError> {
        let ring = control
            .metadata
            .as_ref()
            .ok_or_else(|| AuthError::OutOfScope("ring update without ring".to_string()))?;
        // INIT and the published update carry the same ring under different
        // tags; a sender may also have installed the next ring first.
        if let Some(installed) = self.authorization() {
            let same = installed.tag.is_some() && installed.tag == control.tag;
            let current = *ring == *self.ring();
            if !same && !current && control.timestamp <= installed.timestamp {
                return Err(AuthError::OutOfScope("superseded ring update".to_string()));
            }
        }
        let node = ring
            .node(sender)
            .ok_or_else(|| AuthError::UnexpectedSender(sender.to_string()))?;

        match transfer.kind {
            TransferKind::Request => {
                let slot = match transfer.partition {
                    Partition::Replica1 => 0,
                    Partition::Replica2 => 1,
                    Partition::Primary => {
                        return Err(AuthError::OutOfScope(
                            "primary data moves only under MOVE_DATA".to_string(),
                        ))
                    }
                };
                let holder = ring.replicas_of(sender).and_then(|r| r.get(slot).cloned());
                if holder.map(|h| h.name) != Some(self.name().to_string()) {
                    return Err(AuthError::OutOfScope(format!(
                        "{} is not {}'s {}",
                        self.name(),
                        sender,
                        transfer.partition
                    )));
                }
                payload_within(transfer, &node.range())
            }
            TransferKind::DeleteData
            | TransferKind::MoveReplica1ToReplica2
            | TransferKind::MoveReplica2ToReplica1 => {
                if transfer.partition == Partition::Primary {
                    return Err(AuthError::OutOfScope(
                        "primary data moves only under MOVE_DATA".to_string(),
                    ));
                }
                let range = transfer
                    .hash_range
                    .ok_or_else(|| AuthError::OutOfScope("transfer without range".to_string()))?;
                // A sender also cleans up copies of the range a newcomer
                // just took from it, which is its predecessor's now.
                let managed = ring
                    .predecessor_of(sender)
                    .map(|pred| HashRange::new(pred.lower_range, node.hash))
                    .unwrap_or_else(|| node.range());
                if !managed.covers(&range) {
                    return Err(AuthError::OutOfScope(format!(
                        "{} does not manage {}",
                        sender, range
                    )));
                }
                Ok(())
            }
            TransferKind::Success | TransferKind::Failure => Err(AuthError::OutOfScope(
                format!("{:?} is a reply", transfer.kind),
            )),
        }
    }
}

fn payload_within(transfer: &DataTransfer, range: &HashRange) -> std::result::Result<(), AuthError> {
    match transfer.payload.iter().find(|r| !range.contains(r.hash())) {
        Some(record) => Err(AuthError::OutOfScope(format!(
            "key {} outside {}",
            record.key, range
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::ControlAction;
    use crate::partitioning::RingNode;
    use crate::security::{MessageSigner, Signable};
    use crate::storage::Record;

    fn context() -> NodeContext {
        NodeContext::new(NodeConfig::default()).unwrap()
    }

    #[test]
    fn test_install_ring_returns_previous() {
        let ctx = context();
        let mut ring = Ring::new();
        ring.place(RingNode::new("node-1", "127.0.0.1", 1));
        let old = ctx.install_ring(ring.clone());
        assert!(old.is_empty());
        assert_eq!(*ctx.ring(), ring);
    }

    #[test]
    fn test_control_verification() {
        let ctx = context();
        let ecs = MessageSigner::development_ecs();

        let mut ctrl = ClusterControl::new(ControlAction::Start, ECS_SENDER_ID);
        ecs.sign(&mut ctrl);
        assert!(ctx.verify_control(&ctrl, false).is_ok());
        assert!(ctx.verify_control(&ctrl, true).is_ok());
        assert_eq!(ctx.verify_control(&ctrl, true), Err(AuthError::Replayed));
        assert!(ctx.verify_control(&ctrl, false).is_ok());

        let mut spoofed = ClusterControl::new(ControlAction::Start, "mallory");
        ecs.sign(&mut spoofed);
        assert!(matches!(
            ctx.verify_control(&spoofed, true),
            Err(AuthError::UnexpectedSender(_))
        ));

        let mut client_signed = ClusterControl::new(ControlAction::Stop, ECS_SENDER_ID);
        client_signed.set_tag(MessageSigner::development_client().sign_bytes(&client_signed.signing_payload()));
        assert_eq!(
            ctx.verify_control(&client_signed, true),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_starts_stopped() {
        let ctx = context();
        assert!(!ctx.is_accepting());
        ctx.set_accepting(true);
        assert!(ctx.is_accepting());
    }

    fn three_nodes() -> Ring {
        let mut ring = Ring::new();
        for name in ["node-1", "node-2", "node-3"] {
            ring.place(RingNode::new(name, "127.0.0.1", 1));
        }
        ring
    }

    fn ring_update(ring: &Ring, timestamp: u64) -> ClusterControl {
        let mut ctrl =
            ClusterControl::new(ControlAction::UpdateMetadata, ECS_SENDER_ID).with_metadata(ring.clone());
        ctrl.timestamp = timestamp;
        MessageSigner::development_ecs().sign(&mut ctrl);
        ctrl
    }

    /// Context for `node-1` with a signed three-node ring installed.
    fn installed() -> (NodeContext, Ring, ClusterControl) {
        let ctx = context();
        let ring = three_nodes();
        let ctrl = ring_update(&ring, 1_000);
        ctx.install_ring(ring.clone());
        ctx.set_authorization(ctrl.clone());
        (ctx, ring, ctrl)
    }

    fn record_owned_by(ring: &Ring, owner: &str) -> Record {
        let key = (0..)
            .map(|i| format!("key-{}", i))
            .find(|k| ring.owner_of(k).map(|n| n.name.as_str()) == Some(owner))
            .unwrap();
        Record {
            key,
            value: "v".to_string(),
            client_id: "alice".to_string(),
            request_id: uuid::Uuid::new_v4(),
            tag: "00".to_string(),
            subscribers: Default::default(),
        }
    }

    fn out_of_scope<T: std::fmt::Debug>(result: std::result::Result<T, AuthError>) -> bool {
        matches!(result, Err(AuthError::OutOfScope(_)))
    }

    #[test]
    fn test_installed_ring_update_cannot_wipe_primary() {
        let (ctx, ring, ctrl) = installed();
        let own = ring.node("node-1").unwrap().range();
        let wipe = DataTransfer::new(TransferKind::DeleteData, Partition::Primary)
            .with_range(own)
            .with_authorization(Some(ctrl));

        assert!(out_of_scope(ctx.authorize_transfer(Some("node-2"), &wipe)));
        assert!(out_of_scope(ctx.authorize_transfer(Some("node-3"), &wipe)));
        assert!(matches!(
            ctx.authorize_transfer(Some("alice"), &wipe),
            Err(AuthError::UnexpectedSender(_))
        ));
        assert!(matches!(
            ctx.authorize_transfer(None, &wipe),
            Err(AuthError::UnexpectedSender(_))
        ));
    }

    #[test]
    fn test_ring_update_scopes_replica_transfers_to_sender() {
        let (ctx, ring, ctrl) = installed();
        let pred = ring.replicated_by("node-1").unwrap()[0].clone();
        let other = ring
            .nodes()
            .iter()
            .find(|n| n.name != "node-1" && n.name != pred.name)
            .unwrap()
            .clone();

        let push = |records: Vec<Record>, partition| {
            DataTransfer::new(TransferKind::Request, partition)
                .with_payload(records)
                .with_authorization(Some(ctrl.clone()))
        };
        let mine = push(vec![record_owned_by(&ring, &pred.name)], Partition::Replica1);
        assert!(ctx.authorize_transfer(Some(pred.name.as_str()), &mine).is_ok());
        // node-1 holds the other node's data in replica-2, not replica-1.
        assert!(out_of_scope(ctx.authorize_transfer(Some(other.name.as_str()), &mine)));
        let foreign = push(vec![record_owned_by(&ring, &other.name)], Partition::Replica1);
        assert!(out_of_scope(ctx.authorize_transfer(Some(pred.name.as_str()), &foreign)));
        let primary = push(vec![record_owned_by(&ring, "node-1")], Partition::Primary);
        assert!(out_of_scope(ctx.authorize_transfer(Some(pred.name.as_str()), &primary)));

        let delete_on = |range| {
            DataTransfer::new(TransferKind::DeleteData, Partition::Replica1)
                .with_range(range)
                .with_authorization(Some(ctrl.clone()))
        };
        assert!(ctx.authorize_transfer(Some(pred.name.as_str()), &delete_on(pred.range())).is_ok());
        let not_theirs = delete_on(ring.node("node-1").unwrap().range());
        assert!(out_of_scope(ctx.authorize_transfer(Some(pred.name.as_str()), &not_theirs)));
        let unbounded = DataTransfer::new(TransferKind::MoveReplica1ToReplica2, Partition::Replica1)
            .with_authorization(Some(ctrl.clone()));
        assert!(out_of_scope(ctx.authorize_transfer(Some(pred.name.as_str()), &unbounded)));
    }

    #[test]
    fn test_superseded_ring_update_rejected() {
        let (ctx, ring, ctrl) = installed();
        let pred = ring.replicated_by("node-1").unwrap()[0].clone();
        let transfer = |auth: ClusterControl| {
            DataTransfer::new(TransferKind::DeleteData, Partition::Replica1)
                .with_range(pred.range())
                .with_authorization(Some(auth))
        };

        let mut previous = ring.clone();
        previous.remove("node-1");
        let older = ring_update(&previous, ctrl.timestamp - 1);
        assert!(out_of_scope(ctx.authorize_transfer(Some(pred.name.as_str()), &transfer(older))));

        // A joining node installs INIT while its peers hold the published
        // update for the same ring.
        let mut init = ClusterControl::new(ControlAction::Init, ECS_SENDER_ID).with_metadata(ring.clone());
        init.timestamp = ctrl.timestamp - 1;
        MessageSigner::development_ecs().sign(&mut init);
        assert!(ctx.authorize_transfer(Some(pred.name.as_str()), &transfer(init)).is_ok());

        // The sender may have installed the next ring before this node.
        let newer = ring_update(&ring, ctrl.timestamp + 1);
        assert!(ctx.authorize_transfer(Some(pred.name.as_str()), &transfer(newer)).is_ok());

        let mut start = ClusterControl::new(ControlAction::Start, ECS_SENDER_ID);
        MessageSigner::development_ecs().sign(&mut start);
        assert!(out_of_scope(ctx.authorize_transfer(Some(pred.name.as_str()), &transfer(start))));

        let mut forged = ring_update(&ring, ctrl.timestamp + 2);
        forged.metadata = Some(Ring::new());
        assert_eq!(
            ctx.authorize_transfer(Some(pred.name.as_str()), &transfer(forged)),
            Err(AuthError::BadSignature)
        );
    }

    #[test]
    fn test_move_data_covers_only_its_target_and_range() {
        let (ctx, ring, _) = installed();
        let me = ring.node("node-1").unwrap().clone();
        let mut handoff = ClusterControl::new(ControlAction::MoveData, ECS_SENDER_ID)
            .with_move(me.clone(), me.range());
        MessageSigner::development_ecs().sign(&mut handoff);

        let inbound = |record: Record, kind, partition| {
            DataTransfer::new(kind, partition)
                .with_payload(vec![record])
                .with_authorization(Some(handoff.clone()))
        };
        let ok = inbound(record_owned_by(&ring, "node-1"), TransferKind::Request, Partition::Primary);
        assert!(ctx.authorize_transfer(Some("node-2"), &ok).is_ok());
        let outside = inbound(record_owned_by(&ring, "node-2"), TransferKind::Request, Partition::Primary);
        assert!(out_of_scope(ctx.authorize_transfer(Some("node-2"), &outside)));
        let delete = inbound(record_owned_by(&ring, "node-1"), TransferKind::DeleteData, Partition::Primary);
        assert!(out_of_scope(ctx.authorize_transfer(Some("node-2"), &delete)));

        let mut elsewhere = ClusterControl::new(ControlAction::MoveData, ECS_SENDER_ID)
            .with_move(ring.node("node-2").unwrap().clone(), me.range());
        MessageSigner::development_ecs().sign(&mut elsewhere);
        let misrouted = DataTransfer::new(TransferKind::Request, Partition::Primary)
            .with_payload(vec![record_owned_by(&ring, "node-1")])
            .with_authorization(Some(elsewhere));
        assert!(out_of_scope(ctx.authorize_transfer(Some("node-2"), &misrouted)));
    }
}
