//! Replica forwarding and reconciliation execution.
//!
//! ```text
//!   handler ──enqueue──► [queue] ──► consumer ──Replication──► replica-1
//!                                       │                  └─► replica-2
//!                                  gate (read)
//!                                       │
//!   new metadata ──► reconcile ── gate (write) ── plan ──► DataTransfer...
//! ```
//!
//! Reconciliation holds the gate exclusively, so no forwarded write can
//! interleave with a partition being relabeled or pushed.

use crate::error::{Error, Result};
use crate::network::client::PeerPool;
use crate::network::rpc::{DataTransfer, KvMessage, Message, ReplicationEnvelope, TransferKind};
use crate::node::context::NodeContext;
use crate::node::manager::KvManager;
use crate::node::blocking;
use crate::partitioning::{Ring, RingNode};
use crate::replication::plan::{plan_reconciliation, ReplicaAction};
use crate::storage::{chunk_records, Record};
use crate::types::Partition;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Forwards accepted writes to replicas and repairs replica placement after
/// ring changes.
#[derive(Debug)]
pub struct ReplicationService {
    ctx: Arc<NodeContext>,
    manager: Arc<KvManager>,
    peers: PeerPool,
    queue: mpsc::UnboundedSender<KvMessage>,
    gate: RwLock<()>,
    reconcile_lock: Mutex<()>,
}

impl ReplicationService {
    /// Create the service and spawn its queue consumer.
    pub fn start(ctx: Arc<NodeContext>, manager: Arc<KvManager>) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let peers = PeerPool::new(
            ctx.name(),
            ctx.config().connect_timeout,
            ctx.config().request_timeout,
        );
        let service = Arc::new(Self {
            ctx,
            manager,
            peers,
            queue,
            gate: RwLock::new(()),
            reconcile_lock: Mutex::new(()),
        });
        tokio::spawn(service.clone().consume(rx));
        service
    }

    /// Queue an applied client write for forwarding.
    pub fn enqueue(&self, msg: KvMessage) {
        if self.queue.send(msg).is_err() {
            debug!(node = %self.ctx.name(), "Replication queue closed, dropping write");
        }
    }

    async fn consume(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<KvMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let _gate = self.gate.read().await;
            self.forward(msg).await;
        }
        debug!(node = %self.ctx.name(), "Replication consumer stopped");
    }

    async fn forward(&self, msg: KvMessage) {
        let replicas = self
            .ctx
            .ring()
            .replicas_of(self.ctx.name())
            .unwrap_or_default();

        for replica in replicas {
            let addr = replica.addr();
            let envelope = Message::Replication(ReplicationEnvelope {
                message: msg.clone(),
            });
            match self.peers.request(&addr, envelope).await {
                Ok(Message::Kv(resp)) if resp.status.is_write_success() => {
                    self.ctx.metrics.replicated_writes.inc();
                }
                Ok(Message::Kv(resp)) => {
                    debug!(replica = %replica.name, key = %msg.key, status = %resp.status, "Replica did not apply write");
                }
                Ok(other) => {
                    warn!(replica = %replica.name, reply = ?other, "Unexpected replication reply");
                    self.ctx.metrics.replication_failures.inc();
                }
                Err(e) => {
                    warn!(replica = %replica.name, key = %msg.key, error = %e, "Replication failed");
                    self.ctx.metrics.replication_failures.inc();
                    self.peers.evict(&addr);
                }
            }
        }
    }

    /// Copy records that just arrived in the primary partition to the
    /// current replicas.
    pub async fn replicate_records(&self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let _gate = self.gate.read().await;
        let replicas = self
            .ctx
            .ring()
            .replicas_of(self.ctx.name())
            .unwrap_or_default();
        for (slot, replica) in replicas.iter().enumerate() {
            let Some(partition) = Partition::replica_slot(slot) else {
                continue;
            };
            if let Err(e) = self.send_records(replica, partition, records.clone()).await {
                warn!(replica = %replica.name, %partition, error = %e, "Failed to replicate transferred records");
                self.ctx.metrics.replication_failures.inc();
            }
        }
    }

    /// Bring replica placement in line with a new ring.
    pub async fn reconcile(&self, old: &Ring, new: &Ring) {
        let plan = plan_reconciliation(self.ctx.name(), old, new);
        if plan.is_empty() {
            return;
        }

        let _exclusive = self.reconcile_lock.lock().await;
        let _gate = self.gate.write().await;
        info!(
            node = %self.ctx.name(),
            actions = plan.actions.len(),
            wait_for_data = plan.wait_for_data,
            "Reconciling replicas"
        );

        if plan.wait_for_data {
            tokio::time::sleep(self.ctx.config().replication.join_grace).await;
        }
        for action in &plan.actions {
            if let Err(e) = self.execute(action).await {
                warn!(node = %self.ctx.name(), action = ?action, error = %e, "Reconciliation step failed");
                self.ctx.metrics.replication_failures.inc();
            }
        }
    }

    async fn execute(&self, action: &ReplicaAction) -> Result<()> {
        match action {
            ReplicaAction::PushPrimary {
                to,
                partition,
                range,
            } => {
                let manager = self.manager.clone();
                let range = *range;
                let records =
                    blocking(move || manager.extract_range(&range, Partition::Primary, false))
                        .await?;
                self.send_records(to, *partition, records).await
            }
            ReplicaAction::DeleteRange {
                on,
                range,
                partition,
            } => {
                let transfer =
                    DataTransfer::new(TransferKind::DeleteData, *partition).with_range(*range);
                self.transfer(on, transfer).await
            }
            ReplicaAction::Relabel { on, range, kind } => {
                let source = match kind {
                    TransferKind::MoveReplica1ToReplica2 => Partition::Replica1,
                    _ => Partition::Replica2,
                };
                let transfer = DataTransfer::new(*kind, source).with_range(*range);
                self.transfer(on, transfer).await
            }
            ReplicaAction::MergeIntoPrimary { range } => {
                let manager = self.manager.clone();
                let range = *range;
                blocking(move || manager.merge_replica_into_primary(&range)).await?;
                Ok(())
            }
        }
    }

    async fn send_records(
        &self,
        to: &RingNode,
        partition: Partition,
        records: Vec<Record>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let count = records.len() as u64;
        for chunk in chunk_records(records, self.ctx.config().max_frame_bytes / 2) {
            let transfer = DataTransfer::new(TransferKind::Request, partition).with_payload(chunk);
            self.transfer(to, transfer).await?;
        }
        self.ctx.metrics.transfers_out.inc_by(count);
        debug!(to = %to.name, %partition, count, "Pushed records");
        Ok(())
    }

    async fn transfer(&self, to: &RingNode, transfer: DataTransfer) -> Result<()> {
        let addr = to.addr();
        let transfer = transfer.with_authorization(self.ctx.authorization());
        let reply = self
            .peers
            .request(&addr, Message::DataTransfer(transfer))
            .await
            .inspect_err(|_| self.peers.evict(&addr))?;
        match reply {
            Message::DataTransfer(reply) if reply.kind == TransferKind::Success => Ok(()),
            Message::DataTransfer(reply) => Err(Error::Protocol(format!(
                "transfer rejected by {}: {}",
                to.name,
                reply.message.unwrap_or_default()
            ))),
            other => Err(Error::Protocol(format!(
                "unexpected transfer reply from {}: {:?}",
                to.name, other
            ))),
        }
    }
}
