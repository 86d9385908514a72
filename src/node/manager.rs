//! Request engine of a storage node.
//!
//! The manager sits between the connection handler and the disk: it checks
//! ring ownership, consults the cache, applies writes to the right partition
//! and keeps the cache coherent with disk. Every mutating entry point runs
//! under one lock, so a write and its cache update are never interleaved with
//! another write. Reads do not take the lock.
//!
//! All methods block on file I/O and are meant to run on a blocking thread.

use crate::cache::KvCache;
use crate::error::Result;
use crate::network::rpc::{DataTransfer, KvMessage, StatusType, TransferKind};
use crate::node::context::NodeContext;
use crate::node::subscribers::SubscriberRegistry;
use crate::storage::{chunk_records, DiskStorage, Lookup, Record};
use crate::types::{HashRange, Partition, KeyHash, MAX_KEY_BYTES, MAX_VALUE_BYTES};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key-value engine of one node.
#[derive(Debug)]
pub struct KvManager {
    ctx: Arc<NodeContext>,
    cache: KvCache,
    storage: DiskStorage,
    subscribers: Arc<SubscriberRegistry>,
    write_enabled: AtomicBool,
    op_lock: Mutex<()>,
}

impl KvManager {
    /// Create a manager over opened storage.
    pub fn new(
        ctx: Arc<NodeContext>,
        storage: DiskStorage,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        let cache = KvCache::new(ctx.config().cache_strategy, ctx.config().cache_size);
        Self {
            ctx,
            cache,
            storage,
            subscribers,
            write_enabled: AtomicBool::new(true),
            op_lock: Mutex::new(()),
        }
    }

    /// Serve a signed client request.
    ///
    /// The signature is checked by storage on writes and by the connection
    /// handler on every request; this method only decides where the request
    /// goes and what it answers.
    pub fn handle_client_request(&self, msg: &KvMessage) -> KvMessage {
        if let Some(reason) = validate(msg) {
            debug!(key_len = msg.key.len(), %reason, "Rejected request");
            return msg.respond(StatusType::Failed).with_error(reason);
        }

        let ring = self.ctx.ring();
        let local = self.ctx.name();
        let is_owner = ring.owner_of(&msg.key).map(|n| n.name == local) == Some(true);

        if msg.status == StatusType::Get {
            let partition = if is_owner {
                Some(Partition::Primary)
            } else {
                ring.replica_slot_for(local, &msg.key)
                    .and_then(Partition::replica_slot)
            };
            return match partition {
                Some(partition) => self.get(msg, partition),
                None => self.not_responsible(msg),
            };
        }

        if !is_owner {
            return self.not_responsible(msg);
        }
        if !self.is_write_enabled() {
            return msg.respond(StatusType::ServerWriteLock);
        }

        let _guard = self.op_lock.lock();
        let outcome = self.storage.write(msg, Partition::Primary);
        match outcome.status {
            StatusType::PutSuccess | StatusType::PutUpdate => {
                if let Some(value) = &msg.value {
                    self.cache.put(msg.key.clone(), value.clone());
                }
            }
            StatusType::DeleteSuccess => self.cache.remove(&msg.key),
            StatusType::AuthFailed => self.ctx.metrics.auth_failures.inc(),
            _ => {}
        }
        if outcome.status.is_write_success() {
            self.ctx.metrics.writes.inc();
        }
        if matches!(outcome.status, StatusType::PutUpdate | StatusType::DeleteSuccess) {
            let mut notice = msg.respond(StatusType::Notify);
            notice.value = msg.value.clone();
            self.subscribers.notify(outcome.subscribers, notice);
        }

        let response = msg.respond(outcome.status);
        match outcome.error {
            Some(error) => response.with_error(error),
            None => response,
        }
    }

    fn get(&self, msg: &KvMessage, partition: Partition) -> KvMessage {
        if partition == Partition::Primary {
            if let Some(value) = self.cache.get(&msg.key) {
                return msg.respond(StatusType::GetSuccess).with_value(value);
            }
        }
        match self.storage.get(&msg.key, partition) {
            Ok(Lookup::Found(record)) => {
                if partition == Partition::Primary {
                    self.cache.put(record.key, record.value.clone());
                }
                msg.respond(StatusType::GetSuccess).with_value(record.value)
            }
            Ok(Lookup::NotFound) => msg.respond(StatusType::GetError),
            Err(e) => {
                warn!(key = %msg.key, %partition, error = %e, "Read failed");
                msg.respond(StatusType::GetError).with_error(e.to_string())
            }
        }
    }

    fn not_responsible(&self, msg: &KvMessage) -> KvMessage {
        self.ctx.metrics.not_responsible.inc();
        msg.respond(StatusType::NotResponsible)
            .with_metadata((*self.ctx.ring()).clone())
    }

    /// Apply a write forwarded by the key's primary.
    ///
    /// The write lands in the replica partition matching the slot this node
    /// holds for the key's owner.
    pub fn handle_server_request(&self, msg: &KvMessage) -> KvMessage {
        if !msg.status.is_write() {
            return msg.respond(StatusType::Failed);
        }
        let Some(partition) = self
            .ctx
            .ring()
            .replica_slot_for(self.ctx.name(), &msg.key)
            .and_then(Partition::replica_slot)
        else {
            return self.not_responsible(msg);
        };

        let _guard = self.op_lock.lock();
        let outcome = self.storage.write(msg, partition);
        self.cache.remove(&msg.key);
        debug!(key = %msg.key, %partition, status = %outcome.status, "Applied replicated write");
        msg.respond(outcome.status)
    }

    /// Serve a bulk transfer and answer SUCCESS or FAILURE.
    ///
    /// The authorization has already been checked by the caller.
    pub fn handle_data_transfer(&self, transfer: &DataTransfer) -> DataTransfer {
        let _guard = self.op_lock.lock();
        let result = match transfer.kind {
            TransferKind::Request => self.insert_transfer(&transfer.payload, transfer.partition),
            TransferKind::MoveReplica1ToReplica2 => self
                .storage
                .move_range(&range_or_all(transfer), Partition::Replica1, Partition::Replica2),
            TransferKind::MoveReplica2ToReplica1 => self
                .storage
                .move_range(&range_or_all(transfer), Partition::Replica2, Partition::Replica1),
            TransferKind::DeleteData => self
                .extract_locked(&range_or_all(transfer), transfer.partition, true)
                .map(|records| records.len()),
            TransferKind::Success | TransferKind::Failure => {
                return transfer.reply(false, Some(format!("unexpected {:?}", transfer.kind)));
            }
        };

        match result {
            Ok(count) => {
                debug!(kind = ?transfer.kind, partition = %transfer.partition, count, "Applied transfer");
                transfer.reply(true, None)
            }
            Err(e) => {
                warn!(kind = ?transfer.kind, partition = %transfer.partition, error = %e, "Transfer failed");
                transfer.reply(false, Some(e.to_string()))
            }
        }
    }

    fn insert_transfer(&self, records: &[Record], partition: Partition) -> Result<usize> {
        self.storage.bulk_insert(records, partition)?;
        for record in records {
            self.cache.remove(&record.key);
        }
        self.ctx.metrics.transfers_in.inc_by(records.len() as u64);
        Ok(records.len())
    }

    fn extract_locked(
        &self,
        range: &HashRange,
        partition: Partition,
        delete: bool,
    ) -> Result<Vec<Record>> {
        let records = self.storage.partition_and_extract(range, partition, delete)?;
        if delete {
            for record in &records {
                self.cache.remove(&record.key);
            }
        }
        Ok(records)
    }

    /// Records of a partition in `range`, removed from it when `delete`.
    pub fn extract_range(
        &self,
        range: &HashRange,
        partition: Partition,
        delete: bool,
    ) -> Result<Vec<Record>> {
        let _guard = self.op_lock.lock();
        self.extract_locked(range, partition, delete)
    }

    /// Put back records that failed to leave, after an aborted move.
    pub fn restore(&self, records: &[Record], partition: Partition) -> Result<()> {
        let _guard = self.op_lock.lock();
        self.storage.bulk_insert(records, partition)?;
        info!(%partition, count = records.len(), "Restored records after failed move");
        Ok(())
    }

    /// A partition's records, split into batches that fit in one frame.
    pub fn replica_chunk(&self, partition: Partition, max_bytes: usize) -> Result<Vec<Vec<Record>>> {
        Ok(chunk_records(self.storage.records(partition)?, max_bytes))
    }

    /// Take over a departed predecessor's range: move it from replica-1 into
    /// primary.
    pub fn merge_replica_into_primary(&self, range: &HashRange) -> Result<usize> {
        let _guard = self.op_lock.lock();
        let moved = self
            .storage
            .move_range(range, Partition::Replica1, Partition::Primary)?;
        info!(node = %self.ctx.name(), %range, moved, "Merged replica into primary");
        Ok(moved)
    }

    /// Allow or refuse client writes.
    pub fn set_write_enabled(&self, enabled: bool) {
        self.write_enabled.store(enabled, Ordering::SeqCst);
        info!(node = %self.ctx.name(), enabled, "Write gate changed");
    }

    /// Whether client writes are allowed.
    pub fn is_write_enabled(&self) -> bool {
        self.write_enabled.load(Ordering::SeqCst)
    }

    /// Drop every cached value.
    pub fn clear_cache(&self) {
        self.cache.purge();
    }

    /// The cache.
    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// The disk storage.
    pub fn storage(&self) -> &DiskStorage {
        &self.storage
    }
}

fn validate(msg: &KvMessage) -> Option<String> {
    if msg.key.is_empty() {
        return Some("empty key".into());
    }
    if msg.key.len() > MAX_KEY_BYTES {
        return Some(format!("key exceeds {} bytes", MAX_KEY_BYTES));
    }
    if msg.value.as_ref().map(|v| v.len() > MAX_VALUE_BYTES) == Some(true) {
        return Some(format!("value exceeds {} bytes", MAX_VALUE_BYTES));
    }
    None
}

/// A transfer without a range covers the whole ring.
fn range_or_all(transfer: &DataTransfer) -> HashRange {
    transfer
        .hash_range
        .unwrap_or(HashRange::new(KeyHash(0), KeyHash(0)))
}
