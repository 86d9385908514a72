//! Line-oriented record files, rewritten whole on every mutation.
//!
//! Each partition is a JSON-lines file. A mutation reads the file, writes the
//! new content to a temporary sibling, syncs it and renames it over the
//! original, so a crash leaves either the old or the new file and never a mix.
//! All mutations on a node share one lock; readers never take it and rely on
//! the rename being atomic.

use crate::error::{AuthError, Result, StorageError};
use crate::network::rpc::{KvMessage, StatusType};
use crate::security::{MessageVerifier, ReplayGuard};
use crate::storage::Record;
use crate::types::{HashRange, Partition};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a point lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Record),
    NotFound,
}

/// Result of a key-value write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Response status for the request.
    pub status: StatusType,

    /// Subscribers of the record before the write, for notification.
    pub subscribers: BTreeSet<String>,

    /// Failure detail, if any.
    pub error: Option<String>,
}

impl WriteOutcome {
    fn new(status: StatusType) -> Self {
        Self {
            status,
            subscribers: BTreeSet::new(),
            error: None,
        }
    }

    fn failed(status: StatusType, error: impl ToString) -> Self {
        Self {
            status,
            subscribers: BTreeSet::new(),
            error: Some(error.to_string()),
        }
    }
}

/// The three partitions of one node.
#[derive(Debug)]
pub struct DiskStorage {
    root: PathBuf,
    verifier: MessageVerifier,
    replay: Arc<ReplayGuard>,
    write_lock: Mutex<()>,
}

impl DiskStorage {
    /// Open (creating if needed) the partitions under `root`.
    pub fn open(
        root: impl Into<PathBuf>,
        verifier: MessageVerifier,
        replay: Arc<ReplayGuard>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(StorageError::Io)?;
        let storage = Self {
            root,
            verifier,
            replay,
            write_lock: Mutex::new(()),
        };
        for partition in Partition::ALL {
            let path = storage.path(partition);
            if !path.exists() {
                File::create(&path).map_err(StorageError::Io)?;
            }
        }
        debug!(root = %storage.root.display(), "Opened disk storage");
        Ok(storage)
    }

    /// Directory holding the partition files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, partition: Partition) -> PathBuf {
        self.root.join(format!("{}.jsonl", partition.file_stem()))
    }

    fn load(&self, partition: Partition) -> Result<Vec<Record>> {
        let path = self.path(partition);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e).into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    StorageError::Corrupt {
                        file: path.display().to_string(),
                        reason: e.to_string(),
                    }
                    .into()
                })
            })
            .collect()
    }

    fn store(&self, partition: Partition, records: &[Record]) -> Result<()> {
        let path = self.path(partition);
        let tmp = path.with_extension("jsonl.tmp");

        let write = || -> std::io::Result<()> {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
            fs::rename(&tmp, &path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StorageError::Io(e).into()
        })
    }

    /// Look up a key.
    pub fn get(&self, key: &str, partition: Partition) -> Result<Lookup> {
        Ok(self
            .load(partition)?
            .into_iter()
            .find(|r| r.key == key)
            .map_or(Lookup::NotFound, Lookup::Found))
    }

    fn authenticate(&self, msg: &KvMessage) -> std::result::Result<(), AuthError> {
        self.verifier.verify(msg)?;
        let tag = msg.tag.as_deref().ok_or(AuthError::MissingTag)?;
        self.replay.check_and_record(tag)
    }

    /// Apply a signed PUT, delete, SUBSCRIBE or UNSUBSCRIBE.
    ///
    /// The tag is verified and recorded as seen before anything is touched;
    /// a bad or replayed tag yields AUTH_FAILED and no mutation.
    pub fn write(&self, msg: &KvMessage, partition: Partition) -> WriteOutcome {
        let error_status = match msg.status {
            StatusType::Put if msg.value.is_some() => StatusType::PutError,
            StatusType::Put => StatusType::DeleteError,
            StatusType::Subscribe => StatusType::SubscribeError,
            StatusType::Unsubscribe => StatusType::UnsubscribeError,
            other => {
                return WriteOutcome::failed(StatusType::Failed, format!("not a write: {}", other))
            }
        };

        if let Err(e) = self.authenticate(msg) {
            warn!(key = %msg.key, client = %msg.client_id, error = %e, "Rejected write");
            return WriteOutcome::failed(StatusType::AuthFailed, e);
        }

        let _guard = self.write_lock.lock();
        match self.apply(msg, partition) {
            Ok(outcome) => {
                debug!(key = %msg.key, %partition, status = %outcome.status, "Applied write");
                outcome
            }
            Err(e) => {
                warn!(key = %msg.key, %partition, error = %e, "Write failed");
                WriteOutcome::failed(error_status, e)
            }
        }
    }

    fn apply(&self, msg: &KvMessage, partition: Partition) -> Result<WriteOutcome> {
        let mut records = self.load(partition)?;
        let existing = records.iter().position(|r| r.key == msg.key);

        let outcome = match (msg.status, existing) {
            (StatusType::Put, Some(idx)) if msg.value.is_some() => {
                let subscribers = records[idx].subscribers.clone();
                records[idx].apply_put(msg);
                WriteOutcome {
                    subscribers,
                    ..WriteOutcome::new(StatusType::PutUpdate)
                }
            }
            (StatusType::Put, None) if msg.value.is_some() => {
                let record = Record::from_put(msg)
                    .ok_or_else(|| StorageError::Unverified(msg.key.clone()))?;
                records.push(record);
                WriteOutcome::new(StatusType::PutSuccess)
            }
            (StatusType::Put, Some(idx)) => {
                let removed = records.remove(idx);
                WriteOutcome {
                    subscribers: removed.subscribers,
                    ..WriteOutcome::new(StatusType::DeleteSuccess)
                }
            }
            (StatusType::Put, None) => return Ok(WriteOutcome::new(StatusType::DeleteError)),
            (StatusType::Subscribe, Some(idx)) => {
                records[idx].subscribers.insert(msg.client_id.clone());
                WriteOutcome::new(StatusType::SubscribeSuccess)
            }
            (StatusType::Subscribe, None) => {
                return Ok(WriteOutcome::new(StatusType::SubscribeError))
            }
            (StatusType::Unsubscribe, Some(idx)) => {
                records[idx].subscribers.remove(&msg.client_id);
                WriteOutcome::new(StatusType::UnsubscribeSuccess)
            }
            (StatusType::Unsubscribe, None) => {
                return Ok(WriteOutcome::new(StatusType::UnsubscribeError))
            }
            _ => return Ok(WriteOutcome::new(StatusType::Failed)),
        };

        self.store(partition, &records)?;
        Ok(outcome)
    }

    /// Collect every record whose key hashes into `range`, optionally
    /// removing them from the partition in the same pass.
    pub fn partition_and_extract(
        &self,
        range: &HashRange,
        partition: Partition,
        delete: bool,
    ) -> Result<Vec<Record>> {
        if !delete {
            return Ok(self
                .load(partition)?
                .into_iter()
                .filter(|r| range.contains(r.hash()))
                .collect());
        }

        let _guard = self.write_lock.lock();
        let (matching, rest): (Vec<Record>, Vec<Record>) = self
            .load(partition)?
            .into_iter()
            .partition(|r| range.contains(r.hash()));
        if !matching.is_empty() {
            self.store(partition, &rest)?;
        }
        debug!(%partition, %range, count = matching.len(), delete, "Extracted range");
        Ok(matching)
    }

    /// Insert transferred records, all or nothing.
    ///
    /// Every record's signature is checked before the partition is touched;
    /// the first bad one rejects the whole batch.
    pub fn bulk_insert(&self, records: &[Record], partition: Partition) -> Result<()> {
        if let Some(bad) = records.iter().find(|r| !r.verify(&self.verifier)) {
            warn!(key = %bad.key, %partition, "Rejected transfer batch");
            return Err(StorageError::Unverified(bad.key.clone()).into());
        }
        if records.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut current = self.load(partition)?;
        upsert_all(&mut current, records.iter().cloned());
        self.store(partition, &current)?;
        debug!(%partition, count = records.len(), "Inserted transferred records");
        Ok(())
    }

    /// Insert or replace one verified record.
    pub fn put_record(&self, record: &Record, partition: Partition) -> Result<()> {
        self.bulk_insert(std::slice::from_ref(record), partition)
    }

    /// Move records in `range` from one partition to another.
    ///
    /// The destination is written first, so a crash in between leaves a
    /// duplicate rather than a loss.
    pub fn move_range(&self, range: &HashRange, from: Partition, to: Partition) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let (moving, rest): (Vec<Record>, Vec<Record>) = self
            .load(from)?
            .into_iter()
            .partition(|r| range.contains(r.hash()));
        if moving.is_empty() {
            return Ok(0);
        }

        let mut target = self.load(to)?;
        let count = moving.len();
        upsert_all(&mut target, moving);
        self.store(to, &target)?;
        self.store(from, &rest)?;
        debug!(%from, %to, %range, count, "Moved range");
        Ok(count)
    }

    /// Drop every record of a partition.
    pub fn clear(&self, partition: Partition) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.store(partition, &[])
    }

    /// Number of records in a partition.
    pub fn len(&self, partition: Partition) -> Result<usize> {
        Ok(self.load(partition)?.len())
    }

    /// All records of a partition.
    pub fn records(&self, partition: Partition) -> Result<Vec<Record>> {
        self.load(partition)
    }
}

fn upsert_all(target: &mut Vec<Record>, incoming: impl IntoIterator<Item = Record>) {
    for record in incoming {
        match target.iter_mut().find(|r| r.key == record.key) {
            Some(slot) => *slot = record,
            None => target.push(record),
        }
    }
}
