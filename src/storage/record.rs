//! Stored records.

use crate::network::rpc::{KvMessage, StatusType};
use crate::security::{MessageVerifier, Signable};
use crate::types::KeyHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// One stored key, together with the signed PUT that last set its value.
///
/// Keeping the client id, request id and tag of that PUT makes every record
/// independently verifiable, which is what lets whole partitions be shipped
/// between nodes without trusting the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: String,
    pub client_id: String,
    pub request_id: Uuid,
    pub tag: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub subscribers: BTreeSet<String>,
}

impl Record {
    /// Build a record from a signed PUT carrying a value.
    pub fn from_put(msg: &KvMessage) -> Option<Self> {
        if msg.status != StatusType::Put {
            return None;
        }
        Some(Self {
            key: msg.key.clone(),
            value: msg.value.clone()?,
            client_id: msg.client_id.clone(),
            request_id: msg.request_id,
            tag: msg.tag.clone()?,
            subscribers: BTreeSet::new(),
        })
    }

    /// Replace value and signature from a newer signed PUT, keeping
    /// subscribers.
    pub fn apply_put(&mut self, msg: &KvMessage) -> bool {
        match Record::from_put(msg) {
            Some(newer) => {
                self.value = newer.value;
                self.client_id = newer.client_id;
                self.request_id = newer.request_id;
                self.tag = newer.tag;
                true
            }
            None => false,
        }
    }

    /// The PUT this record was written by.
    pub fn as_put(&self) -> KvMessage {
        KvMessage {
            key: self.key.clone(),
            value: Some(self.value.clone()),
            client_id: self.client_id.clone(),
            status: StatusType::Put,
            request_id: self.request_id,
            tag: Some(self.tag.clone()),
            metadata: None,
            error_message: None,
        }
    }

    /// Check the record's signature.
    pub fn verify(&self, verifier: &MessageVerifier) -> bool {
        verifier.verify(&self.as_put()).is_ok()
    }

    /// Ring position of the key.
    pub fn hash(&self) -> KeyHash {
        KeyHash::of(&self.key)
    }
}

/// Split records into batches whose encoded size stays under `max_bytes`.
///
/// A record larger than `max_bytes` on its own still gets a batch of one.
pub fn chunk_records(records: Vec<Record>, max_bytes: usize) -> Vec<Vec<Record>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0;

    for record in records {
        let size = serde_json::to_vec(&record).map(|v| v.len()).unwrap_or(max_bytes);
        if !current.is_empty() && current_bytes + size > max_bytes {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(record);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
