//! Per-node set of seen authentication tags.

use crate::error::AuthError;
use dashmap::DashSet;

/// Rejects any tag it has already seen.
///
/// One guard is shared by everything on a node that applies authenticated
/// mutations, so a tag accepted by the storage engine can not be replayed
/// as a control message and vice versa.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: DashSet<String>,
}

impl ReplayGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tag, failing if it was seen before.
    pub fn check_and_record(&self, tag: &str) -> Result<(), AuthError> {
        // `insert` is atomic per shard, so exactly one caller wins a tag.
        if self.seen.insert(tag.to_string()) {
            Ok(())
        } else {
            Err(AuthError::Replayed)
        }
    }

    /// Check without recording.
    pub fn is_seen(&self, tag: &str) -> bool {
        self.seen.contains(tag)
    }

    /// Number of tags recorded.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if no tag was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
