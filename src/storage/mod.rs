//! Durable per-node record storage.
//!
//! A node keeps three record sets: its own primary data and replicas of its
//! two predecessors.
//!
//! ```text
//! <data_dir>/<node>/
//!   ├── primary.jsonl    keys in (lower_range, hash] of this node
//!   ├── replica1.jsonl   primary data of the predecessor
//!   └── replica2.jsonl   primary data of the predecessor's predecessor
//! ```

mod disk;
mod record;

pub use disk::{DiskStorage, Lookup, WriteOutcome};
pub use record::{chunk_records, Record};
