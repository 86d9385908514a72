//! Core types used throughout the store.

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Node identity on the ring. Also the name of its coordination-service entry.
pub type NodeName = String;

/// Maximum key length in bytes.
pub const MAX_KEY_BYTES: usize = 20;

/// Maximum value length in bytes.
pub const MAX_VALUE_BYTES: usize = 120 * 1024;

/// Sender id carried by every coordinator control message.
pub const ECS_SENDER_ID: &str = "ecs";

/// A position on the ring: the MD5 digest of a key or node name read as a
/// big-endian 128-bit integer.
///
/// Serialized as 32 upper-case hex digits so ring snapshots stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyHash(pub u128);

impl KeyHash {
    /// Hash arbitrary bytes onto the ring.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        let digest = Md5::digest(data.as_ref());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest);
        KeyHash(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032X}", self.0)
    }
}

impl FromStr for KeyHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(KeyHash)
    }
}

impl Serialize for KeyHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Half-open interval `(lower, upper]` on the ring, wrapping past the top of
/// the hash space when `lower >= upper`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub lower: KeyHash,
    pub upper: KeyHash,
}

impl HashRange {
    /// Create a range.
    pub fn new(lower: KeyHash, upper: KeyHash) -> Self {
        Self { lower, upper }
    }

    /// Check whether a hash falls into this range.
    ///
    /// `lower == upper` is the range of a node alone on the ring and covers
    /// the whole space.
    pub fn contains(&self, hash: KeyHash) -> bool {
        if self.lower < self.upper {
            self.lower < hash && hash <= self.upper
        } else {
            hash > self.lower || hash <= self.upper
        }
    }

    /// Check whether a key hashes into this range.
    pub fn contains_key(&self, key: &str) -> bool {
        self.contains(KeyHash::of(key))
    }

    /// Check whether every hash of `other` also falls into this range.
    pub fn covers(&self, other: &HashRange) -> bool {
        if self.lower == self.upper {
            return true;
        }
        if other.lower == other.upper {
            return false;
        }
        // Measure both as offsets from our lower bound so wrapping drops out.
        let span = self.upper.0.wrapping_sub(self.lower.0);
        let start = other.lower.0.wrapping_sub(self.lower.0);
        let len = other.upper.0.wrapping_sub(other.lower.0);
        start.checked_add(len).is_some_and(|end| end <= span)
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.lower, self.upper)
    }
}

/// One of the three record sets a node stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Partition {
    /// Data this node owns.
    Primary,
    /// Copy of the immediate predecessor's primary data.
    Replica1,
    /// Copy of the second predecessor's primary data.
    Replica2,
}

impl Partition {
    /// All partitions in storage order.
    pub const ALL: [Partition; 3] = [Partition::Primary, Partition::Replica1, Partition::Replica2];

    /// The replica partition for a replica slot (0 → Replica1, 1 → Replica2).
    pub fn replica_slot(slot: usize) -> Option<Partition> {
        match slot {
            0 => Some(Partition::Replica1),
            1 => Some(Partition::Replica2),
            _ => None,
        }
    }

    /// File stem used on disk.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Partition::Primary => "primary",
            Partition::Replica1 => "replica1",
            Partition::Replica2 => "replica2",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}
