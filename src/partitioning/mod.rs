//! Partitioning module for distributing keys across storage nodes.
//!
//! Keys and node names are hashed onto the same 128-bit ring. A node owns the
//! half-open interval between its predecessor's position and its own, and its
//! next one or two successors hold replicas of that interval.
//!
//! # Architecture
//!
//! ```text
//!                 hash space (MD5, wraps at 2^128)
//!   0 ──────────────────────────────────────────────────────▶ max
//!        │            │                 │              │
//!        A            B                 C              D
//!   (D, A]       (A, B]            (B, C]         (C, D]
//!
//!   key "k1" → md5 → lands in (A, B] → primary B
//!                                     → replica-1 C, replica-2 D
//! ```
//!
//! # Example
//!
//! ```rust
//! use ringkv::partitioning::{Ring, RingNode};
//!
//! let mut ring = Ring::new();
//! ring.place(RingNode::new("node-a", "127.0.0.1", 5000));
//! ring.place(RingNode::new("node-b", "127.0.0.1", 5001));
//! ring.place(RingNode::new("node-c", "127.0.0.1", 5002));
//!
//! let owner = ring.owner_of("user:123").unwrap();
//! let replicas = ring.replicas_of(&owner.name).unwrap();
//! assert_eq!(replicas.len(), 2);
//! ```

mod hashring;

pub use hashring::{Placement, Removal, Ring, RingNode, MAX_REPLICAS};
