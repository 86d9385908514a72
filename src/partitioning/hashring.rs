//! Consistent hash ring with one position per node.
//!
//! Every node sits on the ring at the MD5 hash of its name and owns the
//! interval `(lower_range, hash]`. Placement splits exactly one existing
//! interval and removal merges exactly one, so a ring change only ever moves
//! data between two nodes.

use crate::types::{HashRange, KeyHash, NodeName};
use serde::{Deserialize, Serialize};

/// Replicas kept for every primary when the ring is large enough.
pub const MAX_REPLICAS: usize = 2;

/// A node as seen by the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingNode {
    /// Unique node identity.
    pub name: NodeName,

    /// Host the node listens on.
    pub host: String,

    /// Port the node listens on.
    pub port: u16,

    /// Position on the ring, the hash of `name`.
    pub hash: KeyHash,

    /// Exclusive lower bound of the owned interval.
    pub lower_range: KeyHash,
}

impl RingNode {
    /// Create a node that is not yet placed.
    pub fn new(name: impl Into<NodeName>, host: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let hash = KeyHash::of(&name);
        Self {
            name,
            host: host.into(),
            port,
            hash,
            lower_range: hash,
        }
    }

    /// The interval this node owns.
    pub fn range(&self) -> HashRange {
        HashRange::new(self.lower_range, self.hash)
    }

    /// `host:port` of the node.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check whether this node owns a key.
    pub fn is_responsible(&self, key: &str) -> bool {
        self.range().contains_key(key)
    }
}

/// Result of placing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// The placed node with its assigned interval.
    pub node: RingNode,

    /// The node whose interval was split, `None` on an empty ring.
    pub successor: Option<RingNode>,
}

/// Result of removing a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// The removed node with the interval it held.
    pub removed: RingNode,

    /// The node that took over the removed interval, `None` if the ring is
    /// now empty.
    pub absorber: Option<RingNode>,
}

/// The ring: nodes sorted ascending by hash, read circularly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring {
    nodes: Vec<RingNode>,
}

impl Ring {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes on the ring.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, ascending by hash.
    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    /// Names of all nodes, ascending by hash.
    pub fn names(&self) -> Vec<NodeName> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&RingNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Check if a node is on the ring.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Place a node on the ring.
    ///
    /// The new node takes over the part of its successor's interval below its
    /// own hash. Returns `None` if a node with the same name or hash is
    /// already placed.
    pub fn place(&mut self, mut node: RingNode) -> Option<Placement> {
        node.hash = KeyHash::of(&node.name);
        if self.nodes.iter().any(|n| n.name == node.name || n.hash == node.hash) {
            return None;
        }

        if self.nodes.is_empty() {
            node.lower_range = node.hash;
            self.nodes.push(node.clone());
            return Some(Placement {
                node,
                successor: None,
            });
        }

        let (insert_at, successor_idx) = match self.nodes.iter().position(|n| n.hash > node.hash) {
            Some(idx) => (idx, idx),
            None => (self.nodes.len(), 0),
        };

        node.lower_range = self.nodes[successor_idx].lower_range;
        self.nodes[successor_idx].lower_range = node.hash;
        let successor = self.nodes[successor_idx].clone();
        self.nodes.insert(insert_at, node.clone());

        Some(Placement {
            node,
            successor: Some(successor),
        })
    }

    /// Remove a node from the ring.
    ///
    /// The clockwise neighbour absorbs the removed interval by taking over its
    /// lower bound. Returns `None` if the name is unknown.
    pub fn remove(&mut self, name: &str) -> Option<Removal> {
        let idx = self.position(name)?;
        let removed = self.nodes.remove(idx);

        if self.nodes.is_empty() {
            return Some(Removal {
                removed,
                absorber: None,
            });
        }

        let absorber_idx = idx % self.nodes.len();
        // On a ring of two the removed lower bound is the absorber's own hash,
        // which makes the survivor cover the whole space.
        self.nodes[absorber_idx].lower_range = removed.lower_range;

        Some(Removal {
            removed,
            absorber: Some(self.nodes[absorber_idx].clone()),
        })
    }

    fn replica_count(&self) -> usize {
        match self.nodes.len() {
            0..=1 => 0,
            2 => 1,
            _ => MAX_REPLICAS,
        }
    }

    /// Replicas of a node: its next one or two successors.
    ///
    /// Returns `None` if the name is unknown, an empty list on a ring of one.
    pub fn replicas_of(&self, name: &str) -> Option<Vec<RingNode>> {
        let idx = self.position(name)?;
        let len = self.nodes.len();
        Some(
            (1..=self.replica_count())
                .map(|step| self.nodes[(idx + step) % len].clone())
                .collect(),
        )
    }

    /// Nodes this node holds replicas for, in slot order: element 0 is the
    /// node whose data lives in `Replica1`, element 1 the `Replica2` one.
    pub fn replicated_by(&self, name: &str) -> Option<Vec<RingNode>> {
        let idx = self.position(name)?;
        let len = self.nodes.len();
        Some(
            (1..=self.replica_count())
                .map(|step| self.nodes[(idx + len - step) % len].clone())
                .collect(),
        )
    }

    /// The node immediately before `name`. `None` on a ring of one.
    pub fn predecessor_of(&self, name: &str) -> Option<&RingNode> {
        let idx = self.position(name)?;
        let len = self.nodes.len();
        if len <= 1 {
            return None;
        }
        Some(&self.nodes[(idx + len - 1) % len])
    }

    /// The node immediately after `name`. `None` on a ring of one.
    pub fn successor_of(&self, name: &str) -> Option<&RingNode> {
        let idx = self.position(name)?;
        let len = self.nodes.len();
        if len <= 1 {
            return None;
        }
        Some(&self.nodes[(idx + 1) % len])
    }

    /// The node owning a hash.
    pub fn owner_of_hash(&self, hash: KeyHash) -> Option<&RingNode> {
        self.nodes.iter().find(|n| n.range().contains(hash))
    }

    /// The node owning a key.
    pub fn owner_of(&self, key: &str) -> Option<&RingNode> {
        self.owner_of_hash(KeyHash::of(key))
    }

    /// The replica slot `name` occupies for `key`, if it is one of the key
    /// owner's replicas.
    pub fn replica_slot_for(&self, name: &str, key: &str) -> Option<usize> {
        let owner = self.owner_of(key)?;
        self.replicas_of(&owner.name)?
            .iter()
            .position(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn node(name: &str) -> RingNode {
        RingNode::new(name, "127.0.0.1", 5000)
    }

    fn ring_of(names: &[&str]) -> Ring {
        let mut ring = Ring::new();
        for name in names {
            ring.place(node(name)).unwrap();
        }
        ring
    }

    /// Every probe hash must fall into exactly one node's interval.
    fn assert_tiles(ring: &Ring, probes: &[KeyHash]) {
        for &probe in probes {
            let owners = ring
                .nodes()
                .iter()
                .filter(|n| n.range().contains(probe))
                .count();
            assert_eq!(owners, 1, "hash {} owned by {} nodes", probe, owners);
        }
        // Node hashes themselves and the positions right after are the
        // interesting edges.
        for n in ring.nodes() {
            for probe in [n.hash, KeyHash(n.hash.0.wrapping_add(1))] {
                let owners = ring
                    .nodes()
                    .iter()
                    .filter(|m| m.range().contains(probe))
                    .count();
                assert_eq!(owners, 1);
            }
        }
    }

    fn random_probes(count: usize) -> Vec<KeyHash> {
        let mut rng = rand::thread_rng();
        let mut probes: Vec<KeyHash> = (0..count).map(|_| KeyHash(rng.gen())).collect();
        probes.push(KeyHash(0));
        probes.push(KeyHash(u128::MAX));
        probes
    }

    #[test]
    fn test_empty_ring() {
        let ring = Ring::new();
        assert!(ring.is_empty());
        assert!(ring.owner_of("key").is_none());
        assert!(ring.replicas_of("a").is_none());
    }

    #[test]
    fn test_single_node_owns_everything() {
        let mut ring = Ring::new();
        let placement = ring.place(node("a")).unwrap();
        assert!(placement.successor.is_none());
        assert_eq!(placement.node.lower_range, placement.node.hash);

        for i in 0..100 {
            assert_eq!(ring.owner_of(&format!("key{}", i)).unwrap().name, "a");
        }
        assert!(ring.predecessor_of("a").is_none());
        assert!(ring.successor_of("a").is_none());
        assert_eq!(ring.replicas_of("a").unwrap().len(), 0);
    }

    #[test]
    fn test_place_returns_split_successor() {
        let mut ring = ring_of(&["a", "b"]);
        let before = ring.clone();
        let placement = ring.place(node("c")).unwrap();
        let successor = placement.successor.unwrap();

        assert_eq!(successor.lower_range, placement.node.hash);
        assert_eq!(
            placement.node.lower_range,
            before.node(&successor.name).unwrap().lower_range
        );
        // Only the new node and its successor changed.
        for n in before.nodes() {
            if n.name != successor.name {
                assert_eq!(ring.node(&n.name), Some(n));
            }
        }
    }

    #[test]
    fn test_place_duplicate_rejected() {
        let mut ring = ring_of(&["a"]);
        assert!(ring.place(node("a")).is_none());
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_nodes_sorted_by_hash() {
        let ring = ring_of(&["n1", "n2", "n3", "n4", "n5"]);
        let hashes: Vec<_> = ring.nodes().iter().map(|n| n.hash).collect();
        let mut sorted = hashes.clone();
        sorted.sort();
        assert_eq!(hashes, sorted);
    }

    #[test]
    fn test_intervals_tile_after_random_changes() {
        let mut rng = rand::thread_rng();
        let probes = random_probes(500);
        let mut ring = Ring::new();
        let mut present: Vec<String> = Vec::new();

        for step in 0..200 {
            let add = present.is_empty() || rng.gen_bool(0.6);
            if add {
                let name = format!("node-{}", step);
                ring.place(node(&name)).unwrap();
                present.push(name);
            } else {
                let idx = rng.gen_range(0..present.len());
                let name = present.swap_remove(idx);
                let removal = ring.remove(&name).unwrap();
                assert_eq!(removal.removed.name, name);
            }
            if !ring.is_empty() {
                assert_tiles(&ring, &probes);
            }
        }
    }

    #[test]
    fn test_remove_absorber_takes_interval() {
        let mut ring = ring_of(&["a", "b", "c", "d"]);
        let removed_range = ring.node("b").unwrap().range();
        let successor = ring.successor_of("b").unwrap().name.clone();

        let removal = ring.remove("b").unwrap();
        let absorber = removal.absorber.unwrap();
        assert_eq!(absorber.name, successor);
        assert_eq!(absorber.lower_range, removed_range.lower);
        assert!(ring.node("b").is_none());
    }

    #[test]
    fn test_remove_down_to_one_node() {
        let mut ring = ring_of(&["a", "b"]);
        let removal = ring.remove("a").unwrap();
        let last = removal.absorber.unwrap();
        assert_eq!(last.lower_range, last.hash);
        assert_eq!(ring.owner_of("anything").unwrap().name, "b");

        let removal = ring.remove("b").unwrap();
        assert!(removal.absorber.is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_remove_unknown() {
        let mut ring = ring_of(&["a"]);
        assert!(ring.remove("zzz").is_none());
    }

    #[test]
    fn test_replica_counts() {
        let ring = ring_of(&["a"]);
        assert!(ring.replicas_of("a").unwrap().is_empty());

        let ring = ring_of(&["a", "b"]);
        let replicas = ring.replicas_of("a").unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].name, "b");

        let names = ["a", "b", "c", "d", "e"];
        let ring = ring_of(&names);
        for name in names {
            let replicas = ring.replicas_of(name).unwrap();
            assert_eq!(replicas.len(), 2);
            assert_ne!(replicas[0].name, replicas[1].name);
            assert!(replicas.iter().all(|r| r.name != name));
            assert_eq!(&replicas[0], ring.successor_of(name).unwrap());
        }

        let ring = ring_of(&["a", "b", "c"]);
        for name in ["a", "b", "c"] {
            let replicas = ring.replicas_of(name).unwrap();
            assert_eq!(replicas.len(), 2);
            assert!(replicas.iter().all(|r| r.name != name));
        }
    }

    #[test]
    fn test_replicated_by_is_inverse() {
        let ring = ring_of(&["a", "b", "c", "d"]);
        for n in ring.nodes() {
            for (slot, pred) in ring.replicated_by(&n.name).unwrap().iter().enumerate() {
                let replicas = ring.replicas_of(&pred.name).unwrap();
                assert_eq!(replicas[slot].name, n.name);
            }
        }
    }

    #[test]
    fn test_owner_is_deterministic() {
        let ring = ring_of(&["a", "b", "c"]);
        let copy: Ring = serde_json::from_str(&serde_json::to_string(&ring).unwrap()).unwrap();
        for i in 0..200 {
            let key = format!("k{}", i);
            assert_eq!(ring.owner_of(&key), ring.owner_of(&key));
            assert_eq!(ring.owner_of(&key), copy.owner_of(&key));
        }
    }

    #[test]
    fn test_owner_independent_of_insertion_order() {
        let mut names = vec!["a", "b", "c"];
        let reference = ring_of(&names);
        let mut rng = rand::thread_rng();
        for _ in 0..6 {
            names.shuffle(&mut rng);
            let ring = ring_of(&names);
            for i in 0..100 {
                let key = format!("key-{}", i);
                assert_eq!(
                    ring.owner_of(&key).unwrap().name,
                    reference.owner_of(&key).unwrap().name
                );
            }
        }
    }

    #[test]
    fn test_replica_slot_for() {
        let ring = ring_of(&["a", "b", "c", "d"]);
        let key = "some-key";
        let owner = ring.owner_of(key).unwrap().name.clone();
        let replicas = ring.replicas_of(&owner).unwrap();
        assert_eq!(ring.replica_slot_for(&replicas[0].name, key), Some(0));
        assert_eq!(ring.replica_slot_for(&replicas[1].name, key), Some(1));
        assert_eq!(ring.replica_slot_for(&owner, key), None);
    }
}
