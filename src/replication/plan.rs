//! Reconciliation planning.
//!
//! When the ring changes, every node works out which copies of its primary
//! data are now misplaced and emits actions to fix them. Planning is pure: it
//! looks at the old and new ring only, so every case can be tested without a
//! network.
//!
//! Each node only ever touches copies of *its own* range (plus, when it
//! absorbs a departed predecessor, that predecessor's range). Copies of other
//! ranges are fixed by their owners' plans.

use crate::network::rpc::TransferKind;
use crate::partitioning::{Ring, RingNode};
use crate::types::{HashRange, Partition};

/// One step of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaAction {
    /// Send local primary records in `range` to `to`, stored in `partition`.
    PushPrimary {
        to: RingNode,
        partition: Partition,
        range: HashRange,
    },

    /// Ask `on` to drop records in `range` from `partition`.
    DeleteRange {
        on: RingNode,
        range: HashRange,
        partition: Partition,
    },

    /// Ask `on` to move records in `range` between its replica partitions.
    Relabel {
        on: RingNode,
        range: HashRange,
        kind: TransferKind,
    },

    /// Move records in `range` from the local replica-1 into primary.
    MergeIntoPrimary { range: HashRange },
}

/// Actions a node runs after installing a new ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// Wait for inbound data before pushing, because this node just joined.
    pub wait_for_data: bool,
    pub actions: Vec<ReplicaAction>,
}

impl ReconciliationPlan {
    /// Check if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        !self.wait_for_data && self.actions.is_empty()
    }
}

/// How one ring relates to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingChange {
    /// Exactly one node was added.
    Added(RingNode),
    /// Exactly one node was removed; carries the node as it was placed.
    Removed(RingNode),
    /// Same membership.
    Unchanged,
    /// Anything else, e.g. the first ring a node sees.
    Other,
}

/// Compare two rings.
pub fn classify(old: &Ring, new: &Ring) -> RingChange {
    let added: Vec<&RingNode> = new.nodes().iter().filter(|n| !old.contains(&n.name)).collect();
    let removed: Vec<&RingNode> = old.nodes().iter().filter(|n| !new.contains(&n.name)).collect();

    match (added.as_slice(), removed.as_slice()) {
        ([], []) => RingChange::Unchanged,
        ([node], []) if !old.is_empty() => RingChange::Added((*node).clone()),
        ([], [node]) => RingChange::Removed((*node).clone()),
        _ => RingChange::Other,
    }
}

/// Work out what `local` must do after the ring went from `old` to `new`.
pub fn plan_reconciliation(local: &str, old: &Ring, new: &Ring) -> ReconciliationPlan {
    let Some(me) = new.node(local) else {
        return ReconciliationPlan::default();
    };
    let my_range = me.range();
    let old_replicas = old.replicas_of(local).unwrap_or_default();
    let new_replicas = new.replicas_of(local).unwrap_or_default();

    let mut plan = ReconciliationPlan::default();

    if !old.contains(local) {
        plan.wait_for_data = true;
        push_new_slots(&mut plan, &old_replicas, &new_replicas, my_range, &[]);
        return plan;
    }

    match classify(old, new) {
        RingChange::Unchanged => {}
        RingChange::Added(added) => {
            let is_predecessor = new.predecessor_of(local).map(|n| n.name == added.name);
            let is_successor = new.successor_of(local).map(|n| n.name == added.name);
            let mut skip = Vec::new();

            if is_predecessor == Some(true) {
                // The newcomer took the low end of our range; old copies of
                // that part are now stale.
                for (slot, holder) in old_replicas.iter().enumerate() {
                    if let Some(partition) = Partition::replica_slot(slot) {
                        plan.actions.push(ReplicaAction::DeleteRange {
                            on: holder.clone(),
                            range: added.range(),
                            partition,
                        });
                    }
                }
            } else if is_successor == Some(true) {
                // Old replica-1 moves one slot further away.
                if let Some(first) = old_replicas.first() {
                    plan.actions.push(ReplicaAction::Relabel {
                        on: first.clone(),
                        range: my_range,
                        kind: TransferKind::MoveReplica1ToReplica2,
                    });
                    skip.push((first.name.clone(), Partition::Replica2));
                }
                if let Some(second) = old_replicas.get(1) {
                    if second.name != added.name {
                        plan.actions.push(ReplicaAction::DeleteRange {
                            on: second.clone(),
                            range: my_range,
                            partition: Partition::Replica2,
                        });
                    }
                }
            } else if new_replicas.get(1).map(|n| n.name == added.name) == Some(true) {
                if let Some(second) = old_replicas.get(1) {
                    plan.actions.push(ReplicaAction::DeleteRange {
                        on: second.clone(),
                        range: my_range,
                        partition: Partition::Replica2,
                    });
                }
            }
            push_new_slots(&mut plan, &old_replicas, &new_replicas, my_range, &skip);
        }
        RingChange::Removed(removed) => {
            let was_predecessor = old.predecessor_of(local).map(|n| n.name == removed.name);
            let was_successor = old.successor_of(local).map(|n| n.name == removed.name);
            let mut skip = Vec::new();

            if was_predecessor == Some(true) {
                let absorbed = removed.range();
                plan.actions.push(ReplicaAction::MergeIntoPrimary { range: absorbed });
                if let Some(first) = new_replicas.first() {
                    // It held the departed node's data as replica-2.
                    plan.actions.push(ReplicaAction::Relabel {
                        on: first.clone(),
                        range: absorbed,
                        kind: TransferKind::MoveReplica2ToReplica1,
                    });
                }
                if let Some(second) = new_replicas.get(1) {
                    plan.actions.push(ReplicaAction::PushPrimary {
                        to: second.clone(),
                        partition: Partition::Replica2,
                        range: absorbed,
                    });
                }
            } else if was_successor == Some(true) {
                // Old replica-2 becomes replica-1.
                if let Some(first) = new_replicas.first() {
                    plan.actions.push(ReplicaAction::Relabel {
                        on: first.clone(),
                        range: my_range,
                        kind: TransferKind::MoveReplica2ToReplica1,
                    });
                    skip.push((first.name.clone(), Partition::Replica1));
                }
            }
            push_new_slots(&mut plan, &old_replicas, &new_replicas, my_range, &skip);
        }
        RingChange::Other => {
            push_new_slots(&mut plan, &old_replicas, &new_replicas, my_range, &[]);
        }
    }
    plan
}

/// Push the full local range to every replica slot whose occupant changed.
fn push_new_slots(
    plan: &mut ReconciliationPlan,
    old_replicas: &[RingNode],
    new_replicas: &[RingNode],
    range: HashRange,
    skip: &[(String, Partition)],
) {
    for (slot, node) in new_replicas.iter().enumerate() {
        let unchanged = old_replicas.get(slot).map(|o| o.name == node.name) == Some(true);
        let Some(partition) = Partition::replica_slot(slot) else {
            continue;
        };
        if unchanged || skip.iter().any(|(n, p)| *n == node.name && *p == partition) {
            continue;
        }
        plan.actions.push(ReplicaAction::PushPrimary {
            to: node.clone(),
            partition,
            range,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> RingNode {
        RingNode::new(name, "127.0.0.1", 5000)
    }

    fn ring_of(names: &[&str]) -> Ring {
        let mut ring = Ring::new();
        for name in names {
            ring.place(node(name));
        }
        ring
    }

    /// Names in ring order.
    fn ordered(ring: &Ring) -> Vec<String> {
        ring.names()
    }

    fn pushes(plan: &ReconciliationPlan) -> Vec<(String, Partition)> {
        plan.actions
            .iter()
            .filter_map(|a| match a {
                ReplicaAction::PushPrimary { to, partition, .. } => Some((to.name.clone(), *partition)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_classify() {
        let three = ring_of(&["a", "b", "c"]);
        let four = ring_of(&["a", "b", "c", "d"]);
        assert_eq!(classify(&three, &four), RingChange::Added(four.node("d").unwrap().clone()));
        assert_eq!(classify(&four, &three), RingChange::Removed(four.node("d").unwrap().clone()));
        assert_eq!(classify(&three, &three), RingChange::Unchanged);
        assert_eq!(classify(&Ring::new(), &ring_of(&["a"])), RingChange::Other);
        assert_eq!(classify(&ring_of(&["a", "b"]), &ring_of(&["c", "d"])), RingChange::Other);
    }

    #[test]
    fn test_not_in_new_ring_does_nothing() {
        let old = ring_of(&["a", "b", "c"]);
        let new = ring_of(&["b", "c"]);
        assert!(plan_reconciliation("a", &old, &new).is_empty());
    }

    #[test]
    fn test_unchanged_ring_does_nothing() {
        let ring = ring_of(&["a", "b", "c"]);
        assert!(plan_reconciliation("a", &ring, &ring).is_empty());
    }

    #[test]
    fn test_joining_node_waits_then_fills_its_replicas() {
        let old = ring_of(&["a", "b", "c"]);
        let new = ring_of(&["a", "b", "c", "d"]);
        let plan = plan_reconciliation("d", &old, &new);
        assert!(plan.wait_for_data);

        let replicas = new.replicas_of("d").unwrap();
        assert_eq!(
            pushes(&plan),
            vec![
                (replicas[0].name.clone(), Partition::Replica1),
                (replicas[1].name.clone(), Partition::Replica2),
            ]
        );
    }

    #[test]
    fn test_successor_of_newcomer_drops_stale_copies() {
        let old = ring_of(&["a", "b", "c", "d"]);
        let new = ring_of(&["a", "b", "c", "d", "e"]);
        let succ = new.successor_of("e").unwrap().name.clone();
        let old_replicas = old.replicas_of(&succ).unwrap();
        let range_e = new.node("e").unwrap().range();

        let plan = plan_reconciliation(&succ, &old, &new);
        assert!(!plan.wait_for_data);
        assert!(plan.actions.contains(&ReplicaAction::DeleteRange {
            on: old_replicas[0].clone(),
            range: range_e,
            partition: Partition::Replica1,
        }));
        assert!(plan.actions.contains(&ReplicaAction::DeleteRange {
            on: old_replicas[1].clone(),
            range: range_e,
            partition: Partition::Replica2,
        }));
        // Its own successors did not change.
        assert!(pushes(&plan).is_empty());
    }

    #[test]
    fn test_predecessor_of_newcomer_shifts_replicas() {
        let old = ring_of(&["a", "b", "c", "d"]);
        let new = ring_of(&["a", "b", "c", "d", "e"]);
        let pred = new.predecessor_of("e").unwrap().name.clone();
        let old_replicas = old.replicas_of(&pred).unwrap();
        let my_range = new.node(&pred).unwrap().range();

        let plan = plan_reconciliation(&pred, &old, &new);
        assert_eq!(
            plan.actions[0],
            ReplicaAction::Relabel {
                on: old_replicas[0].clone(),
                range: my_range,
                kind: TransferKind::MoveReplica1ToReplica2,
            }
        );
        assert_eq!(
            plan.actions[1],
            ReplicaAction::DeleteRange {
                on: old_replicas[1].clone(),
                range: my_range,
                partition: Partition::Replica2,
            }
        );
        // The newcomer is the only new holder; the relabeled node is skipped.
        assert_eq!(pushes(&plan), vec![("e".to_string(), Partition::Replica1)]);
    }

    #[test]
    fn test_second_predecessor_of_newcomer() {
        let old = ring_of(&["a", "b", "c", "d"]);
        let new = ring_of(&["a", "b", "c", "d", "e"]);
        let pred = new.predecessor_of("e").unwrap().name.clone();
        let pred2 = new.predecessor_of(&pred).unwrap().name.clone();
        let old_replicas = old.replicas_of(&pred2).unwrap();

        let plan = plan_reconciliation(&pred2, &old, &new);
        assert!(plan.actions.contains(&ReplicaAction::DeleteRange {
            on: old_replicas[1].clone(),
            range: new.node(&pred2).unwrap().range(),
            partition: Partition::Replica2,
        }));
        assert_eq!(pushes(&plan), vec![("e".to_string(), Partition::Replica2)]);
    }

    #[test]
    fn test_absorber_merges_departed_predecessor() {
        let old = ring_of(&["a", "b", "c", "d"]);
        let order = ordered(&old);
        let departed = order[1].clone();
        let absorber = order[2].clone();
        let new = {
            let mut ring = old.clone();
            ring.remove(&departed);
            ring
        };
        let absorbed = old.node(&departed).unwrap().range();
        let new_replicas = new.replicas_of(&absorber).unwrap();

        let plan = plan_reconciliation(&absorber, &old, &new);
        assert_eq!(plan.actions[0], ReplicaAction::MergeIntoPrimary { range: absorbed });
        assert_eq!(
            plan.actions[1],
            ReplicaAction::Relabel {
                on: new_replicas[0].clone(),
                range: absorbed,
                kind: TransferKind::MoveReplica2ToReplica1,
            }
        );
        assert_eq!(
            plan.actions[2],
            ReplicaAction::PushPrimary {
                to: new_replicas[1].clone(),
                partition: Partition::Replica2,
                range: absorbed,
            }
        );
    }

    #[test]
    fn test_absorber_with_single_replica_left() {
        let old = ring_of(&["a", "b", "c"]);
        let order = ordered(&old);
        let (departed, absorber) = (order[0].clone(), order[1].clone());
        let mut new = old.clone();
        new.remove(&departed);
        let absorbed = old.node(&departed).unwrap().range();

        let plan = plan_reconciliation(&absorber, &old, &new);
        assert_eq!(plan.actions[0], ReplicaAction::MergeIntoPrimary { range: absorbed });
        assert_eq!(
            plan.actions[1],
            ReplicaAction::Relabel {
                on: new.replicas_of(&absorber).unwrap()[0].clone(),
                range: absorbed,
                kind: TransferKind::MoveReplica2ToReplica1,
            }
        );
        assert_eq!(plan.actions.len(), 2);
    }

    #[test]
    fn test_predecessor_of_departed_promotes_replica() {
        let old = ring_of(&["a", "b", "c", "d", "e"]);
        let order = ordered(&old);
        let (me, departed) = (order[0].clone(), order[1].clone());
        let mut new = old.clone();
        new.remove(&departed);
        let new_replicas = new.replicas_of(&me).unwrap();

        let plan = plan_reconciliation(&me, &old, &new);
        assert_eq!(
            plan.actions[0],
            ReplicaAction::Relabel {
                on: new_replicas[0].clone(),
                range: new.node(&me).unwrap().range(),
                kind: TransferKind::MoveReplica2ToReplica1,
            }
        );
        assert_eq!(pushes(&plan), vec![(new_replicas[1].name.clone(), Partition::Replica2)]);
    }

    #[test]
    fn test_unrelated_removal_fills_new_slot() {
        let old = ring_of(&["a", "b", "c", "d", "e"]);
        let order = ordered(&old);
        let (me, departed) = (order[0].clone(), order[2].clone());
        let mut new = old.clone();
        new.remove(&departed);

        let plan = plan_reconciliation(&me, &old, &new);
        assert_eq!(
            pushes(&plan),
            vec![(new.replicas_of(&me).unwrap()[1].name.clone(), Partition::Replica2)]
        );
    }

    #[test]
    fn test_two_node_ring_gains_replica_slot() {
        let old = ring_of(&["a"]);
        let new = ring_of(&["a", "b"]);
        let plan = plan_reconciliation("a", &old, &new);
        assert_eq!(pushes(&plan), vec![("b".to_string(), Partition::Replica1)]);
        let my_range = new.node("a").unwrap().range();
        assert!(plan
            .actions
            .iter()
            .all(|a| matches!(a, ReplicaAction::PushPrimary { range, .. } if *range == my_range)));
    }
}
