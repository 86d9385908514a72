//! Replication between storage nodes.
//!
//! Every node's primary data is copied to its next two successors on the
//! ring. Writes flow to replicas through a queue as they are applied; ring
//! changes trigger a reconciliation that moves whole ranges.

pub mod plan;
mod service;

pub use plan::{classify, plan_reconciliation, ReconciliationPlan, ReplicaAction, RingChange};
pub use service::ReplicationService;
