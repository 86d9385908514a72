//! Cluster membership events.
//!
//! The coordinator sees membership only as the child set of `/nodes`. Each
//! change is diffed against the previous set and classified using what the
//! coordinator itself asked for: a join it is waiting on is planned, any
//! other appearance is unexpected; a departure it is waiting on is a planned
//! leave, any other is a crash.

use std::collections::BTreeSet;

/// Events related to cluster membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// A launched node registered.
    PlannedJoin { node: String },

    /// A node registered without being launched by the coordinator.
    UnexpectedJoin { node: String },

    /// A node that was told to shut down deregistered.
    PlannedLeave { node: String },

    /// A node deregistered without being told to.
    Crash { node: String },
}

impl MemberEvent {
    /// Get the node name associated with this event.
    pub fn node(&self) -> &str {
        match self {
            MemberEvent::PlannedJoin { node }
            | MemberEvent::UnexpectedJoin { node }
            | MemberEvent::PlannedLeave { node }
            | MemberEvent::Crash { node } => node,
        }
    }

    /// Check if this is a join-type event.
    pub fn is_join(&self) -> bool {
        matches!(
            self,
            MemberEvent::PlannedJoin { .. } | MemberEvent::UnexpectedJoin { .. }
        )
    }

    /// Check if this is a leave-type event.
    pub fn is_leave(&self) -> bool {
        matches!(
            self,
            MemberEvent::PlannedLeave { .. } | MemberEvent::Crash { .. }
        )
    }
}

/// Diff two child sets and classify every difference.
///
/// Joins come before leaves; within each group events are in name order.
pub fn classify_membership(
    previous: &BTreeSet<String>,
    current: &BTreeSet<String>,
    join_expected: impl Fn(&str) -> bool,
    leave_expected: impl Fn(&str) -> bool,
) -> Vec<MemberEvent> {
    let joins = current.difference(previous).map(|node| {
        if join_expected(node) {
            MemberEvent::PlannedJoin { node: node.clone() }
        } else {
            MemberEvent::UnexpectedJoin { node: node.clone() }
        }
    });
    let leaves = previous.difference(current).map(|node| {
        if leave_expected(node) {
            MemberEvent::PlannedLeave { node: node.clone() }
        } else {
            MemberEvent::Crash { node: node.clone() }
        }
    });
    joins.chain(leaves).collect()
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: &MemberEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl MemberEventListener for LoggingEventListener {
    fn on_event(&self, event: &MemberEvent) {
        match event {
            MemberEvent::PlannedJoin { node } => {
                tracing::info!(node = %node, "Node joined cluster");
            }
            MemberEvent::UnexpectedJoin { node } => {
                tracing::warn!(node = %node, "Unexpected node registration");
            }
            MemberEvent::PlannedLeave { node } => {
                tracing::info!(node = %node, "Node left cluster");
            }
            MemberEvent::Crash { node } => {
                tracing::error!(node = %node, "Node crashed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_event_node() {
        let event = MemberEvent::Crash {
            node: "node-3".into(),
        };
        assert_eq!(event.node(), "node-3");
        assert!(event.is_leave());
        assert!(!event.is_join());
    }

    #[test]
    fn test_classification() {
        let previous = set(&["a", "b", "c"]);
        let current = set(&["a", "c", "d", "e"]);
        let events = classify_membership(
            &previous,
            &current,
            |n| n == "d",
            |_| false,
        );
        assert_eq!(
            events,
            vec![
                MemberEvent::PlannedJoin { node: "d".into() },
                MemberEvent::UnexpectedJoin { node: "e".into() },
                MemberEvent::Crash { node: "b".into() },
            ]
        );

        let events = classify_membership(&previous, &set(&["a", "c"]), |_| false, |n| n == "b");
        assert_eq!(events, vec![MemberEvent::PlannedLeave { node: "b".into() }]);
    }

    #[test]
    fn test_no_change_no_events() {
        let same = set(&["a"]);
        assert!(classify_membership(&same, &same, |_| true, |_| true).is_empty());
    }
}
