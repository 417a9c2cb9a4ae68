//! Record of every notification the simulated replicas emitted.

use crate::NodeIndex;
use keel_core::NodeNotification;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub node: NodeIndex,
    pub at: Duration,
    pub notification: NodeNotification,
}

/// Append-only log of notifications, across restarts.
#[derive(Debug, Clone, Default)]
pub struct NotificationLog {
    records: Vec<NotificationRecord>,
}

impl NotificationLog {
    pub fn record(&mut self, node: NodeIndex, at: Duration, notification: NodeNotification) {
        self.records.push(NotificationRecord {
            node,
            at,
            notification,
        });
    }

    pub fn records(&self) -> &[NotificationRecord] {
        &self.records
    }

    pub fn for_node(&self, node: NodeIndex) -> impl Iterator<Item = &NotificationRecord> {
        self.records.iter().filter(move |r| r.node == node)
    }

    pub fn count_where(
        &self,
        node: NodeIndex,
        predicate: impl Fn(&NodeNotification) -> bool,
    ) -> usize {
        self.for_node(node)
            .filter(|r| predicate(&r.notification))
            .count()
    }

    /// How many times `node` reported an inconsistent 3PC state.
    pub fn inconsistency_count(&self, node: NodeIndex) -> usize {
        self.count_where(node, |n| {
            matches!(n, NodeNotification::InconsistentThreePcState { .. })
        })
    }

    /// Inconsistency reports across the whole pool.
    pub fn total_inconsistencies(&self) -> usize {
        self.records
            .iter()
            .filter(|r| {
                matches!(
                    r.notification,
                    NodeNotification::InconsistentThreePcState { .. }
                )
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
