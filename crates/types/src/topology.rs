//! Pool membership, quorum sizes and primary selection.

use crate::{NodeId, ViewNumber};
use std::sync::Arc;

/// Membership view of the replica pool as seen by one replica.
///
/// Quorum arithmetic follows the classic `n >= 3f + 1` bound: a strong quorum
/// is `n - f` replicas and a weak quorum (enough to include at least one
/// honest replica) is `f + 1`.
pub trait Topology: Send + Sync {
    /// The local replica's ID.
    fn local_node_id(&self) -> NodeId;

    /// Pool members in membership order. Never empty: the local replica is
    /// always a member.
    fn members(&self) -> &[NodeId];

    // Derived methods

    /// Number of replicas in the pool.
    fn pool_size(&self) -> usize {
        self.members().len()
    }

    /// Maximum number of faulty replicas tolerated.
    fn fault_tolerance(&self) -> usize {
        self.pool_size().saturating_sub(1) / 3
    }

    /// Votes required to finalize a decision (`n - f`).
    fn strong_quorum(&self) -> usize {
        self.pool_size() - self.fault_tolerance()
    }

    /// Votes guaranteeing at least one correct replica (`f + 1`).
    fn weak_quorum(&self) -> usize {
        self.fault_tolerance() + 1
    }

    /// Deterministic primary for a view: round robin over membership order.
    ///
    /// Falls back to the local replica if `members` is empty.
    fn primary_for(&self, view: ViewNumber) -> NodeId {
        let members = self.members();
        if members.is_empty() {
            return self.local_node_id();
        }
        members[(view.0 % members.len() as u64) as usize]
    }

    fn is_primary(&self, view: ViewNumber) -> bool {
        self.primary_for(view) == self.local_node_id()
    }

    fn is_member(&self, node: NodeId) -> bool {
        self.members().contains(&node)
    }

    fn member_index(&self, node: NodeId) -> Option<usize> {
        self.members().iter().position(|m| *m == node)
    }

    /// Every member except the local replica.
    fn peers(&self) -> Vec<NodeId> {
        let local = self.local_node_id();
        self.members()
            .iter()
            .copied()
            .filter(|m| *m != local)
            .collect()
    }
}

/// Errors that can occur when building a topology.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("pool must contain at least one member")]
    EmptyPool,

    #[error("local node {0} is not a pool member")]
    NotAMember(NodeId),

    #[error("node {0} is listed more than once")]
    DuplicateMember(NodeId),
}

/// A fixed pool membership.
#[derive(Debug, Clone)]
pub struct PoolTopology {
    local_node_id: NodeId,
    members: Vec<NodeId>,
}

impl PoolTopology {
    pub fn new(local_node_id: NodeId, members: Vec<NodeId>) -> Result<Self, TopologyError> {
        if members.is_empty() {
            return Err(TopologyError::EmptyPool);
        }
        for (i, m) in members.iter().enumerate() {
            if members[..i].contains(m) {
                return Err(TopologyError::DuplicateMember(*m));
            }
        }
        if !members.contains(&local_node_id) {
            return Err(TopologyError::NotAMember(local_node_id));
        }
        Ok(Self {
            local_node_id,
            members,
        })
    }

    /// Pool of `n` replicas with IDs `0..n`.
    pub fn sequential(local_node_id: NodeId, n: u32) -> Result<Self, TopologyError> {
        Self::new(local_node_id, (0..n).map(NodeId).collect())
    }

    pub fn into_arc(self) -> Arc<dyn Topology> {
        Arc::new(self)
    }
}

impl Topology for PoolTopology {
    fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    fn members(&self) -> &[NodeId] {
        &self.members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_sizes() {
        let cases = [(1, 0, 1, 1), (4, 1, 3, 2), (5, 1, 4, 2), (7, 2, 5, 3), (10, 3, 7, 4)];
        for (n, f, strong, weak) in cases {
            let topology = PoolTopology::sequential(NodeId(0), n).unwrap();
            assert_eq!(topology.fault_tolerance(), f, "n = {n}");
            assert_eq!(topology.strong_quorum(), strong, "n = {n}");
            assert_eq!(topology.weak_quorum(), weak, "n = {n}");
        }
    }

    #[test]
    fn test_primary_rotation() {
        let topology = PoolTopology::sequential(NodeId(2), 4).unwrap();

        assert_eq!(topology.primary_for(ViewNumber(0)), NodeId(0));
        assert_eq!(topology.primary_for(ViewNumber(1)), NodeId(1));
        assert_eq!(topology.primary_for(ViewNumber(5)), NodeId(1));
        assert!(topology.is_primary(ViewNumber(2)));
        assert_eq!(topology.peers(), vec![NodeId(0), NodeId(1), NodeId(3)]);
    }

    struct Detached;

    impl Topology for Detached {
        fn local_node_id(&self) -> NodeId {
            NodeId(3)
        }

        fn members(&self) -> &[NodeId] {
            &[]
        }
    }

    #[test]
    fn test_primary_without_members_is_local() {
        assert_eq!(Detached.primary_for(ViewNumber(7)), NodeId(3));
        assert!(Detached.is_primary(ViewNumber(0)));
    }

    #[test]
    fn test_rejects_invalid_membership() {
        assert_eq!(
            PoolTopology::new(NodeId(0), vec![]).unwrap_err(),
            TopologyError::EmptyPool
        );
        assert_eq!(
            PoolTopology::new(NodeId(9), vec![NodeId(0), NodeId(1)]).unwrap_err(),
            TopologyError::NotAMember(NodeId(9))
        );
        assert_eq!(
            PoolTopology::new(NodeId(0), vec![NodeId(0), NodeId(0)]).unwrap_err(),
            TopologyError::DuplicateMember(NodeId(0))
        );
    }
}
