//! View-change messages.

use crate::NetworkMessage;
use keel_types::{NodeId, PreparedCertificate, SeqNo, ViewNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Vote to move the pool to `candidate`.
///
/// The primary of the candidate view is not carried: every replica derives it
/// from the view ordinal and membership order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeVote {
    pub candidate: ViewNumber,
    pub voter: NodeId,
    /// Voter's highest committed sequence number.
    pub last_committed: SeqNo,
    /// Entries the voter saw prepared above `last_committed`.
    pub prepared: Vec<PreparedCertificate>,
}

impl NetworkMessage for ViewChangeVote {
    fn message_type_id() -> &'static str {
        "view_change.vote"
    }
}

/// Announcement that `view` gathered a quorum of votes.
///
/// Replicas that missed the votes adopt the view from this message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: ViewNumber,
    pub primary: NodeId,
    pub voters: BTreeSet<NodeId>,
    /// Highest committed sequence number among the voters.
    pub floor: SeqNo,
    /// Certificates the new primary re-proposes, contiguous from `floor + 1`.
    pub reproposals: Vec<PreparedCertificate>,
}

impl NetworkMessage for NewView {
    fn message_type_id() -> &'static str {
        "view_change.new_view"
    }
}
