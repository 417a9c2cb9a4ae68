//! Catch-up request/response.

use crate::NetworkMessage;
use keel_types::{CommittedEntry, NodeId, SeqNo, ViewNumber};
use serde::{Deserialize, Serialize};

/// Ask peers for their current view and the committed entries after `last_committed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupRequest {
    pub requester: NodeId,
    pub view: ViewNumber,
    pub last_committed: SeqNo,
    /// Sent by a fresh session. Receivers mark the requester as restarting.
    pub restarting: bool,
}

impl NetworkMessage for CatchupRequest {
    fn message_type_id() -> &'static str {
        "catchup.request"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupReply {
    pub responder: NodeId,
    pub view: ViewNumber,
    /// False while the responder is itself still catching up.
    pub participating: bool,
    pub last_committed: SeqNo,
    /// Committed entries after the requester's `last_committed`, in order.
    pub entries: Vec<CommittedEntry>,
}

impl NetworkMessage for CatchupReply {
    fn message_type_id() -> &'static str {
        "catchup.reply"
    }
}
