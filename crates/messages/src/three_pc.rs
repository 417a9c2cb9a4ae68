//! Three-phase commit messages.

use crate::NetworkMessage;
use keel_types::{ClientRequest, Digest, NodeId, SeqNo, ViewNumber};
use serde::{Deserialize, Serialize};

/// Primary's proposal binding `request` to `(view, seq)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub seq: SeqNo,
    pub digest: Digest,
    pub request: ClientRequest,
    pub sender: NodeId,
}

impl PrePrepare {
    pub fn new(view: ViewNumber, seq: SeqNo, request: ClientRequest, sender: NodeId) -> Self {
        Self {
            view,
            seq,
            digest: request.digest(),
            request,
            sender,
        }
    }

    /// The carried digest matches the carried request.
    pub fn is_well_formed(&self) -> bool {
        self.request.digest() == self.digest
    }
}

impl NetworkMessage for PrePrepare {
    fn message_type_id() -> &'static str {
        "3pc.pre_prepare"
    }
}

/// Replica acknowledgement of a pre-prepare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub seq: SeqNo,
    pub digest: Digest,
    pub voter: NodeId,
}

impl NetworkMessage for Prepare {
    fn message_type_id() -> &'static str {
        "3pc.prepare"
    }
}

/// Sent once the sender holds a prepare quorum for `(view, seq, digest)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub seq: SeqNo,
    pub digest: Digest,
    pub voter: NodeId,
}

impl NetworkMessage for Commit {
    fn message_type_id() -> &'static str {
        "3pc.commit"
    }
}
