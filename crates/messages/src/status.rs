//! Periodic liveness heartbeats.

use crate::NetworkMessage;
use keel_types::{NodeId, SeqNo, ViewNumber};
use serde::{Deserialize, Serialize};

/// Whether a replica is still rebuilding its state after a (re)start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaMode {
    CatchingUp,
    Participating,
}

/// What a replica reports about itself in every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub view: ViewNumber,
    pub last_committed: SeqNo,
    pub mode: ReplicaMode,
}

impl ReplicaStatus {
    pub fn is_participating(&self) -> bool {
        self.mode == ReplicaMode::Participating
    }
}

/// Broadcast every heartbeat interval. Receipt refreshes the sender's liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: NodeId,
    pub status: ReplicaStatus,
}

impl NetworkMessage for Heartbeat {
    fn message_type_id() -> &'static str {
        "status.heartbeat"
    }
}
