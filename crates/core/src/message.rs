//! Outbound message types for network communication.

use crate::Event;
use keel_messages::{
    CatchupReply, CatchupRequest, Commit, Heartbeat, NewView, PrePrepare, Prepare,
    ViewChangeVote,
};
use serde::{Deserialize, Serialize};

/// Outbound network messages.
///
/// These are the messages that a replica can send to other replicas.
/// The runner handles the actual network I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundMessage {
    // ═══════════════════════════════════════════════════════════════════════
    // Liveness
    // ═══════════════════════════════════════════════════════════════════════
    Heartbeat(Heartbeat),

    // ═══════════════════════════════════════════════════════════════════════
    // Three-phase commit
    // ═══════════════════════════════════════════════════════════════════════
    PrePrepare(PrePrepare),

    Prepare(Prepare),

    Commit(Commit),

    // ═══════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════
    ViewChangeVote(ViewChangeVote),

    NewView(NewView),

    // ═══════════════════════════════════════════════════════════════════════
    // Catch-up
    // ═══════════════════════════════════════════════════════════════════════
    CatchupRequest(CatchupRequest),

    CatchupReply(Box<CatchupReply>),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Heartbeat(_) => "Heartbeat",
            OutboundMessage::PrePrepare(_) => "PrePrepare",
            OutboundMessage::Prepare(_) => "Prepare",
            OutboundMessage::Commit(_) => "Commit",
            OutboundMessage::ViewChangeVote(_) => "ViewChangeVote",
            OutboundMessage::NewView(_) => "NewView",
            OutboundMessage::CatchupRequest(_) => "CatchupRequest",
            OutboundMessage::CatchupReply(_) => "CatchupReply",
        }
    }

    /// Check if this is a 3PC ordering message.
    pub fn is_three_pc(&self) -> bool {
        matches!(
            self,
            OutboundMessage::PrePrepare(_) | OutboundMessage::Prepare(_) | OutboundMessage::Commit(_)
        )
    }

    /// The event the receiving replica processes for this message.
    pub fn into_event(self) -> Event {
        match self {
            OutboundMessage::Heartbeat(heartbeat) => Event::HeartbeatReceived { heartbeat },
            OutboundMessage::PrePrepare(pre_prepare) => Event::PrePrepareReceived { pre_prepare },
            OutboundMessage::Prepare(prepare) => Event::PrepareReceived { prepare },
            OutboundMessage::Commit(commit) => Event::CommitReceived { commit },
            OutboundMessage::ViewChangeVote(vote) => Event::ViewChangeVoteReceived { vote },
            OutboundMessage::NewView(new_view) => Event::NewViewReceived { new_view },
            OutboundMessage::CatchupRequest(request) => Event::CatchupRequestReceived { request },
            OutboundMessage::CatchupReply(reply) => Event::CatchupReplyReceived { reply: *reply },
        }
    }
}
