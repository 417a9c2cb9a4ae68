//! Event types for the deterministic state machine.

use crate::TimerId;
use keel_messages::{
    CatchupReply, CatchupRequest, Commit, Heartbeat, NewView, PrePrepare, Prepare,
    ViewChangeVote,
};
use keel_types::{ClientRequest, NodeId, PreparedCertificate, SeqNo, View, ViewNumber};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other nodes.
    Network = 2,

    /// Client and operator events.
    Client = 3,
}

/// All possible events a replica can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// Periodic tick: broadcast a heartbeat and re-evaluate peer liveness.
    HeartbeatTimer,

    /// A catch-up attempt has waited one full catch-up timeout.
    CatchupTimer,

    /// The election for `view` did not complete in time.
    ElectionTimer { view: ViewNumber },

    /// An inconsistency incident has been open for the whole recovery window.
    RecoveryWindowTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    HeartbeatReceived { heartbeat: Heartbeat },

    PrePrepareReceived { pre_prepare: PrePrepare },

    PrepareReceived { prepare: Prepare },

    CommitReceived { commit: Commit },

    ViewChangeVoteReceived { vote: ViewChangeVote },

    NewViewReceived { new_view: NewView },

    CatchupRequestReceived { request: CatchupRequest },

    CatchupReplyReceived { reply: CatchupReply },

    /// The transport lost its connection to `peer`.
    PeerDisconnected { peer: NodeId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// A view change reached quorum locally.
    ///
    /// `floor` is the highest committed sequence number among the voters and
    /// `reproposals` the prepared certificates the new primary re-proposes.
    ViewChangeCompleted {
        view: View,
        floor: SeqNo,
        reproposals: Vec<PreparedCertificate>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Client / Operator (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    ClientRequestReceived { request: ClientRequest },

    /// Operator signal to move the pool to the next view.
    ViewChangeRequested,
}

impl Event {
    /// The event delivered when timer `id` fires.
    pub fn from_timer(id: TimerId) -> Event {
        match id {
            TimerId::Heartbeat => Event::HeartbeatTimer,
            TimerId::Catchup => Event::CatchupTimer,
            TimerId::Election(view) => Event::ElectionTimer { view },
            TimerId::RecoveryWindow => Event::RecoveryWindowTimer,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            Event::ViewChangeCompleted { .. } => EventPriority::Internal,

            Event::HeartbeatTimer
            | Event::CatchupTimer
            | Event::ElectionTimer { .. }
            | Event::RecoveryWindowTimer => EventPriority::Timer,

            Event::HeartbeatReceived { .. }
            | Event::PrePrepareReceived { .. }
            | Event::PrepareReceived { .. }
            | Event::CommitReceived { .. }
            | Event::ViewChangeVoteReceived { .. }
            | Event::NewViewReceived { .. }
            | Event::CatchupRequestReceived { .. }
            | Event::CatchupReplyReceived { .. }
            | Event::PeerDisconnected { .. } => EventPriority::Network,

            Event::ClientRequestReceived { .. } | Event::ViewChangeRequested => {
                EventPriority::Client
            }
        }
    }

    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    pub fn is_network(&self) -> bool {
        self.priority() == EventPriority::Network
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            // Timers
            Event::HeartbeatTimer => "HeartbeatTimer",
            Event::CatchupTimer => "CatchupTimer",
            Event::ElectionTimer { .. } => "ElectionTimer",
            Event::RecoveryWindowTimer => "RecoveryWindowTimer",

            // Network
            Event::HeartbeatReceived { .. } => "HeartbeatReceived",
            Event::PrePrepareReceived { .. } => "PrePrepareReceived",
            Event::PrepareReceived { .. } => "PrepareReceived",
            Event::CommitReceived { .. } => "CommitReceived",
            Event::ViewChangeVoteReceived { .. } => "ViewChangeVoteReceived",
            Event::NewViewReceived { .. } => "NewViewReceived",
            Event::CatchupRequestReceived { .. } => "CatchupRequestReceived",
            Event::CatchupReplyReceived { .. } => "CatchupReplyReceived",
            Event::PeerDisconnected { .. } => "PeerDisconnected",

            // Internal
            Event::ViewChangeCompleted { .. } => "ViewChangeCompleted",

            // Client
            Event::ClientRequestReceived { .. } => "ClientRequestReceived",
            Event::ViewChangeRequested => "ViewChangeRequested",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::Internal < EventPriority::Timer);
        assert!(EventPriority::Timer < EventPriority::Network);
        assert!(EventPriority::Network < EventPriority::Client);
    }

    #[test]
    fn test_election_timer_carries_view() {
        let event = Event::from_timer(TimerId::Election(ViewNumber(7)));
        assert!(matches!(event, Event::ElectionTimer { view } if view == ViewNumber(7)));
        assert_eq!(event.priority(), EventPriority::Timer);
    }
}
