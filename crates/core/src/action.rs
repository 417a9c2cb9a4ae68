//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, Event, NodeNotification, TimerId};
use keel_types::{CommittedEntry, NodeId, RequestId, SeqNo, ViewNumber};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to every other pool member.
    Broadcast { message: OutboundMessage },

    /// Send a message to one peer.
    Send { to: NodeId, message: OutboundMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Re-setting an armed timer replaces it.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Internal events are processed at the same timestamp with higher
    /// priority than external events, preserving causality.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Append a finalized entry to the durable ledger.
    AppendCommitted { entry: CommittedEntry },

    // ═══════════════════════════════════════════════════════════════════════
    // External Notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Tell the submitting client its request was ordered.
    ReplyToClient {
        request_id: RequestId,
        view: ViewNumber,
        seq: SeqNo,
    },

    /// Report a protocol-level event to the embedding process.
    Notify { notification: NodeNotification },
}

impl Action {
    /// Check if this action performs network I/O.
    pub fn is_network(&self) -> bool {
        matches!(self, Action::Broadcast { .. } | Action::Send { .. })
    }

    /// Check if this is an internal event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }

    /// Check if this is a storage write action.
    pub fn is_storage_write(&self) -> bool {
        matches!(self, Action::AppendCommitted { .. })
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Send { .. } => "Send",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::AppendCommitted { .. } => "AppendCommitted",
            Action::ReplyToClient { .. } => "ReplyToClient",
            Action::Notify { .. } => "Notify",
        }
    }
}
