//! Protocol-level notifications surfaced to the embedding process.

use keel_types::{Digest, NodeId, SeqNo, ViewNumber};
use std::time::Duration;

/// Something an operator or test harness may want to observe.
///
/// Emitted via `Action::Notify`. None of these are errors the state machine
/// propagates: each has a defined handler inside the replica already, and the
/// notification only reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeNotification {
    /// The watcher concluded this replica's 3PC state may be inconsistent
    /// with the pool. Fires once per incident.
    InconsistentThreePcState {
        uncertain_peers: usize,
        pool_size: usize,
    },

    /// The incident raised by the watcher is over.
    InconsistencyResolved { resolution: Resolution },

    ViewChangeCompleted { view: ViewNumber, primary: NodeId },

    /// A fresh session finished catching up and now participates.
    CatchupCompleted {
        view: ViewNumber,
        last_committed: SeqNo,
    },

    EntryCommitted {
        view: ViewNumber,
        seq: SeqNo,
        digest: Digest,
    },

    LivenessFault(LivenessFault),
}

impl NodeNotification {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeNotification::InconsistentThreePcState { .. } => "InconsistentThreePcState",
            NodeNotification::InconsistencyResolved { .. } => "InconsistencyResolved",
            NodeNotification::ViewChangeCompleted { .. } => "ViewChangeCompleted",
            NodeNotification::CatchupCompleted { .. } => "CatchupCompleted",
            NodeNotification::EntryCommitted { .. } => "EntryCommitted",
            NodeNotification::LivenessFault(_) => "LivenessFault",
        }
    }
}

/// Evidence that cleared an inconsistency incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// A quorum of peers confirmed the same view and committed tip.
    LogConsistent,
    /// A view change to a higher view completed.
    ViewChangeCompleted,
}

/// Liveness failures. The replica keeps retrying after reporting one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LivenessFault {
    #[error("no quorum for view {candidate} after {attempts} election attempts")]
    QuorumUnreachable {
        candidate: ViewNumber,
        attempts: u32,
    },

    #[error("inconsistency raised at {raised_at:?} still unresolved after {window:?}")]
    InconsistencyUnresolved {
        raised_at: Duration,
        window: Duration,
    },
}
