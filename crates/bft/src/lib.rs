//! Ordering and view change for a keel replica.
//!
//! Two synchronous state machines live here:
//!
//! - [`BftState`] orders client requests within a view through
//!   pre-prepare / prepare / commit and hands finalized entries to the
//!   ledger in sequence order.
//! - [`ViewChangeCoordinator`] elects a new primary when the current one
//!   stops making progress.
//!
//! Neither performs I/O. The node composes them and the runner executes the
//! returned `Action`s.
//!
//! # Terminology
//!
//! - **View**: A period with one primary, `members[view % n]`. Views only grow.
//! - **Sequence number**: Position in the committed log. Strictly sequential.
//! - **Strong quorum**: `n - f` replicas, where `f = (n - 1) / 3`. Any two strong
//!   quorums share an honest replica.
//! - **Weak quorum**: `f + 1` replicas. At least one of them is honest.
//!
//! # Safety
//!
//! - A replica accepts at most one digest per `(view, seq)`.
//! - An entry is finalized only after a strong quorum of prepares and then a
//!   strong quorum of commits for the same digest.
//! - A new view carries every prepared certificate above the quorum's commit
//!   floor and re-proposes it at its original sequence number.
//! - Finalization re-checks the commit gate immediately before appending.
//!
//! # Liveness
//!
//! - Elections time out with exponential backoff. Each retry targets a strictly
//!   higher candidate view.
//! - A replica seeing `f + 1` votes for a higher view joins that election.

mod config;
mod state;
mod three_pc;
mod view_change;

pub use config::BftConfig;
pub use state::{BftState, BftStats, RecoveredState};
pub use three_pc::{Phase, ThreePcEntry, ThreePcError, ThreePcLog};
pub use view_change::{
    CoordinatorPhase, ElectionTrigger, ViewChangeCoordinator, VoteEvidence, MAX_BACKOFF_EXPONENT,
};
