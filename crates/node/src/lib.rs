//! Replica session state machine.
//!
//! [`NodeStateMachine`] is one replica *session*: it is constructed fresh on
//! every (re)start from whatever the ledger recovered, and composes
//!
//! - ordering (`keel_bft::BftState`)
//! - view change (`keel_bft::ViewChangeCoordinator`)
//! - peer liveness and the inconsistency watcher (`keel_connectivity`)
//!
//! It also owns the catch-up protocol and the triggers that start elections:
//! primary disconnection, request timeout and operator signals.

mod catchup;
mod config;
mod state;

pub use catchup::{CatchupOutcome, CatchupPurpose, CatchupRound};
pub use config::ReplicaConfig;
pub use state::NodeStateMachine;
