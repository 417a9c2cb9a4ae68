//! Core vocabulary for keel replicas.
//!
//! - [`Event`]: All possible inputs to a replica
//! - [`Action`]: All possible outputs from a replica
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait a replica implements
//! - [`Ledger`]: The durable committed log a replica writes through
//!
//! # Architecture
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts action results back into events

mod action;
mod event;
mod ledger;
mod message;
mod notification;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use ledger::{check_next, Ledger, LedgerError};
pub use message::OutboundMessage;
pub use notification::{LivenessFault, NodeNotification, Resolution};
pub use traits::StateMachine;

use keel_types::ViewNumber;

/// Timer identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerId {
    /// Periodic heartbeat and liveness evaluation.
    Heartbeat,
    /// Catch-up wait.
    Catchup,
    /// Election deadline for one candidate view.
    Election(ViewNumber),
    /// Deadline for resolving an inconsistency incident.
    RecoveryWindow,
}
