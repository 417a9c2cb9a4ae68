//! Deterministic simulation of a keel replica pool.
//!
//! Every replica runs in one thread against a single event queue ordered by
//! `(time, priority, node, sequence)`. Network latency and loss are drawn
//! from a seeded `ChaCha8Rng`, so a seed fully determines a run.
//!
//! Restarts are modelled the way they happen in production: the session is
//! dropped together with its queued events and timers, its ledger survives,
//! and a new session is built from what the ledger recovered.

mod event_queue;
mod ledger;
mod network;
mod notifications;
mod orchestrator;
mod runner;

pub use event_queue::EventKey;
pub use ledger::SimLedger;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use notifications::{NotificationLog, NotificationRecord};
pub use orchestrator::{
    ensure_all_nodes_have_same_data, ensure_view_change_complete, ledgers_consistent,
    pool_is_functional, pool_is_stable, RestartError, RestartGroup, RestartPlan,
    RestartRecoveryOrchestrator, RestartTiming,
};
pub use runner::{SimulationRunner, SimulationStats};

/// Index of a replica in the simulated pool. Equal to its `NodeId`.
pub type NodeIndex = u32;
