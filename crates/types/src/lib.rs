//! Core types for Keel replica pools.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Identifiers**: NodeId, ViewNumber, SeqNo, RequestId
//! - **Content**: Digest, ClientRequest, CommittedEntry, PreparedCertificate
//! - **Consensus types**: View, Topology
//! - **Restart safety**: InconsistencyFlag and the CommitGate that reads it
//!
//! It does not depend on any other workspace crate.

mod digest;
mod gate;
mod identifiers;
mod request;
mod topology;
mod view;

pub use digest::Digest;
pub use gate::{CommitGate, InconsistencyFlag};
pub use identifiers::{NodeId, RequestId, SeqNo, ViewNumber};
pub use request::{ClientRequest, CommittedEntry, PreparedCertificate};
pub use topology::{PoolTopology, Topology, TopologyError};
pub use view::View;
