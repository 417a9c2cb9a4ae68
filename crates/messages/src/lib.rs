//! Network messages exchanged between replicas.
//!
//! Sender identity is carried inside each message. The transport is trusted
//! to deliver authenticated messages, so no signatures are attached here.

pub mod catchup;
pub mod status;
pub mod three_pc;
pub mod view_change;

pub use catchup::{CatchupReply, CatchupRequest};
pub use status::{Heartbeat, ReplicaMode, ReplicaStatus};
pub use three_pc::{Commit, PrePrepare, Prepare};
pub use view_change::{NewView, ViewChangeVote};

/// Marker for messages that travel over the replica transport.
pub trait NetworkMessage {
    /// Stable identifier used for routing and logging.
    fn message_type_id() -> &'static str;
}
