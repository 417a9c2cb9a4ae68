//! Restart-safety detection.
//!
//! A replica cannot see inside its peers. What it can see is whether they
//! heartbeat, whether they announce a restart, and whether the transport
//! reports them gone. This crate turns those signals into a decision about
//! whether the local view of the pool's 3PC state can still be trusted.
//!
//! # Components
//!
//! - [`PeerConnectivityTracker`] - Per-peer liveness, pure observation
//! - [`NetworkInconsistencyWatcher`] - Raises and clears the inconsistency flag
//!
//! # Incident lifecycle
//!
//! ```text
//!            uncertain <= f                 uncertain > threshold
//! disarmed ─────────────────> armed ────────────────────────────────> Raised
//!    ^                                                                   │
//!    │             uncertain <= f AND (log consistent OR view change)    │
//!    └──────────────────────────── Clear <───────────────────────────────┘
//! ```
//!
//! Raising disarms the watcher, so one incident fires exactly once no matter
//! how the uncertain count moves afterwards.

mod tracker;
mod watcher;

pub use tracker::{ConnectivityConfig, PeerConnectivityTracker, PeerState, PeerStatus};
pub use watcher::{NetworkInconsistencyWatcher, WatcherConfig};
