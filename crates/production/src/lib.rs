//! Production runner for keel replica pools.
//!
//! Wraps the deterministic [`NodeStateMachine`](keel_node::NodeStateMachine)
//! with tokio I/O:
//!
//! - Timers as cancellable tokio tasks ([`TimerManager`])
//! - Messages encoded with a versioned bincode codec ([`codec`])
//! - An in-process [`LocalHub`] transport behind the [`Transport`] trait
//! - Ledgers that outlive replica sessions ([`MemoryLedger`])
//!
//! # Architecture
//!
//! One task per replica owns its state machine. No locks are taken on the
//! event path.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  LocalPool                                                   │
//! │    ├─ ReplicaRunner 0 ── loop { select! { shutdown, timers,  │
//! │    ├─ ReplicaRunner 1          transport, commands } }       │
//! │    └─ ...                                                    │
//! │           │                          ▲                       │
//! │           ▼                          │                       │
//! │      LocalHub (frames, PeerDisconnected)                     │
//! │           │                                                  │
//! │           ▼                                                  │
//! │      broadcast::Sender<ReplicaEvent> → subscribers           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
mod pool;
mod runner;
mod storage;
pub mod telemetry;
mod timers;
pub mod transport;

pub use codec::CodecError;
pub use config::{ConfigError, PoolFileConfig};
pub use pool::{LocalPool, PoolError};
pub use runner::{Command, ReplicaEvent, ReplicaRunner, RunnerError};
pub use storage::MemoryLedger;
pub use telemetry::{init_tracing, TelemetryError};
pub use timers::TimerManager;
pub use transport::{Inbound, LocalHub, LocalTransport, Transport, TransportError};
