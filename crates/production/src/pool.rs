//! A pool of replicas running in one process.

use crate::runner::{Command, ReplicaEvent, ReplicaRunner, RunnerError};
use crate::storage::MemoryLedger;
use crate::transport::{LocalHub, TransportError};
use keel_bft::RecoveredState;
use keel_node::{NodeStateMachine, ReplicaConfig};
use keel_types::{ClientRequest, NodeId, PoolTopology, RequestId, Topology, TopologyError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("node {0} is not a pool member")]
    UnknownNode(u32),

    #[error("node {0} is already running")]
    AlreadyRunning(u32),

    #[error("topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("replica task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("replica runner: {0}")]
    Runner(#[from] RunnerError),
}

struct RunningReplica {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), RunnerError>>,
}

struct ReplicaSlot {
    topology: Arc<dyn Topology>,
    ledger: MemoryLedger,
    running: Option<RunningReplica>,
}

/// Replicas connected through a [`LocalHub`], each on its own task.
///
/// Ledgers belong to the pool and survive restarts.
pub struct LocalPool {
    config: ReplicaConfig,
    hub: Arc<LocalHub>,
    slots: Vec<ReplicaSlot>,
    events_tx: broadcast::Sender<ReplicaEvent>,
    next_request_id: u64,
}

impl LocalPool {
    pub fn new(pool_size: u32, config: ReplicaConfig) -> Result<Self, PoolError> {
        let mut slots = Vec::with_capacity(pool_size as usize);
        for index in 0..pool_size {
            slots.push(ReplicaSlot {
                topology: PoolTopology::sequential(NodeId(index), pool_size)?.into_arc(),
                ledger: MemoryLedger::new(),
                running: None,
            });
        }
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            hub: LocalHub::new(),
            slots,
            events_tx,
            next_request_id: 1,
        })
    }

    pub fn pool_size(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Notifications and client replies from every replica.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events_tx.subscribe()
    }

    pub fn ledger(&self, node: u32) -> Option<&MemoryLedger> {
        self.slots.get(node as usize).map(|s| &s.ledger)
    }

    pub fn is_running(&self, node: u32) -> bool {
        self.slots
            .get(node as usize)
            .is_some_and(|s| s.running.is_some())
    }

    pub fn running_nodes(&self) -> Vec<u32> {
        (0..self.pool_size()).filter(|&n| self.is_running(n)).collect()
    }

    pub fn start_all(&mut self) -> Result<(), PoolError> {
        for node in 0..self.pool_size() {
            self.start(node)?;
        }
        Ok(())
    }

    /// Spawn a fresh session for `node`, recovered from its ledger.
    pub fn start(&mut self, node: u32) -> Result<(), PoolError> {
        let slot = self
            .slots
            .get_mut(node as usize)
            .ok_or(PoolError::UnknownNode(node))?;
        if slot.running.is_some() {
            return Err(PoolError::AlreadyRunning(node));
        }

        let (transport, inbound_rx) = self.hub.connect(NodeId(node))?;
        let recovered =
            RecoveredState::from_ledger(&slot.ledger, self.config.bft.committed_retention);
        let state = NodeStateMachine::new(slot.topology.clone(), self.config.clone(), recovered);
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let runner = ReplicaRunner::new(
            state,
            Arc::new(transport),
            inbound_rx,
            command_rx,
            slot.ledger.clone(),
            self.events_tx.clone(),
            shutdown.clone(),
        );

        info!(node, "Spawning replica");
        slot.running = Some(RunningReplica {
            commands,
            shutdown,
            task: tokio::spawn(runner.run()),
        });
        Ok(())
    }

    /// Stop `node` and wait for its task to finish. Peers are told the
    /// connection dropped.
    pub async fn stop(&mut self, node: u32) -> Result<(), PoolError> {
        let slot = self
            .slots
            .get_mut(node as usize)
            .ok_or(PoolError::UnknownNode(node))?;
        let Some(running) = slot.running.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        let result = running.task.await;
        self.hub.disconnect(NodeId(node));
        info!(node, "Replica stopped");
        result??;
        Ok(())
    }

    pub async fn restart(&mut self, node: u32) -> Result<(), PoolError> {
        self.stop(node).await?;
        self.start(node)
    }

    /// Send a new request to every running replica.
    pub async fn submit(&mut self, payload: impl Into<Vec<u8>>) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        let request = ClientRequest::new(id, payload);
        self.broadcast_command(Command::Submit(request)).await;
        id
    }

    pub async fn request_view_change(&self) {
        self.broadcast_command(Command::RequestViewChange).await;
    }

    async fn broadcast_command(&self, command: Command) {
        for (node, slot) in self.slots.iter().enumerate() {
            let Some(running) = &slot.running else {
                continue;
            };
            if running.commands.send(command.clone()).await.is_err() {
                debug!(node, "Replica no longer accepting commands");
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        for node in self.running_nodes() {
            self.stop(node).await?;
        }
        Ok(())
    }
}
