//! Deterministic simulation runner.
//!
//! Each replica has its own ledger that outlives its sessions. Stopping a
//! replica drops the session together with every event and timer queued for
//! it; starting it again recovers from the ledger and begins catch-up.

use crate::event_queue::EventKey;
use crate::ledger::SimLedger;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::notifications::NotificationLog;
use crate::NodeIndex;
use keel_bft::RecoveredState;
use keel_core::{Action, Event, Ledger, OutboundMessage, StateMachine, TimerId};
use keel_node::{NodeStateMachine, ReplicaConfig};
use keel_types::{
    ClientRequest, NodeId, PoolTopology, RequestId, SeqNo, Topology, TopologyError, ViewNumber,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// One pool member: its durable ledger and, while running, its session.
struct NodeSlot {
    topology: Arc<dyn Topology>,
    session: Option<NodeStateMachine>,
    ledger: SimLedger,
    /// Views the current session has been in, in order.
    views: Vec<ViewNumber>,
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed, produces identical results every run.
pub struct SimulationRunner {
    nodes: Vec<NodeSlot>,

    config: ReplicaConfig,

    /// Global event queue, ordered deterministically.
    event_queue: BTreeMap<EventKey, Event>,

    /// Sequence counter for deterministic ordering.
    sequence: u64,

    now: Duration,

    network: SimulatedNetwork,

    /// RNG for network conditions (seeded for determinism).
    rng: ChaCha8Rng,

    /// Maps (node, timer_id) -> event_key for replacement and cancellation.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,

    stats: SimulationStats,

    notifications: NotificationLog,

    /// Replies each replica sent per client request.
    client_replies: BTreeMap<RequestId, BTreeMap<NodeIndex, SeqNo>>,

    next_request_id: u64,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    /// Events processed by priority.
    pub events_by_priority: [u64; 4],
    pub actions_generated: u64,
    /// Messages scheduled for delivery.
    pub messages_sent: u64,
    pub messages_dropped_partition: u64,
    pub messages_dropped_loss: u64,
    /// Messages addressed to a stopped replica.
    pub messages_dropped_offline: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
    pub entries_appended: u64,
    pub restarts: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss + offline).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss + self.messages_dropped_offline
    }

    /// Message delivery rate (sent / (sent + dropped)).
    pub fn delivery_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_dropped();
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }
}

impl SimulationRunner {
    /// Create a runner for `network_config.pool_size` replicas. No replica
    /// is running until [`start_all`](Self::start_all) or
    /// [`start_node`](Self::start_node).
    pub fn new(
        network_config: NetworkConfig,
        config: ReplicaConfig,
        seed: u64,
    ) -> Result<Self, TopologyError> {
        let pool_size = network_config.pool_size;
        let mut nodes = Vec::with_capacity(pool_size as usize);
        for index in 0..pool_size {
            let topology = PoolTopology::sequential(NodeId(index), pool_size)?.into_arc();
            nodes.push(NodeSlot {
                topology,
                session: None,
                ledger: SimLedger::new(),
                views: vec![],
            });
        }

        info!(pool_size, seed, "Created simulation runner");

        Ok(Self {
            nodes,
            config,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimulatedNetwork::new(network_config),
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            stats: SimulationStats::default(),
            notifications: NotificationLog::default(),
            client_replies: BTreeMap::new(),
            next_request_id: 1,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn pool_size(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// The running session of a replica, `None` while it is stopped.
    pub fn node(&self, index: NodeIndex) -> Option<&NodeStateMachine> {
        self.nodes.get(index as usize)?.session.as_ref()
    }

    pub fn is_running(&self, index: NodeIndex) -> bool {
        self.node(index).is_some()
    }

    /// Replicas with a running session.
    pub fn running_nodes(&self) -> Vec<NodeIndex> {
        (0..self.pool_size())
            .filter(|&i| self.is_running(i))
            .collect()
    }

    pub fn ledger(&self, index: NodeIndex) -> Option<&SimLedger> {
        self.nodes.get(index as usize).map(|slot| &slot.ledger)
    }

    /// Views the current session of `index` has been in.
    pub fn session_views(&self, index: NodeIndex) -> &[ViewNumber] {
        self.nodes
            .get(index as usize)
            .map_or(&[], |slot| slot.views.as_slice())
    }

    pub fn notifications(&self) -> &NotificationLog {
        &self.notifications
    }

    /// Number of distinct replicas that answered `request_id`.
    pub fn reply_count(&self, request_id: RequestId) -> usize {
        self.client_replies.get(&request_id).map_or(0, BTreeMap::len)
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn start_all(&mut self) {
        for index in 0..self.pool_size() {
            self.start_node(index);
        }
    }

    /// Start a fresh session for `index` from what its ledger recovered.
    pub fn start_node(&mut self, index: NodeIndex) {
        let now = self.now;
        let retention = self.config.bft.committed_retention;
        let config = self.config.clone();
        let Some(slot) = self.nodes.get_mut(index as usize) else {
            warn!(node = index, "Cannot start unknown node");
            return;
        };
        if slot.session.is_some() {
            debug!(node = index, "Node already running");
            return;
        }

        let recovered = RecoveredState::from_ledger(&slot.ledger, retention);
        info!(
            node = index,
            last_committed = recovered.last_committed.0,
            view_floor = recovered.view_floor.0,
            time = ?now,
            "Starting node"
        );

        let mut session = NodeStateMachine::new(slot.topology.clone(), config, recovered);
        session.set_time(now);
        let actions = session.start();
        slot.views = vec![session.view().number];
        slot.session = Some(session);

        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(index, action);
        }
    }

    /// Stop `index`. Its queued events and timers are discarded and every
    /// running peer's transport notices the lost connection.
    pub fn stop_node(&mut self, index: NodeIndex) {
        let Some(slot) = self.nodes.get_mut(index as usize) else {
            return;
        };
        if slot.session.take().is_none() {
            return;
        }
        info!(node = index, time = ?self.now, "Stopping node");

        self.event_queue.retain(|key, _| key.node_index != index);
        self.timers.retain(|(node, _), _| *node != index);

        for peer in self.running_nodes() {
            let latency = self.network.sample_latency(&mut self.rng);
            self.schedule_event(
                peer,
                self.now + latency,
                Event::PeerDisconnected {
                    peer: NodeId(index),
                },
            );
        }
    }

    pub fn restart_node(&mut self, index: NodeIndex) {
        self.stop_node(index);
        self.start_node(index);
        self.stats.restarts += 1;
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Client / Operator
    // ═══════════════════════════════════════════════════════════════════════════

    /// Send a new request to every running replica. Returns its id.
    pub fn submit_request(&mut self, payload: impl Into<Vec<u8>>) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        let request = ClientRequest::new(id, payload);
        for node in self.running_nodes() {
            let latency = self.network.sample_latency(&mut self.rng);
            self.schedule_event(
                node,
                self.now + latency,
                Event::ClientRequestReceived {
                    request: request.clone(),
                },
            );
        }
        debug!(request = id.0, "Submitted client request");
        id
    }

    /// Ask every running replica to move to the next view.
    pub fn request_view_change(&mut self) {
        for node in self.running_nodes() {
            self.schedule_event(node, self.now, Event::ViewChangeRequested);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Event Loop
    // ═══════════════════════════════════════════════════════════════════════════

    /// Process every event up to and including `end_time`.
    pub fn run_until(&mut self, end_time: Duration) {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );
        while self.step(end_time) {}
        self.now = self.now.max(end_time);
        trace!(
            events_processed = self.stats.events_processed,
            actions_generated = self.stats.actions_generated,
            final_time = ?self.now,
            "Simulation step complete"
        );
    }

    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(self.now + duration);
    }

    /// Run until `condition` holds or `deadline` passes. Returns whether the
    /// condition was met.
    pub fn run_until_condition(
        &mut self,
        deadline: Duration,
        mut condition: impl FnMut(&SimulationRunner) -> bool,
    ) -> bool {
        loop {
            if condition(self) {
                return true;
            }
            if !self.step(deadline) {
                self.now = self.now.max(deadline);
                return condition(self);
            }
        }
    }

    /// Process the next event if it is due by `end_time`.
    fn step(&mut self, end_time: Duration) -> bool {
        let Some((&key, _)) = self.event_queue.first_key_value() else {
            return false;
        };
        if key.time > end_time {
            return false;
        }
        let Some((key, event)) = self.event_queue.pop_first() else {
            return false;
        };
        self.now = key.time;
        let node_index = key.node_index;

        if let Event::HeartbeatTimer
        | Event::CatchupTimer
        | Event::ElectionTimer { .. }
        | Event::RecoveryWindowTimer = event
        {
            self.timers.retain(|_, k| *k != key);
        }

        trace!(
            time = ?self.now,
            node = node_index,
            event = event.type_name(),
            "Processing event"
        );

        self.stats.events_processed += 1;
        self.stats.events_by_priority[event.priority() as usize] += 1;

        let Some(slot) = self.nodes.get_mut(node_index as usize) else {
            return true;
        };
        let Some(session) = slot.session.as_mut() else {
            return true;
        };
        session.set_time(self.now);
        let actions = session.handle(event);
        let view = session.view().number;
        if slot.views.last() != Some(&view) {
            slot.views.push(view);
        }

        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            self.process_action(node_index, action);
        }
        true
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in 0..self.pool_size() {
                    if to != from {
                        self.try_deliver_message(from, to, message.clone());
                    }
                }
            }

            Action::Send { to, message } => {
                self.try_deliver_message(from, to.0, message);
            }

            Action::SetTimer { id, duration } => {
                if let Some(old) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&old);
                }
                let key = self.schedule_event(from, self.now + duration, Event::from_timer(id));
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::EnqueueInternal { event } => {
                self.schedule_event(from, self.now, event);
            }

            Action::AppendCommitted { entry } => {
                let Some(slot) = self.nodes.get_mut(from as usize) else {
                    return;
                };
                let seq = entry.seq;
                match slot.ledger.append_committed(entry) {
                    Ok(()) => {
                        self.stats.entries_appended += 1;
                        trace!(node = from, seq = seq.0, "Ledger append");
                    }
                    Err(e) => warn!(node = from, error = %e, "Ledger append rejected"),
                }
            }

            Action::ReplyToClient {
                request_id, seq, ..
            } => {
                self.client_replies
                    .entry(request_id)
                    .or_default()
                    .insert(from, seq);
            }

            Action::Notify { notification } => {
                debug!(
                    node = from,
                    notification = notification.type_name(),
                    "Notification"
                );
                self.notifications.record(from, self.now, notification);
            }
        }
    }

    fn schedule_event(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        self.sequence += 1;
        let key = EventKey::new(time, &event, node, self.sequence);
        self.event_queue.insert(key, event);
        key
    }

    fn try_deliver_message(&mut self, from: NodeIndex, to: NodeIndex, message: OutboundMessage) {
        if !self.is_running(to) {
            self.stats.messages_dropped_offline += 1;
            return;
        }

        // Partition first: deterministic, doesn't consume RNG.
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            trace!(from = from, to = to, "Message dropped due to partition");
            return;
        }

        if self.network.should_drop_packet(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            trace!(from = from, to = to, "Message dropped due to packet loss");
            return;
        }

        let latency = self.network.sample_latency(&mut self.rng);
        self.schedule_event(to, self.now + latency, message.into_event());
        self.stats.messages_sent += 1;
    }
}
