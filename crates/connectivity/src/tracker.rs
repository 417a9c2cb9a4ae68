//! Per-peer liveness tracking.

use keel_messages::ReplicaStatus;
use keel_types::{NodeId, SeqNo, Topology, ViewNumber};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Configuration for liveness tracking.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// How often a replica heartbeats and re-evaluates its peers.
    pub heartbeat_interval: Duration,
    /// An alive peer silent for longer than this becomes unresponsive.
    pub silence_threshold: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(250),
            silence_threshold: Duration::from_secs(1),
        }
    }
}

impl ConnectivityConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_silence_threshold(mut self, threshold: Duration) -> Self {
        self.silence_threshold = threshold;
        self
    }
}

/// Observed liveness of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Heartbeating and participating in 3PC.
    Alive,
    /// Silent past the threshold, or reported gone by the transport.
    Unresponsive,
    /// Announced a fresh session and is still catching up.
    Restarting,
    /// Never heard from in this session.
    Unknown,
}

impl PeerState {
    /// Whether this peer's 3PC state is unknown to us.
    pub fn is_uncertain(self) -> bool {
        self != PeerState::Alive
    }
}

/// Everything known about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub node: NodeId,
    pub state: PeerState,
    pub last_seen: Option<Duration>,
    /// Last view the peer reported.
    pub view: ViewNumber,
    /// Last committed sequence number the peer reported.
    pub last_committed: SeqNo,
}

impl PeerStatus {
    fn unknown(node: NodeId) -> Self {
        Self {
            node,
            state: PeerState::Unknown,
            last_seen: None,
            view: ViewNumber::GENESIS,
            last_committed: SeqNo::ZERO,
        }
    }
}

/// Tracks the liveness of every other pool member.
///
/// Rebuilt from scratch with every session: all peers start `Unknown`.
/// Contains no quorum logic.
#[derive(Debug, Clone)]
pub struct PeerConnectivityTracker {
    local: NodeId,
    peers: BTreeMap<NodeId, PeerStatus>,
    silence_threshold: Duration,
}

impl PeerConnectivityTracker {
    pub fn new(topology: &dyn Topology, config: &ConnectivityConfig) -> Self {
        let peers = topology
            .peers()
            .into_iter()
            .map(|id| (id, PeerStatus::unknown(id)))
            .collect();
        Self {
            local: topology.local_node_id(),
            peers,
            silence_threshold: config.silence_threshold,
        }
    }

    /// Record a heartbeat. Returns the previous state if it changed.
    pub fn record_heartbeat(
        &mut self,
        peer: NodeId,
        now: Duration,
        status: &ReplicaStatus,
    ) -> Option<PeerState> {
        let local = self.local;
        let entry = self.peers.get_mut(&peer)?;
        let next = if status.is_participating() {
            PeerState::Alive
        } else {
            PeerState::Restarting
        };
        entry.last_seen = Some(now);
        entry.view = status.view;
        entry.last_committed = status.last_committed;
        Self::transition(local, entry, next)
    }

    /// A peer announced a fresh session.
    pub fn mark_restarting(&mut self, peer: NodeId, now: Duration) -> Option<PeerState> {
        let local = self.local;
        let entry = self.peers.get_mut(&peer)?;
        entry.last_seen = Some(now);
        Self::transition(local, entry, PeerState::Restarting)
    }

    /// The transport reported the peer gone.
    pub fn mark_unresponsive(&mut self, peer: NodeId) -> Option<PeerState> {
        let local = self.local;
        let entry = self.peers.get_mut(&peer)?;
        Self::transition(local, entry, PeerState::Unresponsive)
    }

    /// Demote peers silent for longer than the threshold. Returns the demoted peers.
    pub fn expire_silent(&mut self, now: Duration) -> Vec<NodeId> {
        let local = self.local;
        let threshold = self.silence_threshold;
        let mut expired = vec![];
        for entry in self.peers.values_mut() {
            if !matches!(entry.state, PeerState::Alive | PeerState::Restarting) {
                continue;
            }
            let silent_for = entry.last_seen.map_or(now, |seen| now.saturating_sub(seen));
            if silent_for > threshold
                && Self::transition(local, entry, PeerState::Unresponsive).is_some()
            {
                expired.push(entry.node);
            }
        }
        expired
    }

    fn transition(local: NodeId, entry: &mut PeerStatus, next: PeerState) -> Option<PeerState> {
        if entry.state == next {
            return None;
        }
        let previous = entry.state;
        debug!(
            node = %local,
            peer = %entry.node,
            from = ?previous,
            to = ?next,
            "Peer state changed"
        );
        entry.state = next;
        Some(previous)
    }

    pub fn status_of(&self, peer: NodeId) -> PeerState {
        self.peers.get(&peer).map_or(PeerState::Unknown, |s| s.state)
    }

    pub fn get(&self, peer: NodeId) -> Option<&PeerStatus> {
        self.peers.get(&peer)
    }

    /// Copy of the current per-peer status.
    pub fn snapshot(&self) -> BTreeMap<NodeId, PeerStatus> {
        self.peers.clone()
    }

    /// Peers whose 3PC state we cannot vouch for.
    pub fn uncertain_count(&self) -> usize {
        self.peers.values().filter(|s| s.state.is_uncertain()).count()
    }

    /// Alive peers, which by construction are participating.
    pub fn alive(&self) -> impl Iterator<Item = &PeerStatus> {
        self.peers.values().filter(|s| s.state == PeerState::Alive)
    }

    /// Alive peers reporting exactly this view and committed tip.
    pub fn corroborating(&self, view: ViewNumber, last_committed: SeqNo) -> usize {
        self.alive()
            .filter(|s| s.view == view && s.last_committed == last_committed)
            .count()
    }
}
