//! Node state machine.

use crate::catchup::{CatchupOutcome, CatchupPurpose, CatchupRound};
use crate::config::ReplicaConfig;
use keel_bft::{BftState, ElectionTrigger, RecoveredState, ViewChangeCoordinator, VoteEvidence};
use keel_connectivity::{NetworkInconsistencyWatcher, PeerConnectivityTracker, PeerState};
use keel_core::{Action, Event, NodeNotification, OutboundMessage, StateMachine, TimerId};
use keel_messages::{CatchupReply, CatchupRequest, Heartbeat, ReplicaMode, ReplicaStatus};
use keel_types::{
    CommitGate, InconsistencyFlag, NodeId, PreparedCertificate, SeqNo, Topology, View, ViewNumber,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// One replica session.
///
/// Composes ordering, view change, peer liveness and the inconsistency
/// watcher into a single state machine. A restart discards the whole value
/// and builds a new one from the ledger.
pub struct NodeStateMachine {
    topology: Arc<dyn Topology>,

    config: ReplicaConfig,

    /// Shared by the watcher (writer) and the ordering path (reader).
    gate: CommitGate,

    bft: BftState,

    coordinator: ViewChangeCoordinator,

    tracker: PeerConnectivityTracker,

    watcher: NetworkInconsistencyWatcher,

    mode: ReplicaMode,

    /// The catch-up round in progress, if any.
    catchup: Option<CatchupRound>,

    /// When the current primary was first seen unreachable.
    primary_lost_since: Option<Duration>,

    /// Last committed sequence number at the previous heartbeat tick.
    committed_at_last_tick: SeqNo,

    now: Duration,
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("node", &self.node_id())
            .field("mode", &self.mode)
            .field("flag", &self.gate.flag())
            .field("bft", &self.bft)
            .field("now", &self.now)
            .finish()
    }
}

impl NodeStateMachine {
    /// Build a fresh session.
    ///
    /// `recovered` comes from the ledger. Use `RecoveredState::default()` for
    /// a replica that never committed anything.
    pub fn new(
        topology: Arc<dyn Topology>,
        config: ReplicaConfig,
        recovered: RecoveredState,
    ) -> Self {
        let gate = CommitGate::new();
        let coordinator =
            ViewChangeCoordinator::new(topology.clone(), &config.bft, recovered.view_floor);
        let tracker = PeerConnectivityTracker::new(topology.as_ref(), &config.connectivity);
        let watcher = NetworkInconsistencyWatcher::new(
            topology.as_ref(),
            config.watcher.clone(),
            gate.clone(),
        );
        let committed_at_last_tick = recovered.last_committed;
        let bft = BftState::new(topology.clone(), config.bft.clone(), gate.clone(), recovered);

        Self {
            topology,
            config,
            gate,
            bft,
            coordinator,
            tracker,
            watcher,
            mode: ReplicaMode::CatchingUp,
            catchup: None,
            primary_lost_since: None,
            committed_at_last_tick,
            now: Duration::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn node_id(&self) -> NodeId {
        self.topology.local_node_id()
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn bft(&self) -> &BftState {
        &self.bft
    }

    pub fn coordinator(&self) -> &ViewChangeCoordinator {
        &self.coordinator
    }

    pub fn tracker(&self) -> &PeerConnectivityTracker {
        &self.tracker
    }

    pub fn watcher(&self) -> &NetworkInconsistencyWatcher {
        &self.watcher
    }

    pub fn flag(&self) -> InconsistencyFlag {
        self.gate.flag()
    }

    pub fn mode(&self) -> ReplicaMode {
        self.mode
    }

    pub fn is_participating(&self) -> bool {
        self.mode == ReplicaMode::Participating
    }

    pub fn view(&self) -> &View {
        self.bft.view()
    }

    pub fn last_committed(&self) -> SeqNo {
        self.bft.last_committed()
    }

    pub fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            view: self.bft.view().number,
            last_committed: self.bft.last_committed(),
            mode: self.mode,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Session start and catch-up
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start the session: heartbeats plus a catch-up round.
    pub fn start(&mut self) -> Vec<Action> {
        info!(
            node = %self.node_id(),
            view = self.bft.view().number.0,
            last_committed = self.bft.last_committed().0,
            "Replica session starting"
        );

        let mut actions = vec![
            Action::SetTimer {
                id: TimerId::Heartbeat,
                duration: self.config.connectivity.heartbeat_interval,
            },
            self.heartbeat(),
        ];

        self.catchup = Some(CatchupRound::new(CatchupPurpose::Restart));
        if self.catchup_quorum() == 0 {
            // Single-replica pool: nobody to ask.
            actions.extend(self.try_finish_catchup());
            return actions;
        }

        actions.push(self.catchup_request(true));
        actions.push(Action::SetTimer {
            id: TimerId::Catchup,
            duration: self.config.catchup_timeout,
        });
        actions
    }

    /// Peers a fresh session must hear from: `n - f - 1`.
    fn catchup_quorum(&self) -> usize {
        self.topology.strong_quorum() - 1
    }

    fn heartbeat(&self) -> Action {
        Action::Broadcast {
            message: OutboundMessage::Heartbeat(Heartbeat {
                sender: self.node_id(),
                status: self.status(),
            }),
        }
    }

    fn catchup_request(&self, restarting: bool) -> Action {
        Action::Broadcast {
            message: OutboundMessage::CatchupRequest(CatchupRequest {
                requester: self.node_id(),
                view: self.bft.view().number,
                last_committed: self.bft.last_committed(),
                restarting,
            }),
        }
    }

    fn on_catchup_request(&mut self, request: CatchupRequest) -> Vec<Action> {
        if request.requester == self.node_id() || !self.topology.is_member(request.requester) {
            return vec![];
        }

        let mut actions = vec![];
        if request.restarting {
            self.tracker.mark_restarting(request.requester, self.now);
            actions.extend(self.reassess());
        }

        let reply = CatchupReply {
            responder: self.node_id(),
            view: self.bft.view().number,
            participating: self.is_participating(),
            last_committed: self.bft.last_committed(),
            entries: self
                .bft
                .committed_after(request.last_committed, self.config.bft.committed_retention),
        };
        trace!(
            to = %request.requester,
            entries = reply.entries.len(),
            "Answering catch-up request"
        );
        actions.push(Action::Send {
            to: request.requester,
            message: OutboundMessage::CatchupReply(Box::new(reply)),
        });
        actions
    }

    fn on_catchup_reply(&mut self, reply: CatchupReply) -> Vec<Action> {
        if reply.responder == self.node_id() || !self.topology.is_member(reply.responder) {
            return vec![];
        }
        let Some(round) = self.catchup.as_mut() else {
            trace!(from = %reply.responder, "Catch-up reply outside a round");
            return vec![];
        };
        round.record(reply);
        self.try_finish_catchup()
    }

    fn on_catchup_timer(&mut self) -> Vec<Action> {
        let Some(round) = self.catchup.as_mut() else {
            return vec![];
        };
        round.on_timeout();
        let purpose = round.purpose();
        let replies = round.reply_count();

        let mut actions = self.try_finish_catchup();
        if self.catchup.is_none() {
            return actions;
        }

        match purpose {
            CatchupPurpose::Restart => {
                debug!(
                    node = %self.node_id(),
                    replies,
                    needed = self.catchup_quorum(),
                    "Catch-up incomplete, asking again"
                );
                actions.push(self.catchup_request(true));
                actions.push(Action::SetTimer {
                    id: TimerId::Catchup,
                    duration: self.config.catchup_timeout,
                });
            }
            CatchupPurpose::LagSync => {
                debug!(node = %self.node_id(), replies, "Lag sync round expired");
                self.catchup = None;
            }
        }
        actions
    }

    fn try_finish_catchup(&mut self) -> Vec<Action> {
        let Some(round) = self.catchup.as_ref() else {
            return vec![];
        };
        let tip = self.bft.last_committed();
        let weak = self.topology.weak_quorum();

        match round.purpose() {
            CatchupPurpose::Restart => {
                let Some(outcome) = round.restart_outcome(self.catchup_quorum(), weak, tip) else {
                    return vec![];
                };
                self.catchup = None;
                self.complete_restart(outcome)
            }
            CatchupPurpose::LagSync => {
                let Some(outcome) = round.lag_outcome(weak, tip) else {
                    return vec![];
                };
                self.catchup = None;
                debug!(
                    node = %self.node_id(),
                    entries = outcome.entries.len(),
                    "Lag sync complete"
                );
                let mut actions = vec![Action::CancelTimer {
                    id: TimerId::Catchup,
                }];
                for entry in outcome.entries {
                    actions.extend(self.bft.apply_synced(entry));
                }
                actions.extend(self.reassess());
                actions
            }
        }
    }

    fn complete_restart(&mut self, outcome: CatchupOutcome) -> Vec<Action> {
        let mut actions = vec![Action::CancelTimer {
            id: TimerId::Catchup,
        }];
        for entry in outcome.entries {
            actions.extend(self.bft.apply_synced(entry));
        }

        // Never adopt a view below our own.
        let target = outcome.view.max(self.bft.view().number);
        actions.extend(self.adopt_view(target));

        self.mode = ReplicaMode::Participating;
        self.watcher.on_caught_up();
        actions.extend(self.bft.start_participating());
        self.primary_lost_since = None;
        self.committed_at_last_tick = self.bft.last_committed();

        let view = self.bft.view().number;
        let last_committed = self.bft.last_committed();
        info!(
            node = %self.node_id(),
            view = view.0,
            last_committed = last_committed.0,
            responders = outcome.responders,
            "Catch-up complete, participating"
        );
        actions.push(Action::Notify {
            notification: NodeNotification::CatchupCompleted {
                view,
                last_committed,
            },
        });
        actions.push(self.heartbeat());
        actions.extend(self.reassess());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Liveness
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_heartbeat(&mut self, heartbeat: Heartbeat) -> Vec<Action> {
        if heartbeat.sender == self.node_id() {
            return vec![];
        }
        self.tracker
            .record_heartbeat(heartbeat.sender, self.now, &heartbeat.status);
        self.reassess()
    }

    fn on_peer_disconnected(&mut self, peer: NodeId) -> Vec<Action> {
        if self.tracker.mark_unresponsive(peer).is_some() {
            debug!(node = %self.node_id(), %peer, "Transport lost peer");
        }
        self.reassess()
    }

    /// Let the watcher re-evaluate after connectivity or log state changed.
    fn reassess(&mut self) -> Vec<Action> {
        let uncertain = self.tracker.uncertain_count();
        let mut actions = self.watcher.evaluate(uncertain);

        if self.watcher.flag() == InconsistencyFlag::Raised {
            let corroborating = 1 + self
                .tracker
                .corroborating(self.bft.view().number, self.bft.last_committed());
            let cleared = self.watcher.try_clear(uncertain, corroborating);
            if !cleared.is_empty() {
                actions.extend(cleared);
                actions.extend(self.bft.on_gate_opened());
                actions.extend(self.watcher.evaluate(uncertain));
            }
        }
        actions
    }

    fn on_heartbeat_timer(&mut self) -> Vec<Action> {
        let mut actions = vec![
            self.heartbeat(),
            Action::SetTimer {
                id: TimerId::Heartbeat,
                duration: self.config.connectivity.heartbeat_interval,
            },
        ];

        let expired = self.tracker.expire_silent(self.now);
        if !expired.is_empty() {
            debug!(node = %self.node_id(), ?expired, "Peers went silent");
        }
        actions.extend(self.reassess());

        if self.is_participating() {
            actions.extend(self.sync_view());
            actions.extend(self.check_primary());
            actions.extend(self.check_request_timeout());
            actions.extend(self.check_lag());
            actions.extend(self.coordinator.rebroadcast_vote());
        }

        self.committed_at_last_tick = self.bft.last_committed();
        actions
    }

    /// Adopt the view reported by `f + 1` live peers if it is above ours.
    fn sync_view(&mut self) -> Vec<Action> {
        let f = self.topology.fault_tolerance();
        let mut views: Vec<ViewNumber> = self.tracker.alive().map(|s| s.view).collect();
        if views.len() <= f {
            return vec![];
        }
        views.sort_unstable_by(|a, b| b.cmp(a));
        let target = views[f];
        if target <= self.bft.view().number {
            return vec![];
        }

        info!(
            node = %self.node_id(),
            from = self.bft.view().number.0,
            to = target.0,
            "Peers moved to a higher view, following"
        );
        let mut actions = self.adopt_view(target);
        let view = self.bft.view().clone();
        self.watcher.on_view_change_completed();
        actions.push(Action::Notify {
            notification: NodeNotification::ViewChangeCompleted {
                view: view.number,
                primary: view.primary,
            },
        });
        actions.extend(self.reassess());
        actions
    }

    /// Jump to `target` without an election of our own.
    fn adopt_view(&mut self, target: ViewNumber) -> Vec<Action> {
        let Some((view, mut actions)) = self.coordinator.fast_forward(target) else {
            return vec![];
        };
        actions.extend(self.bft.enter_view(view, SeqNo::ZERO, vec![]));
        self.primary_lost_since = None;
        actions
    }

    fn check_primary(&mut self) -> Vec<Action> {
        let primary = self.bft.view().primary;
        if primary == self.node_id() {
            self.primary_lost_since = None;
            return vec![];
        }

        if self.tracker.status_of(primary) == PeerState::Alive {
            self.primary_lost_since = None;
            if self.coordinator.is_electing() {
                let mut actions = self.coordinator.abandon_if_primary_back();
                actions.extend(self.sync_electing());
                return actions;
            }
            return vec![];
        }

        let since = *self.primary_lost_since.get_or_insert(self.now);
        if self.coordinator.is_electing()
            || self.now.saturating_sub(since) < self.config.tolerate_primary_disconnection
        {
            return vec![];
        }
        warn!(
            node = %self.node_id(),
            %primary,
            lost_for = ?self.now.saturating_sub(since),
            "Primary unreachable, starting election"
        );
        self.start_election(ElectionTrigger::PrimaryDisconnected)
    }

    fn check_request_timeout(&mut self) -> Vec<Action> {
        if self.watcher.flag() != InconsistencyFlag::Clear || self.coordinator.is_electing() {
            return vec![];
        }
        match self.bft.oldest_pending_age() {
            Some(age) if age >= self.config.bft.request_timeout => {
                warn!(node = %self.node_id(), ?age, "Request timed out, starting election");
                self.start_election(ElectionTrigger::RequestTimeout)
            }
            _ => vec![],
        }
    }

    /// Start a lag-sync round when `f + 1` live peers are ahead and we made no progress.
    fn check_lag(&mut self) -> Vec<Action> {
        if self.catchup.is_some() {
            return vec![];
        }
        let tip = self.bft.last_committed();
        if tip != self.committed_at_last_tick {
            return vec![];
        }
        let ahead = self
            .tracker
            .alive()
            .filter(|s| s.last_committed > tip)
            .count();
        if ahead < self.topology.weak_quorum() {
            return vec![];
        }

        info!(node = %self.node_id(), last_committed = tip.0, ahead, "Behind peers, syncing");
        self.catchup = Some(CatchupRound::new(CatchupPurpose::LagSync));
        vec![
            self.catchup_request(false),
            Action::SetTimer {
                id: TimerId::Catchup,
                duration: self.config.catchup_timeout,
            },
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════════

    fn evidence(&self) -> VoteEvidence {
        VoteEvidence {
            last_committed: self.bft.last_committed(),
            prepared: self.bft.prepared_certificates(),
        }
    }

    fn start_election(&mut self, trigger: ElectionTrigger) -> Vec<Action> {
        let evidence = self.evidence();
        let mut actions = self.coordinator.start_election(trigger, evidence);
        actions.extend(self.sync_electing());
        actions
    }

    /// Mirror the coordinator's phase into the ordering state.
    fn sync_electing(&mut self) -> Vec<Action> {
        if self.coordinator.current_view().number > self.bft.view().number {
            // A view was installed; ViewChangeCompleted moves ordering over.
            return vec![];
        }
        self.bft.set_electing(self.coordinator.is_electing())
    }

    fn on_view_change_completed(
        &mut self,
        view: View,
        floor: SeqNo,
        reproposals: Vec<PreparedCertificate>,
    ) -> Vec<Action> {
        let number = view.number;
        let primary = view.primary;

        // Resolve the incident first so the new primary can propose right away.
        self.watcher.on_view_change_completed();
        let mut actions = self.reassess();
        actions.extend(self.bft.enter_view(view, floor, reproposals));
        self.primary_lost_since = None;

        actions.push(Action::Notify {
            notification: NodeNotification::ViewChangeCompleted {
                view: number,
                primary,
            },
        });
        actions
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        let participating = self.is_participating();
        match event {
            // Timers
            Event::HeartbeatTimer => self.on_heartbeat_timer(),
            Event::CatchupTimer => self.on_catchup_timer(),
            Event::ElectionTimer { view } if participating => {
                let evidence = self.evidence();
                let mut actions = self.coordinator.on_election_timer(view, evidence);
                actions.extend(self.sync_electing());
                actions
            }
            Event::RecoveryWindowTimer => self.watcher.on_recovery_window_elapsed(),

            // Connectivity
            Event::HeartbeatReceived { heartbeat } => self.on_heartbeat(heartbeat),
            Event::PeerDisconnected { peer } => self.on_peer_disconnected(peer),

            // Catch-up runs in every mode.
            Event::CatchupRequestReceived { request } => self.on_catchup_request(request),
            Event::CatchupReplyReceived { reply } => self.on_catchup_reply(reply),

            // 3PC
            Event::PrePrepareReceived { pre_prepare } if participating => {
                self.bft.on_pre_prepare(pre_prepare)
            }
            Event::PrepareReceived { prepare } if participating => self.bft.on_prepare(prepare),
            Event::CommitReceived { commit } if participating => self.bft.on_commit(commit),

            // View change
            Event::ViewChangeVoteReceived { vote } if participating => {
                let evidence = self.evidence();
                let mut actions = self.coordinator.on_view_change_vote(vote, evidence);
                actions.extend(self.sync_electing());
                actions
            }
            Event::NewViewReceived { new_view } if participating => {
                let mut actions = self.coordinator.on_new_view(new_view);
                actions.extend(self.sync_electing());
                actions
            }
            Event::ViewChangeCompleted {
                view,
                floor,
                reproposals,
            } => self.on_view_change_completed(view, floor, reproposals),

            // Client / operator
            Event::ClientRequestReceived { request } => self.bft.on_client_request(request),
            Event::ViewChangeRequested if participating => {
                info!(node = %self.node_id(), "Operator requested a view change");
                self.start_election(ElectionTrigger::Operator)
            }

            other => {
                trace!(
                    node = %self.node_id(),
                    event = other.type_name(),
                    "Dropped while catching up"
                );
                vec![]
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.bft.set_time(now);
        self.coordinator.set_time(now);
        self.watcher.set_time(now);
    }

    fn now(&self) -> Duration {
        self.now
    }
}
