//! View change coordination.
//!
//! Drives election of a new primary and the cutover to the next view.
//!
//! # Election
//!
//! A replica starts an election for `candidate = max(current, voted_for) + 1`
//! and broadcasts a [`ViewChangeVote`] carrying its last committed sequence
//! number and its prepared certificates. The primary of the candidate view is
//! derived from the view ordinal and membership order, so every correct
//! replica converges on the same primary from the votes alone.
//!
//! - A replica that sees `f + 1` votes for a candidate above its own vote
//!   joins that election.
//! - `n - f` votes for a candidate complete the view change. The completing
//!   replica broadcasts a [`NewView`] so replicas that missed votes can adopt
//!   the view directly.
//!
//! # Retry
//!
//! If the election timer for the candidate fires, the replica retries with
//! the next candidate. Timeouts use exponential backoff: the timeout doubles
//! with each attempt up to 64x the base. The candidate never regresses.

use keel_core::{Action, Event, LivenessFault, NodeNotification, OutboundMessage, TimerId};
use keel_messages::{NewView, ViewChangeVote};
use keel_types::{NodeId, PreparedCertificate, SeqNo, Topology, View, ViewNumber};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BftConfig;

/// Maximum multiplier for exponential backoff (2^6 = 64x base timeout).
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Why an election was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElectionTrigger {
    /// A client request waited longer than the request timeout.
    RequestTimeout,
    /// The primary stayed unreachable past the tolerated disconnection window.
    PrimaryDisconnected,
    /// Explicit operator signal.
    Operator,
    /// `f + 1` other replicas already voted for the candidate.
    Joined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Stable,
    Electing {
        candidate: ViewNumber,
        trigger: ElectionTrigger,
        /// Candidates tried so far in this election, starting at 1.
        attempts: u32,
        fault_reported: bool,
    },
}

/// What the local replica contributes to a vote.
#[derive(Debug, Clone, Default)]
pub struct VoteEvidence {
    pub last_committed: SeqNo,
    pub prepared: Vec<PreparedCertificate>,
}

/// View change state for one replica session.
pub struct ViewChangeCoordinator {
    topology: Arc<dyn Topology>,

    /// Base election timeout.
    base_timeout: Duration,

    /// Failed attempts before `QuorumUnreachable` is reported.
    max_attempts: u32,

    /// The adopted view.
    current: View,

    /// Retired views, oldest first.
    history: Vec<View>,

    phase: CoordinatorPhase,

    /// Highest candidate this replica voted for. Never decreases.
    voted_for: ViewNumber,

    /// The last vote we broadcast, kept for rebroadcast while electing.
    last_broadcast_vote: Option<ViewChangeVote>,

    /// Collected votes: candidate -> voter -> vote.
    vote_collector: BTreeMap<ViewNumber, BTreeMap<NodeId, ViewChangeVote>>,

    /// Highest candidate any received vote named.
    highest_candidate_seen: ViewNumber,

    now: Duration,
}

impl std::fmt::Debug for ViewChangeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewChangeCoordinator")
            .field("current", &self.current)
            .field("phase", &self.phase)
            .field("voted_for", &self.voted_for)
            .finish()
    }
}

impl ViewChangeCoordinator {
    /// Create a coordinator starting in `initial_view`.
    pub fn new(topology: Arc<dyn Topology>, config: &BftConfig, initial_view: ViewNumber) -> Self {
        let current = View::new(initial_view, topology.primary_for(initial_view), Duration::ZERO);
        Self {
            topology,
            base_timeout: config.election_timeout,
            max_attempts: config.max_election_attempts,
            current,
            history: Vec::new(),
            phase: CoordinatorPhase::Stable,
            voted_for: initial_view,
            last_broadcast_vote: None,
            vote_collector: BTreeMap::new(),
            highest_candidate_seen: initial_view,
            now: Duration::ZERO,
        }
    }

    /// Election timeout for the given attempt (1-based), with exponential backoff.
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_timeout * 2u32.pow(exponent)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn current_view(&self) -> &View {
        &self.current
    }

    pub fn history(&self) -> &[View] {
        &self.history
    }

    pub fn phase(&self) -> &CoordinatorPhase {
        &self.phase
    }

    pub fn is_electing(&self) -> bool {
        matches!(self.phase, CoordinatorPhase::Electing { .. })
    }

    pub fn candidate(&self) -> Option<ViewNumber> {
        match self.phase {
            CoordinatorPhase::Electing { candidate, .. } => Some(candidate),
            CoordinatorPhase::Stable => None,
        }
    }

    pub fn voted_for(&self) -> ViewNumber {
        self.voted_for
    }

    /// Votes collected for a candidate.
    pub fn vote_count(&self, candidate: ViewNumber) -> usize {
        self.vote_collector.get(&candidate).map_or(0, |v| v.len())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Stable → Electing
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start an election for the next candidate view.
    ///
    /// No-op while an election is already running.
    pub fn start_election(
        &mut self,
        trigger: ElectionTrigger,
        evidence: VoteEvidence,
    ) -> Vec<Action> {
        if let CoordinatorPhase::Electing { candidate, .. } = self.phase {
            debug!(candidate = candidate.0, ?trigger, "Election already running");
            return vec![];
        }

        let candidate = self.current.number.max(self.voted_for).next();
        info!(
            node = %self.topology.local_node_id(),
            view = self.current.number.0,
            candidate = candidate.0,
            ?trigger,
            "Starting view change"
        );
        self.phase = CoordinatorPhase::Electing {
            candidate,
            trigger,
            attempts: 1,
            fault_reported: false,
        };
        self.cast_vote(candidate, evidence, 1)
    }

    /// Create, broadcast and count our own vote for `candidate`.
    fn cast_vote(
        &mut self,
        candidate: ViewNumber,
        evidence: VoteEvidence,
        attempt: u32,
    ) -> Vec<Action> {
        let vote = ViewChangeVote {
            candidate,
            voter: self.topology.local_node_id(),
            last_committed: evidence.last_committed,
            prepared: evidence.prepared,
        };
        self.voted_for = self.voted_for.max(candidate);
        self.last_broadcast_vote = Some(vote.clone());

        debug!(
            candidate = candidate.0,
            last_committed = vote.last_committed.0,
            prepared = vote.prepared.len(),
            attempt,
            "Broadcasting view change vote"
        );

        let mut actions = vec![
            Action::Broadcast {
                message: OutboundMessage::ViewChangeVote(vote.clone()),
            },
            Action::SetTimer {
                id: TimerId::Election(candidate),
                duration: self.timeout_for_attempt(attempt),
            },
        ];
        actions.extend(self.record_vote(vote));
        actions
    }

    /// Rebroadcast our current vote to recover from message loss.
    pub fn rebroadcast_vote(&self) -> Vec<Action> {
        match (&self.phase, &self.last_broadcast_vote) {
            (CoordinatorPhase::Electing { candidate, .. }, Some(vote))
                if vote.candidate == *candidate =>
            {
                vec![Action::Broadcast {
                    message: OutboundMessage::ViewChangeVote(vote.clone()),
                }]
            }
            _ => vec![],
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Votes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Handle a vote from another replica.
    pub fn on_view_change_vote(
        &mut self,
        vote: ViewChangeVote,
        evidence: VoteEvidence,
    ) -> Vec<Action> {
        if vote.candidate <= self.current.number {
            debug!(
                candidate = vote.candidate.0,
                current = self.current.number.0,
                "Ignoring view change vote for old/current view"
            );
            return vec![];
        }

        if !self.topology.is_member(vote.voter) {
            warn!(voter = %vote.voter, "View change vote from unknown replica");
            return vec![];
        }

        let candidate = vote.candidate;
        let voters = self.vote_collector.entry(candidate).or_default();
        if voters.contains_key(&vote.voter) {
            debug!(voter = %vote.voter, "Ignoring duplicate view change vote");
            return vec![];
        }
        voters.insert(vote.voter, vote);
        let count = voters.len();
        self.highest_candidate_seen = self.highest_candidate_seen.max(candidate);

        debug!(candidate = candidate.0, votes = count, "View change vote added");

        // Join rule: f + 1 votes for a candidate we have not voted for.
        if candidate > self.voted_for && count >= self.topology.weak_quorum() {
            let attempts = match self.phase {
                CoordinatorPhase::Electing { attempts, .. } => attempts,
                CoordinatorPhase::Stable => 1,
            };
            info!(
                candidate = candidate.0,
                votes = count,
                "Joining view change backed by f + 1 replicas"
            );
            let mut actions = self.cancel_election_timer();
            self.phase = CoordinatorPhase::Electing {
                candidate,
                trigger: ElectionTrigger::Joined,
                attempts,
                fault_reported: false,
            };
            actions.extend(self.cast_vote(candidate, evidence, attempts));
            return actions;
        }

        self.check_quorum(candidate)
    }

    /// Add a vote to the collector (our own, or one already validated).
    fn record_vote(&mut self, vote: ViewChangeVote) -> Vec<Action> {
        let candidate = vote.candidate;
        self.vote_collector
            .entry(candidate)
            .or_default()
            .insert(vote.voter, vote);
        self.check_quorum(candidate)
    }

    fn check_quorum(&mut self, candidate: ViewNumber) -> Vec<Action> {
        if candidate <= self.current.number {
            return vec![];
        }
        if self.vote_count(candidate) < self.topology.strong_quorum() {
            return vec![];
        }
        self.complete(candidate)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Electing → Completed
    // ═══════════════════════════════════════════════════════════════════════════

    /// A quorum voted for `candidate`: adopt it and announce it.
    fn complete(&mut self, candidate: ViewNumber) -> Vec<Action> {
        let Some(votes) = self.vote_collector.get(&candidate) else {
            return vec![];
        };

        let floor = votes
            .values()
            .map(|v| v.last_committed)
            .max()
            .unwrap_or(SeqNo::ZERO);
        let reproposals = select_reproposals(votes.values(), floor);
        let voters: BTreeSet<NodeId> = votes.keys().copied().collect();
        let view = View::new(candidate, self.topology.primary_for(candidate), self.now);

        info!(
            node = %self.topology.local_node_id(),
            view = candidate.0,
            primary = %view.primary,
            voters = voters.len(),
            floor = floor.0,
            reproposals = reproposals.len(),
            "View change quorum reached"
        );

        let mut actions = self.install(view.clone());
        actions.push(Action::Broadcast {
            message: OutboundMessage::NewView(NewView {
                view: candidate,
                primary: view.primary,
                voters,
                floor,
                reproposals: reproposals.clone(),
            }),
        });
        actions.push(Action::EnqueueInternal {
            event: Event::ViewChangeCompleted {
                view,
                floor,
                reproposals,
            },
        });
        actions
    }

    /// Handle a view announced by a replica that reached quorum.
    pub fn on_new_view(&mut self, new_view: NewView) -> Vec<Action> {
        if new_view.view <= self.current.number {
            debug!(
                view = new_view.view.0,
                current = self.current.number.0,
                "Ignoring new view for old/current view"
            );
            return vec![];
        }

        let expected_primary = self.topology.primary_for(new_view.view);
        if new_view.primary != expected_primary {
            warn!(
                view = new_view.view.0,
                primary = %new_view.primary,
                expected = %expected_primary,
                "New view names the wrong primary"
            );
            return vec![];
        }

        if new_view.voters.len() < self.topology.strong_quorum()
            || !new_view.voters.iter().all(|v| self.topology.is_member(*v))
        {
            warn!(
                view = new_view.view.0,
                voters = new_view.voters.len(),
                "New view without a quorum of members"
            );
            return vec![];
        }

        let view = View::new(new_view.view, new_view.primary, self.now);
        info!(
            view = view.number.0,
            primary = %view.primary,
            "Adopted view from new view announcement"
        );
        let mut actions = self.install(view.clone());
        actions.push(Action::EnqueueInternal {
            event: Event::ViewChangeCompleted {
                view,
                floor: new_view.floor,
                reproposals: new_view.reproposals,
            },
        });
        actions
    }

    /// Jump to a higher view learned outside an election (catch-up, view sync).
    ///
    /// Returns `None` if `number` is not above the current view.
    pub fn fast_forward(&mut self, number: ViewNumber) -> Option<(View, Vec<Action>)> {
        if number <= self.current.number {
            return None;
        }
        let view = View::new(number, self.topology.primary_for(number), self.now);
        info!(view = number.0, primary = %view.primary, "Fast-forwarding view");
        let actions = self.install(view.clone());
        Some((view, actions))
    }

    /// Retire the current view and make `view` current.
    fn install(&mut self, view: View) -> Vec<Action> {
        let actions = self.cancel_election_timer();
        let number = view.number;
        let retired = std::mem::replace(&mut self.current, view);
        self.history.push(retired);
        self.phase = CoordinatorPhase::Stable;
        self.voted_for = self.voted_for.max(number);
        self.last_broadcast_vote = None;
        self.cleanup_old_votes();
        actions
    }

    fn cancel_election_timer(&self) -> Vec<Action> {
        match self.phase {
            CoordinatorPhase::Electing { candidate, .. } => vec![Action::CancelTimer {
                id: TimerId::Election(candidate),
            }],
            CoordinatorPhase::Stable => vec![],
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Timeouts and abandonment
    // ═══════════════════════════════════════════════════════════════════════════

    /// The election for `view` timed out: retry with the next candidate.
    pub fn on_election_timer(&mut self, view: ViewNumber, evidence: VoteEvidence) -> Vec<Action> {
        let CoordinatorPhase::Electing {
            candidate,
            trigger,
            attempts,
            fault_reported,
        } = self.phase.clone()
        else {
            debug!(view = view.0, "Election timer fired while stable");
            return vec![];
        };
        if candidate != view {
            debug!(view = view.0, candidate = candidate.0, "Stale election timer");
            return vec![];
        }

        let mut actions = vec![];
        let mut fault_reported = fault_reported;
        if attempts >= self.max_attempts && !fault_reported {
            let fault = LivenessFault::QuorumUnreachable {
                candidate,
                attempts,
            };
            warn!(node = %self.topology.local_node_id(), %fault, "Election cannot reach quorum");
            actions.push(Action::Notify {
                notification: NodeNotification::LivenessFault(fault),
            });
            fault_reported = true;
        }

        let next = candidate.next().max(self.highest_candidate_seen);
        let attempts = attempts + 1;
        info!(
            candidate = next.0,
            attempts,
            timeout = ?self.timeout_for_attempt(attempts),
            "Election timed out, retrying with next view"
        );
        self.phase = CoordinatorPhase::Electing {
            candidate: next,
            trigger,
            attempts,
            fault_reported,
        };
        actions.extend(self.cast_vote(next, evidence, attempts));
        actions
    }

    /// Abandon an election started only because the primary went away, once
    /// the primary is reachable again and fewer than `f + 1` replicas back it.
    pub fn abandon_if_primary_back(&mut self) -> Vec<Action> {
        let CoordinatorPhase::Electing {
            candidate, trigger, ..
        } = self.phase
        else {
            return vec![];
        };
        if trigger != ElectionTrigger::PrimaryDisconnected {
            return vec![];
        }
        if self.vote_count(candidate) >= self.topology.weak_quorum() {
            return vec![];
        }
        info!(
            view = self.current.number.0,
            candidate = candidate.0,
            "Primary reachable again, abandoning election"
        );
        let actions = self.cancel_election_timer();
        self.phase = CoordinatorPhase::Stable;
        self.last_broadcast_vote = None;
        actions
    }

    /// Drop votes for candidates at or below the current view.
    fn cleanup_old_votes(&mut self) {
        let current = self.current.number;
        self.vote_collector.retain(|candidate, _| *candidate > current);
    }
}

/// Per sequence number above `floor`, the certificate from the highest view,
/// keeping only the run contiguous from `floor + 1`.
fn select_reproposals<'a>(
    votes: impl Iterator<Item = &'a ViewChangeVote>,
    floor: SeqNo,
) -> Vec<PreparedCertificate> {
    let mut best: BTreeMap<SeqNo, PreparedCertificate> = BTreeMap::new();
    for cert in votes.flat_map(|v| v.prepared.iter()) {
        if cert.seq <= floor {
            continue;
        }
        match best.get(&cert.seq) {
            Some(existing) if existing.view >= cert.view => {}
            _ => {
                best.insert(cert.seq, cert.clone());
            }
        }
    }

    let mut out = Vec::new();
    let mut expected = floor.next();
    for (seq, cert) in best {
        if seq != expected {
            break;
        }
        out.push(cert);
        expected = expected.next();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{ClientRequest, PoolTopology, RequestId};
    use tracing_test::traced_test;

    fn make_coordinator(local: u32, n: u32) -> ViewChangeCoordinator {
        let topology = PoolTopology::sequential(NodeId(local), n).unwrap().into_arc();
        ViewChangeCoordinator::new(topology, &BftConfig::default(), ViewNumber(0))
    }

    fn vote(candidate: u64, voter: u32, last_committed: u64) -> ViewChangeVote {
        ViewChangeVote {
            candidate: ViewNumber(candidate),
            voter: NodeId(voter),
            last_committed: SeqNo(last_committed),
            prepared: vec![],
        }
    }

    fn cert(view: u64, seq: u64, id: u64) -> PreparedCertificate {
        let request = ClientRequest::new(RequestId(id), vec![id as u8]);
        PreparedCertificate {
            view: ViewNumber(view),
            seq: SeqNo(seq),
            digest: request.digest(),
            request,
        }
    }

    fn completed(actions: &[Action]) -> Option<(View, SeqNo, Vec<PreparedCertificate>)> {
        actions.iter().find_map(|a| match a {
            Action::EnqueueInternal {
                event:
                    Event::ViewChangeCompleted {
                        view,
                        floor,
                        reproposals,
                    },
            } => Some((view.clone(), *floor, reproposals.clone())),
            _ => None,
        })
    }

    #[traced_test]
    #[test]
    fn test_exponential_backoff() {
        let coordinator = make_coordinator(0, 4);
        let base = Duration::from_secs(2);

        assert_eq!(coordinator.timeout_for_attempt(1), base);
        assert_eq!(coordinator.timeout_for_attempt(2), base * 2);
        assert_eq!(coordinator.timeout_for_attempt(4), base * 8);
        assert_eq!(coordinator.timeout_for_attempt(7), base * 64);
        // Capped at MAX_BACKOFF_EXPONENT.
        assert_eq!(coordinator.timeout_for_attempt(20), base * 64);
    }

    #[traced_test]
    #[test]
    fn test_start_election_votes_for_next_view() {
        let mut coordinator = make_coordinator(0, 4);
        let actions = coordinator.start_election(ElectionTrigger::Operator, VoteEvidence::default());

        assert_eq!(coordinator.candidate(), Some(ViewNumber(1)));
        assert_eq!(coordinator.vote_count(ViewNumber(1)), 1);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer { id: TimerId::Election(v), .. } if *v == ViewNumber(1)
        )));

        // A second trigger while electing is a no-op.
        assert!(coordinator
            .start_election(ElectionTrigger::RequestTimeout, VoteEvidence::default())
            .is_empty());
    }

    #[traced_test]
    #[test]
    fn test_quorum_completes_view_change() {
        let mut coordinator = make_coordinator(0, 4);
        coordinator.start_election(ElectionTrigger::Operator, VoteEvidence::default());

        let actions = coordinator.on_view_change_vote(vote(1, 1, 3), VoteEvidence::default());
        assert!(completed(&actions).is_none());

        let actions = coordinator.on_view_change_vote(vote(1, 2, 5), VoteEvidence::default());
        let (view, floor, _) = completed(&actions).expect("quorum of 3 reached");
        assert_eq!(view.number, ViewNumber(1));
        assert_eq!(view.primary, NodeId(1));
        assert_eq!(floor, SeqNo(5));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast { message: OutboundMessage::NewView(_) }
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::CancelTimer { id: TimerId::Election(v) } if *v == ViewNumber(1)
        )));

        assert_eq!(coordinator.current_view().number, ViewNumber(1));
        assert_eq!(coordinator.history().len(), 1);
        assert_eq!(coordinator.history()[0].number, ViewNumber(0));
        assert!(!coordinator.is_electing());
    }

    #[traced_test]
    #[test]
    fn test_join_after_weak_quorum() {
        let mut coordinator = make_coordinator(3, 4);

        let actions = coordinator.on_view_change_vote(vote(1, 0, 0), VoteEvidence::default());
        assert!(actions.is_empty());
        assert!(!coordinator.is_electing());

        let actions = coordinator.on_view_change_vote(vote(1, 1, 0), VoteEvidence::default());
        // Joined: our own vote makes three, which completes the change.
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Broadcast { message: OutboundMessage::ViewChangeVote(v) } if v.voter == NodeId(3)
        )));
        assert!(completed(&actions).is_some());
        assert_eq!(coordinator.current_view().number, ViewNumber(1));
    }

    #[traced_test]
    #[test]
    fn test_retry_is_monotonic_and_reports_unreachable_quorum() {
        let mut coordinator = make_coordinator(0, 4);
        coordinator.start_election(ElectionTrigger::PrimaryDisconnected, VoteEvidence::default());

        let mut faults = 0;
        let mut last = ViewNumber(1);
        for _ in 0..5 {
            let actions = coordinator.on_election_timer(last, VoteEvidence::default());
            faults += actions
                .iter()
                .filter(|a| matches!(
                    a,
                    Action::Notify {
                        notification: NodeNotification::LivenessFault(
                            LivenessFault::QuorumUnreachable { .. }
                        )
                    }
                ))
                .count();
            let next = coordinator.candidate().unwrap();
            assert!(next > last);
            last = next;
        }

        assert_eq!(faults, 1, "reported once per election");
        assert_eq!(coordinator.current_view().number, ViewNumber(0));
        // Stale timer for an old candidate is ignored.
        assert!(coordinator
            .on_election_timer(ViewNumber(1), VoteEvidence::default())
            .is_empty());
    }

    #[traced_test]
    #[test]
    fn test_abandon_when_primary_returns() {
        let mut coordinator = make_coordinator(2, 4);
        coordinator.start_election(ElectionTrigger::PrimaryDisconnected, VoteEvidence::default());

        let actions = coordinator.abandon_if_primary_back();
        assert!(!coordinator.is_electing());
        assert_eq!(coordinator.current_view().number, ViewNumber(0));
        assert!(actions.iter().any(|a| matches!(a, Action::CancelTimer { .. })));

        // Next election never reuses the abandoned candidate.
        coordinator.start_election(ElectionTrigger::Operator, VoteEvidence::default());
        assert_eq!(coordinator.candidate(), Some(ViewNumber(2)));
    }

    #[traced_test]
    #[test]
    fn test_no_abandon_with_weak_quorum_backing() {
        let mut coordinator = make_coordinator(2, 4);
        coordinator.start_election(ElectionTrigger::PrimaryDisconnected, VoteEvidence::default());
        coordinator.on_view_change_vote(vote(1, 3, 0), VoteEvidence::default());

        assert!(coordinator.abandon_if_primary_back().is_empty());
        assert!(coordinator.is_electing());
    }

    #[traced_test]
    #[test]
    fn test_new_view_validation() {
        let mut coordinator = make_coordinator(3, 4);
        let voters: BTreeSet<NodeId> = [0, 1, 2].into_iter().map(NodeId).collect();

        let wrong_primary = NewView {
            view: ViewNumber(2),
            primary: NodeId(0),
            voters: voters.clone(),
            floor: SeqNo(0),
            reproposals: vec![],
        };
        assert!(coordinator.on_new_view(wrong_primary).is_empty());

        let too_few = NewView {
            view: ViewNumber(2),
            primary: NodeId(2),
            voters: [NodeId(0)].into_iter().collect(),
            floor: SeqNo(0),
            reproposals: vec![],
        };
        assert!(coordinator.on_new_view(too_few).is_empty());

        let valid = NewView {
            view: ViewNumber(2),
            primary: NodeId(2),
            voters,
            floor: SeqNo(4),
            reproposals: vec![cert(1, 5, 9)],
        };
        let actions = coordinator.on_new_view(valid);
        let (view, floor, reproposals) = completed(&actions).unwrap();
        assert_eq!(view.number, ViewNumber(2));
        assert_eq!(floor, SeqNo(4));
        assert_eq!(reproposals.len(), 1);
        assert_eq!(coordinator.voted_for(), ViewNumber(2));
    }

    #[test]
    fn test_fast_forward_only_moves_up() {
        let mut coordinator = make_coordinator(0, 4);
        assert!(coordinator.fast_forward(ViewNumber(0)).is_none());
        let (view, _) = coordinator.fast_forward(ViewNumber(3)).unwrap();
        assert_eq!(view.primary, NodeId(3));
        assert!(coordinator.fast_forward(ViewNumber(2)).is_none());
        assert_eq!(coordinator.current_view().number, ViewNumber(3));
    }

    #[test]
    fn test_select_reproposals_contiguous_highest_view() {
        let mut a = vote(2, 0, 4);
        a.prepared = vec![cert(0, 5, 1), cert(0, 6, 2), cert(0, 8, 4)];
        let mut b = vote(2, 1, 4);
        b.prepared = vec![cert(1, 5, 3)];

        let selected = select_reproposals([a, b].iter(), SeqNo(4));
        let seqs: Vec<u64> = selected.iter().map(|c| c.seq.0).collect();
        assert_eq!(seqs, vec![5, 6]);
        assert_eq!(selected[0].view, ViewNumber(1));
        assert_eq!(selected[0].request.id, RequestId(3));
    }
}
