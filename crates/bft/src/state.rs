//! Request ordering state machine.
//!
//! Orders client requests through pre-prepare / prepare / commit within the
//! current view and hands finalized entries to the ledger strictly in
//! sequence order. Every finalization re-checks the [`CommitGate`] first.

use keel_core::{Action, Ledger, NodeNotification, OutboundMessage};
use keel_messages::{Commit, PrePrepare, Prepare};
use keel_types::{
    ClientRequest, CommitGate, CommittedEntry, Digest, NodeId, PreparedCertificate, RequestId,
    SeqNo, Topology, View, ViewNumber,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::BftConfig;
use crate::three_pc::ThreePcLog;

/// BFT statistics for monitoring.
#[derive(Clone, Copy, Debug, Default)]
pub struct BftStats {
    /// Views entered after the initial one.
    pub view_changes: u64,
    /// Entries finalized through 3PC in this session.
    pub committed: u64,
    /// Entries adopted from peers through catch-up or lag sync.
    pub synced: u64,
    /// Pre-prepares this replica sent as primary.
    pub proposals: u64,
    /// 3PC messages dropped while the commit gate was closed.
    pub gated: u64,
}

/// State recovered from the ledger on startup.
///
/// Only the committed log survives a restart. The 3PC log, votes and the
/// adopted view are volatile; the view floor is the view of the last
/// committed entry.
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub last_committed: SeqNo,
    pub view_floor: ViewNumber,
    /// Most recent committed entries, oldest first.
    pub committed_tail: Vec<CommittedEntry>,
}

impl RecoveredState {
    pub fn from_ledger(ledger: &dyn Ledger, retention: usize) -> Self {
        let last_committed = ledger.last_committed_seq_no();
        let start = SeqNo(last_committed.0.saturating_sub(retention as u64));
        let committed_tail = ledger.entries_after(start, last_committed);
        let view_floor = committed_tail
            .last()
            .map(|e| e.view)
            .unwrap_or(ViewNumber::GENESIS);
        Self {
            last_committed,
            view_floor,
            committed_tail,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    request: ClientRequest,
    received_at: Duration,
}

/// A 3PC message for a view we have not reached yet.
#[derive(Debug, Clone)]
enum Stashed {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

impl Stashed {
    fn view(&self) -> ViewNumber {
        match self {
            Stashed::PrePrepare(m) => m.view,
            Stashed::Prepare(m) => m.view,
            Stashed::Commit(m) => m.view,
        }
    }
}

/// Ordering state for one replica session.
pub struct BftState {
    // ═══════════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════════
    topology: Arc<dyn Topology>,

    config: BftConfig,

    /// Reader side of the inconsistency flag.
    gate: CommitGate,

    // ═══════════════════════════════════════════════════════════════════════════
    // View
    // ═══════════════════════════════════════════════════════════════════════════
    view: View,

    /// False until catch-up completes. A catching-up replica casts no votes.
    participating: bool,

    /// True while a view change is in progress; 3PC for the current view pauses.
    electing: bool,

    /// Highest commit known to the quorum that installed the current view.
    /// Sequence numbers at or below it are synced, never re-ordered.
    commit_floor: SeqNo,

    // ═══════════════════════════════════════════════════════════════════════════
    // Log
    // ═══════════════════════════════════════════════════════════════════════════
    log: ThreePcLog,

    last_committed: SeqNo,

    /// Recent committed entries served to catching-up peers.
    committed_tail: VecDeque<CommittedEntry>,

    /// Request IDs in `committed_tail`.
    committed_ids: BTreeMap<RequestId, SeqNo>,

    // ═══════════════════════════════════════════════════════════════════════════
    // Proposal
    // ═══════════════════════════════════════════════════════════════════════════
    pending: BTreeMap<RequestId, PendingRequest>,

    /// Requests already assigned a sequence number in the current view.
    proposed: BTreeSet<RequestId>,

    /// Certificates carried in by completed view changes, one per sequence
    /// number from the highest view. Kept on every replica until the sequence
    /// number commits; a primary proposes them at their original sequence
    /// numbers before any new request.
    reproposals: BTreeMap<SeqNo, PreparedCertificate>,

    /// Sequence numbers re-proposed in the current view.
    reproposed: BTreeSet<SeqNo>,

    next_seq: SeqNo,

    future_stash: Vec<Stashed>,

    stats: BftStats,

    now: Duration,
}

impl std::fmt::Debug for BftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BftState")
            .field("node", &self.topology.local_node_id())
            .field("view", &self.view.number)
            .field("last_committed", &self.last_committed)
            .field("participating", &self.participating)
            .field("electing", &self.electing)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl BftState {
    pub fn new(
        topology: Arc<dyn Topology>,
        config: BftConfig,
        gate: CommitGate,
        recovered: RecoveredState,
    ) -> Self {
        let view_number = recovered.view_floor;
        let view = View::new(view_number, topology.primary_for(view_number), Duration::ZERO);
        let committed_ids = recovered
            .committed_tail
            .iter()
            .map(|e| (e.request.id, e.seq))
            .collect();
        Self {
            topology,
            config,
            gate,
            view,
            participating: false,
            electing: false,
            commit_floor: SeqNo::ZERO,
            log: ThreePcLog::new(),
            last_committed: recovered.last_committed,
            committed_tail: recovered.committed_tail.into(),
            committed_ids,
            pending: BTreeMap::new(),
            proposed: BTreeSet::new(),
            reproposals: BTreeMap::new(),
            reproposed: BTreeSet::new(),
            next_seq: recovered.last_committed.next(),
            future_stash: Vec::new(),
            stats: BftStats::default(),
            now: Duration::ZERO,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn last_committed(&self) -> SeqNo {
        self.last_committed
    }

    pub fn is_participating(&self) -> bool {
        self.participating
    }

    pub fn is_primary(&self) -> bool {
        self.view.primary == self.local_node_id()
    }

    pub fn log(&self) -> &ThreePcLog {
        &self.log
    }

    pub fn stats(&self) -> BftStats {
        self.stats
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn local_node_id(&self) -> NodeId {
        self.topology.local_node_id()
    }

    /// Prepared certificates above the last commit, for view-change votes.
    ///
    /// Merges the log with carried certificates not yet re-prepared, taking
    /// the highest view per sequence number.
    pub fn prepared_certificates(&self) -> Vec<PreparedCertificate> {
        let mut best: BTreeMap<SeqNo, PreparedCertificate> = self
            .reproposals
            .range(self.last_committed.next()..)
            .map(|(seq, cert)| (*seq, cert.clone()))
            .collect();
        for cert in self.log.prepared_certificates(self.last_committed) {
            match best.get(&cert.seq) {
                Some(existing) if existing.view >= cert.view => {}
                _ => {
                    best.insert(cert.seq, cert);
                }
            }
        }
        best.into_values().collect()
    }

    /// Fold certificates from a completed view change into the carried set.
    fn carry(&mut self, certificates: Vec<PreparedCertificate>, floor: SeqNo) {
        let through = self.last_committed.max(floor);
        self.reproposals.retain(|seq, _| *seq > through);
        for cert in certificates {
            if cert.seq <= through {
                continue;
            }
            match self.reproposals.get(&cert.seq) {
                Some(existing) if existing.view >= cert.view => {}
                _ => {
                    self.reproposals.insert(cert.seq, cert);
                }
            }
        }
    }

    /// Committed entries after `after`, oldest first, at most `limit`.
    ///
    /// Empty if the retained tail does not reach back to `after + 1`.
    pub fn committed_after(&self, after: SeqNo, limit: usize) -> Vec<CommittedEntry> {
        match self.committed_tail.front() {
            Some(first) if first.seq <= after.next() => self
                .committed_tail
                .iter()
                .filter(|e| e.seq > after)
                .take(limit)
                .cloned()
                .collect(),
            _ => vec![],
        }
    }

    fn committed_digest(&self, seq: SeqNo) -> Option<Digest> {
        self.committed_tail
            .iter()
            .rev()
            .find(|e| e.seq == seq)
            .map(|e| e.digest)
    }

    /// Age of the oldest uncommitted request.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.pending
            .values()
            .map(|p| self.now.saturating_sub(p.received_at))
            .max()
    }

    /// Restart request timeout measurement for everything pending.
    pub fn reset_request_timers(&mut self) {
        let now = self.now;
        for p in self.pending.values_mut() {
            p.received_at = now;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Mode changes driven by the node
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start participating in 3PC. Called once catch-up completes.
    pub fn start_participating(&mut self) -> Vec<Action> {
        self.participating = true;
        self.reset_request_timers();
        self.try_propose()
    }

    /// Pause or resume 3PC for the current view around an election.
    pub fn set_electing(&mut self, electing: bool) -> Vec<Action> {
        let was = self.electing;
        self.electing = electing;
        if was && !electing {
            // Election abandoned: the view is unchanged, pick up where we left off.
            self.reset_request_timers();
            return self.try_propose();
        }
        vec![]
    }

    /// The commit gate reopened: finalize anything that became ready meanwhile.
    pub fn on_gate_opened(&mut self) -> Vec<Action> {
        let mut actions = self.finalize_ready();
        actions.extend(self.try_propose());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Client requests and proposals
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn on_client_request(&mut self, request: ClientRequest) -> Vec<Action> {
        if let Some(seq) = self.committed_ids.get(&request.id) {
            // Already ordered; answer again.
            let view = self
                .committed_tail
                .iter()
                .find(|e| e.seq == *seq)
                .map_or(self.view.number, |e| e.view);
            return vec![Action::ReplyToClient {
                request_id: request.id,
                view,
                seq: *seq,
            }];
        }

        if self.pending.contains_key(&request.id) {
            trace!(request = request.id.0, "Duplicate client request");
            return vec![];
        }
        debug!(request = request.id.0, "Client request queued");
        self.pending.insert(
            request.id,
            PendingRequest {
                request,
                received_at: self.now,
            },
        );
        self.try_propose()
    }

    fn can_propose(&self) -> bool {
        self.participating && !self.electing && self.is_primary() && self.gate.is_open()
    }

    /// Assign sequence numbers to pending requests if we are the primary.
    pub fn try_propose(&mut self) -> Vec<Action> {
        if !self.can_propose() {
            return vec![];
        }

        self.next_seq = self.next_seq.max(self.last_committed.next());
        let mut actions = vec![];
        let carried: Vec<PreparedCertificate> = self
            .reproposals
            .range(self.last_committed.next()..)
            .filter(|(seq, _)| !self.reproposed.contains(*seq))
            .map(|(_, cert)| cert.clone())
            .collect();
        for cert in carried {
            self.reproposed.insert(cert.seq);
            self.proposed.insert(cert.request.id);
            self.next_seq = self.next_seq.max(cert.seq.next());
            actions.extend(self.propose_at(cert.seq, cert.request));
        }

        let limit = self.last_committed.0 + self.config.max_inflight;
        let candidates: Vec<ClientRequest> = self
            .pending
            .values()
            .filter(|p| !self.proposed.contains(&p.request.id))
            .map(|p| p.request.clone())
            .collect();

        for request in candidates {
            if self.next_seq.0 > limit {
                trace!(next_seq = self.next_seq.0, limit, "Proposal window full");
                break;
            }
            let seq = self.next_seq;
            self.next_seq = seq.next();
            self.proposed.insert(request.id);
            actions.extend(self.propose_at(seq, request));
        }
        actions
    }

    fn propose_at(&mut self, seq: SeqNo, request: ClientRequest) -> Vec<Action> {
        let pre_prepare = PrePrepare::new(self.view.number, seq, request, self.local_node_id());
        debug!(
            view = self.view.number.0,
            seq = seq.0,
            digest = %pre_prepare.digest,
            "Proposing"
        );
        self.stats.proposals += 1;
        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::PrePrepare(pre_prepare.clone()),
        }];
        actions.extend(self.on_pre_prepare(pre_prepare));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // 3PC messages
    // ═══════════════════════════════════════════════════════════════════════════

    /// Whether a 3PC message for `view` may be processed now.
    ///
    /// Future-view messages are stashed by the caller.
    fn accepts(&mut self, view: ViewNumber, kind: &'static str) -> bool {
        if !self.participating {
            trace!(kind, "Not participating yet, dropping 3PC message");
            return false;
        }
        if !self.gate.is_open() {
            self.stats.gated += 1;
            debug!(kind, flag = ?self.gate.flag(), "Commit gate closed, dropping 3PC message");
            return false;
        }
        if view < self.view.number {
            trace!(kind, view = view.0, "3PC message for old view");
            return false;
        }
        if view == self.view.number && self.electing {
            trace!(kind, "Electing, dropping 3PC message for current view");
            return false;
        }
        true
    }

    fn stash(&mut self, message: Stashed) {
        if self.future_stash.len() >= self.config.future_view_stash_limit {
            debug!(view = message.view().0, "Future-view stash full, dropping message");
            return;
        }
        self.future_stash.push(message);
    }

    pub fn on_pre_prepare(&mut self, pre_prepare: PrePrepare) -> Vec<Action> {
        if pre_prepare.view > self.view.number {
            self.stash(Stashed::PrePrepare(pre_prepare));
            return vec![];
        }
        if !self.accepts(pre_prepare.view, "PrePrepare") {
            return vec![];
        }
        if pre_prepare.sender != self.view.primary {
            warn!(
                sender = %pre_prepare.sender,
                primary = %self.view.primary,
                "Pre-prepare from non-primary"
            );
            return vec![];
        }
        if !pre_prepare.is_well_formed() {
            warn!(seq = pre_prepare.seq.0, "Pre-prepare digest does not match request");
            return vec![];
        }

        let PrePrepare {
            view,
            seq,
            digest,
            request,
            sender,
        } = pre_prepare;
        let local = self.local_node_id();

        if seq <= self.last_committed {
            // Re-proposal of something we already committed: vote for it so
            // peers can finish, but never append it twice.
            if self.committed_digest(seq) == Some(digest) {
                debug!(seq = seq.0, "Pre-prepare for committed entry, voting only");
                return vec![
                    self.prepare_message(view, seq, digest),
                    self.commit_message(view, seq, digest),
                ];
            }
            warn!(seq = seq.0, %digest, "Pre-prepare conflicts with committed entry");
            return vec![];
        }

        if seq <= self.commit_floor {
            debug!(
                seq = seq.0,
                floor = self.commit_floor.0,
                "Pre-prepare at or below the commit floor"
            );
            return vec![];
        }
        if let Some(carried) = self.reproposals.get(&seq) {
            if carried.digest != digest {
                warn!(
                    seq = seq.0,
                    %digest,
                    carried = %carried.digest,
                    "Pre-prepare conflicts with carried certificate"
                );
                return vec![];
            }
        }

        if seq.0 > self.last_committed.0 + self.config.max_inflight {
            debug!(seq = seq.0, last_committed = self.last_committed.0, "Pre-prepare outside window");
            return vec![];
        }

        let request_id = request.id;
        match self.log.record_pre_prepare(view, seq, request) {
            Ok(true) => {}
            Ok(false) => return vec![],
            Err(e) => {
                warn!(error = %e, "Rejected pre-prepare");
                return vec![];
            }
        }
        self.proposed.insert(request_id);

        // The primary's pre-prepare stands in for its prepare.
        self.log.add_prepare(view, seq, digest, sender);
        let mut actions = vec![];
        if sender != local {
            self.log.add_prepare(view, seq, digest, local);
            actions.push(self.prepare_message(view, seq, digest));
        }
        actions.extend(self.advance(view, seq));
        actions
    }

    pub fn on_prepare(&mut self, prepare: Prepare) -> Vec<Action> {
        if prepare.view > self.view.number {
            self.stash(Stashed::Prepare(prepare));
            return vec![];
        }
        if !self.accepts(prepare.view, "Prepare") {
            return vec![];
        }
        if !self.topology.is_member(prepare.voter) || prepare.seq <= self.last_committed {
            return vec![];
        }
        if !self
            .log
            .add_prepare(prepare.view, prepare.seq, prepare.digest, prepare.voter)
        {
            return vec![];
        }
        self.advance(prepare.view, prepare.seq)
    }

    pub fn on_commit(&mut self, commit: Commit) -> Vec<Action> {
        if commit.view > self.view.number {
            self.stash(Stashed::Commit(commit));
            return vec![];
        }
        if !self.accepts(commit.view, "Commit") {
            return vec![];
        }
        if !self.topology.is_member(commit.voter) || commit.seq <= self.last_committed {
            return vec![];
        }
        if !self
            .log
            .add_commit(commit.view, commit.seq, commit.digest, commit.voter)
        {
            return vec![];
        }
        self.advance(commit.view, commit.seq)
    }

    fn prepare_message(&self, view: ViewNumber, seq: SeqNo, digest: Digest) -> Action {
        Action::Broadcast {
            message: OutboundMessage::Prepare(Prepare {
                view,
                seq,
                digest,
                voter: self.local_node_id(),
            }),
        }
    }

    fn commit_message(&self, view: ViewNumber, seq: SeqNo, digest: Digest) -> Action {
        Action::Broadcast {
            message: OutboundMessage::Commit(Commit {
                view,
                seq,
                digest,
                voter: self.local_node_id(),
            }),
        }
    }

    /// Move `(view, seq)` forward after a new message.
    fn advance(&mut self, view: ViewNumber, seq: SeqNo) -> Vec<Action> {
        let quorum = self.topology.strong_quorum();
        let mut actions = vec![];
        if self.log.try_mark_prepared(view, seq, quorum) {
            if let Some(entry) = self.log.get(view, seq) {
                let digest = entry.digest;
                self.log.add_commit(view, seq, digest, self.local_node_id());
                actions.push(self.commit_message(view, seq, digest));
            }
        }
        actions.extend(self.finalize_ready());
        actions
    }

    /// Finalize ready entries in sequence order.
    fn finalize_ready(&mut self) -> Vec<Action> {
        let quorum = self.topology.strong_quorum();
        let mut actions = vec![];
        loop {
            let seq = self.last_committed.next();
            let Some(view) = self.log.ready_at(seq, quorum) else {
                break;
            };
            // Re-check the flag immediately before finalizing.
            if !self.gate.is_open() {
                debug!(seq = seq.0, flag = ?self.gate.flag(), "Commit gate closed, holding entry");
                break;
            }
            let entry = match self.log.mark_committed(view, seq) {
                Ok(entry) => CommittedEntry {
                    view: entry.view,
                    seq: entry.seq,
                    digest: entry.digest,
                    request: entry.request.clone(),
                },
                Err(e) => {
                    warn!(error = %e, "Cannot finalize entry");
                    break;
                }
            };
            self.stats.committed += 1;
            actions.extend(self.record_committed(entry));
        }
        if !actions.is_empty() {
            actions.extend(self.try_propose());
        }
        actions
    }

    /// Bookkeeping shared by 3PC finalization and synced entries.
    fn record_committed(&mut self, entry: CommittedEntry) -> Vec<Action> {
        info!(
            node = %self.local_node_id(),
            view = entry.view.0,
            seq = entry.seq.0,
            digest = %entry.digest,
            "Committed"
        );
        self.last_committed = entry.seq;
        self.next_seq = self.next_seq.max(entry.seq.next());
        self.pending.remove(&entry.request.id);
        self.committed_ids.insert(entry.request.id, entry.seq);
        self.committed_tail.push_back(entry.clone());
        while self.committed_tail.len() > self.config.committed_retention {
            if let Some(old) = self.committed_tail.pop_front() {
                self.committed_ids.remove(&old.request.id);
            }
        }
        self.log.prune(entry.seq);
        self.reproposals.retain(|seq, _| *seq > entry.seq);

        vec![
            Action::AppendCommitted {
                entry: entry.clone(),
            },
            Action::ReplyToClient {
                request_id: entry.request.id,
                view: entry.view,
                seq: entry.seq,
            },
            Action::Notify {
                notification: NodeNotification::EntryCommitted {
                    view: entry.view,
                    seq: entry.seq,
                    digest: entry.digest,
                },
            },
        ]
    }

    /// Apply an entry finalized elsewhere and corroborated by peers.
    ///
    /// Ignored unless it is the next entry after our last commit.
    pub fn apply_synced(&mut self, entry: CommittedEntry) -> Vec<Action> {
        if entry.seq != self.last_committed.next() {
            trace!(seq = entry.seq.0, last = self.last_committed.0, "Synced entry not next");
            return vec![];
        }
        if entry.request.digest() != entry.digest {
            warn!(seq = entry.seq.0, "Synced entry digest mismatch");
            return vec![];
        }
        self.stats.synced += 1;
        let mut actions = self.record_committed(entry);
        actions.extend(self.finalize_ready());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // View changes
    // ═══════════════════════════════════════════════════════════════════════════

    /// Enter a new view.
    ///
    /// `floor` is the highest committed sequence number known to the view's
    /// quorum; `reproposals` are carried on every replica and re-proposed by
    /// the new primary at their original sequence numbers before any new
    /// request.
    pub fn enter_view(
        &mut self,
        view: View,
        floor: SeqNo,
        reproposals: Vec<PreparedCertificate>,
    ) -> Vec<Action> {
        if view.number <= self.view.number {
            debug!(
                view = view.number.0,
                current = self.view.number.0,
                "Ignoring entry into old/current view"
            );
            return vec![];
        }

        info!(
            node = %self.local_node_id(),
            view = view.number.0,
            primary = %view.primary,
            floor = floor.0,
            "Entering view"
        );
        self.view = view;
        self.electing = false;
        self.stats.view_changes += 1;
        self.proposed.clear();
        self.log.discard_uncommitted_before(self.view.number);
        self.reset_request_timers();
        self.next_seq = self.last_committed.max(floor).next();

        self.commit_floor = floor;
        self.reproposed.clear();
        self.carry(reproposals, floor);

        let mut actions = vec![];

        let number = self.view.number;
        let stashed = std::mem::take(&mut self.future_stash);
        let (ready, later): (Vec<_>, Vec<_>) = stashed
            .into_iter()
            .filter(|m| m.view() >= number)
            .partition(|m| m.view() == number);
        self.future_stash = later;
        if !ready.is_empty() {
            debug!(view = number.0, count = ready.len(), "Replaying stashed 3PC messages");
        }
        for message in ready {
            actions.extend(match message {
                Stashed::PrePrepare(m) => self.on_pre_prepare(m),
                Stashed::Prepare(m) => self.on_prepare(m),
                Stashed::Commit(m) => self.on_commit(m),
            });
        }

        actions.extend(self.try_propose());
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{InconsistencyFlag, PoolTopology};
    use tracing_test::traced_test;

    fn make_state(local: u32) -> (BftState, CommitGate) {
        let topology = PoolTopology::sequential(NodeId(local), 4).unwrap().into_arc();
        let gate = CommitGate::new();
        gate.set(InconsistencyFlag::Clear);
        let mut state = BftState::new(
            topology,
            BftConfig::default(),
            gate.clone(),
            RecoveredState::default(),
        );
        state.start_participating();
        (state, gate)
    }

    fn request(id: u64) -> ClientRequest {
        ClientRequest::new(RequestId(id), format!("op-{id}"))
    }

    fn broadcasts(actions: &[Action]) -> Vec<&'static str> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast { message } => Some(message.type_name()),
                _ => None,
            })
            .collect()
    }

    fn appended(actions: &[Action]) -> Vec<SeqNo> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::AppendCommitted { entry } => Some(entry.seq),
                _ => None,
            })
            .collect()
    }

    fn prepare(seq: u64, req: &ClientRequest, voter: u32) -> Prepare {
        Prepare {
            view: ViewNumber(0),
            seq: SeqNo(seq),
            digest: req.digest(),
            voter: NodeId(voter),
        }
    }

    fn commit(seq: u64, req: &ClientRequest, voter: u32) -> Commit {
        Commit {
            view: ViewNumber(0),
            seq: SeqNo(seq),
            digest: req.digest(),
            voter: NodeId(voter),
        }
    }

    #[traced_test]
    #[test]
    fn test_primary_proposes_pending_request() {
        let (mut state, _) = make_state(0);
        let actions = state.on_client_request(request(1));
        assert_eq!(broadcasts(&actions), vec!["PrePrepare"]);
        assert_eq!(state.stats().proposals, 1);
    }

    #[traced_test]
    #[test]
    fn test_backup_commits_with_quorum() {
        let (mut state, _) = make_state(1);
        let req = request(1);

        let actions = state.on_pre_prepare(PrePrepare::new(
            ViewNumber(0),
            SeqNo(1),
            req.clone(),
            NodeId(0),
        ));
        assert_eq!(broadcasts(&actions), vec!["Prepare"]);

        // Primary + self + one more = n - f.
        let actions = state.on_prepare(prepare(1, &req, 2));
        assert_eq!(broadcasts(&actions), vec!["Commit"]);

        state.on_commit(commit(1, &req, 0));
        let actions = state.on_commit(commit(1, &req, 2));
        assert_eq!(appended(&actions), vec![SeqNo(1)]);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ReplyToClient { request_id, .. } if *request_id == RequestId(1)
        )));
        assert_eq!(state.last_committed(), SeqNo(1));
    }

    #[traced_test]
    #[test]
    fn test_commits_finalize_in_sequence_order() {
        let (mut state, _) = make_state(1);
        let (a, b) = (request(1), request(2));
        for (seq, req) in [(1, &a), (2, &b)] {
            state.on_pre_prepare(PrePrepare::new(ViewNumber(0), SeqNo(seq), req.clone(), NodeId(0)));
            state.on_prepare(prepare(seq, req, 2));
        }

        // Seq 2 gathers its commits first: held back.
        state.on_commit(commit(2, &b, 0));
        let actions = state.on_commit(commit(2, &b, 2));
        assert!(appended(&actions).is_empty());

        state.on_commit(commit(1, &a, 0));
        let actions = state.on_commit(commit(1, &a, 2));
        assert_eq!(appended(&actions), vec![SeqNo(1), SeqNo(2)]);
    }

    #[traced_test]
    #[test]
    fn test_gate_blocks_finalization_until_reopened() {
        let (mut state, gate) = make_state(1);
        let req = request(1);
        state.on_pre_prepare(PrePrepare::new(ViewNumber(0), SeqNo(1), req.clone(), NodeId(0)));
        state.on_prepare(prepare(1, &req, 2));
        state.on_commit(commit(1, &req, 0));

        gate.set(InconsistencyFlag::Raised);
        let actions = state.on_commit(commit(1, &req, 2));
        assert!(actions.is_empty(), "vote dropped while raised");
        assert_eq!(state.stats().gated, 1);

        gate.set(InconsistencyFlag::Clear);
        state.on_commit(commit(1, &req, 2));
        assert_eq!(state.last_committed(), SeqNo(1));
    }

    #[traced_test]
    #[test]
    fn test_gate_rechecked_at_finalization() {
        let (mut state, gate) = make_state(1);
        let req = request(1);
        state.on_pre_prepare(PrePrepare::new(ViewNumber(0), SeqNo(1), req.clone(), NodeId(0)));
        state.on_prepare(prepare(1, &req, 2));
        state.on_commit(commit(1, &req, 0));
        state.on_commit(commit(1, &req, 2));
        assert_eq!(state.last_committed(), SeqNo(1));

        // Entry 2 becomes ready, then the flag is raised before finalization runs.
        let req2 = request(2);
        state.on_pre_prepare(PrePrepare::new(ViewNumber(0), SeqNo(2), req2.clone(), NodeId(0)));
        state.on_prepare(prepare(2, &req2, 2));
        state.on_commit(commit(2, &req2, 0));
        state
            .log
            .add_commit(ViewNumber(0), SeqNo(2), req2.digest(), NodeId(2));
        gate.set(InconsistencyFlag::Raised);
        assert!(state.finalize_ready().is_empty());
        assert_eq!(state.last_committed(), SeqNo(1));

        gate.set(InconsistencyFlag::Clear);
        let actions = state.on_gate_opened();
        assert_eq!(appended(&actions), vec![SeqNo(2)]);
    }

    #[traced_test]
    #[test]
    fn test_pre_prepare_validation() {
        let (mut state, _) = make_state(1);
        let req = request(1);

        // Wrong sender.
        let actions =
            state.on_pre_prepare(PrePrepare::new(ViewNumber(0), SeqNo(1), req.clone(), NodeId(2)));
        assert!(actions.is_empty());

        // Tampered digest.
        let mut bad = PrePrepare::new(ViewNumber(0), SeqNo(1), req.clone(), NodeId(0));
        bad.digest = request(9).digest();
        assert!(state.on_pre_prepare(bad).is_empty());

        // Outside the window.
        let far = PrePrepare::new(ViewNumber(0), SeqNo(1000), req.clone(), NodeId(0));
        assert!(state.on_pre_prepare(far).is_empty());

        // Conflicting digest at an occupied slot.
        state.on_pre_prepare(PrePrepare::new(ViewNumber(0), SeqNo(1), req, NodeId(0)));
        let conflict = PrePrepare::new(ViewNumber(0), SeqNo(1), request(2), NodeId(0));
        assert!(state.on_pre_prepare(conflict).is_empty());
    }

    #[traced_test]
    #[test]
    fn test_future_view_messages_replayed_on_entry() {
        let (mut state, _) = make_state(2);
        let req = request(5);
        let pp = PrePrepare::new(ViewNumber(1), SeqNo(1), req, NodeId(1));
        assert!(state.on_pre_prepare(pp).is_empty());

        let view = View::new(ViewNumber(1), NodeId(1), Duration::ZERO);
        let actions = state.enter_view(view, SeqNo(0), vec![]);
        assert_eq!(broadcasts(&actions), vec!["Prepare"]);
    }

    #[traced_test]
    #[test]
    fn test_new_primary_reproposes_certificates_first() {
        let (mut state, _) = make_state(1);
        state.on_client_request(request(7));
        let carried = request(3);
        let cert = PreparedCertificate {
            view: ViewNumber(0),
            seq: SeqNo(1),
            digest: carried.digest(),
            request: carried,
        };

        let view = View::new(ViewNumber(1), NodeId(1), Duration::ZERO);
        let actions = state.enter_view(view, SeqNo(0), vec![cert]);
        let proposals: Vec<(SeqNo, RequestId)> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::PrePrepare(pp),
                } => Some((pp.seq, pp.request.id)),
                _ => None,
            })
            .collect();
        assert_eq!(
            proposals,
            vec![(SeqNo(1), RequestId(3)), (SeqNo(2), RequestId(7))]
        );
    }

    fn certificate(seq: u64, req: &ClientRequest) -> PreparedCertificate {
        PreparedCertificate {
            view: ViewNumber(0),
            seq: SeqNo(seq),
            digest: req.digest(),
            request: req.clone(),
        }
    }

    fn proposals(actions: &[Action]) -> Vec<(SeqNo, RequestId)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast {
                    message: OutboundMessage::PrePrepare(pp),
                } => Some((pp.seq, pp.request.id)),
                _ => None,
            })
            .collect()
    }

    #[traced_test]
    #[test]
    fn test_prepared_entry_survives_two_view_changes() {
        let (mut state, _) = make_state(2);
        let req = request(1);
        state.on_pre_prepare(PrePrepare::new(ViewNumber(0), SeqNo(1), req.clone(), NodeId(0)));
        state.on_prepare(prepare(1, &req, 1));
        assert_eq!(state.prepared_certificates().len(), 1);

        // View 1's primary never re-proposes it.
        let view = View::new(ViewNumber(1), NodeId(1), Duration::ZERO);
        state.enter_view(view, SeqNo(0), vec![certificate(1, &req)]);
        let certs = state.prepared_certificates();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].digest, req.digest());

        // We are view 2's primary: the carried entry keeps its slot.
        let view = View::new(ViewNumber(2), NodeId(2), Duration::ZERO);
        let mut actions = state.enter_view(view, SeqNo(0), vec![]);
        actions.extend(state.on_client_request(request(99)));
        assert_eq!(
            proposals(&actions),
            vec![(SeqNo(1), RequestId(1)), (SeqNo(2), RequestId(99))]
        );
    }

    #[traced_test]
    #[test]
    fn test_backup_carries_new_view_certificates_into_votes() {
        let (mut state, _) = make_state(3);
        let req = request(4);
        let view = View::new(ViewNumber(1), NodeId(1), Duration::ZERO);
        state.enter_view(view, SeqNo(0), vec![certificate(1, &req)]);
        assert_eq!(state.prepared_certificates(), vec![certificate(1, &req)]);

        // Dropped once the sequence number commits.
        state.apply_synced(CommittedEntry {
            view: ViewNumber(1),
            seq: SeqNo(1),
            digest: req.digest(),
            request: req,
        });
        assert!(state.prepared_certificates().is_empty());
    }

    #[traced_test]
    #[test]
    fn test_primary_merges_unproposed_reproposals() {
        let (mut state, gate) = make_state(1);
        let (a, b) = (request(1), request(2));
        gate.set(InconsistencyFlag::Raised);

        let view = View::new(ViewNumber(1), NodeId(1), Duration::ZERO);
        assert!(proposals(&state.enter_view(view, SeqNo(0), vec![certificate(1, &a)])).is_empty());
        let view = View::new(ViewNumber(5), NodeId(1), Duration::ZERO);
        state.enter_view(view, SeqNo(0), vec![certificate(2, &b)]);

        gate.set(InconsistencyFlag::Clear);
        let actions = state.on_gate_opened();
        assert_eq!(
            proposals(&actions),
            vec![(SeqNo(1), RequestId(1)), (SeqNo(2), RequestId(2))]
        );
    }

    #[traced_test]
    #[test]
    fn test_backup_refuses_to_reorder_settled_slots() {
        let (mut state, _) = make_state(2);
        let carried = request(1);
        let view = View::new(ViewNumber(1), NodeId(1), Duration::ZERO);
        state.enter_view(view, SeqNo(1), vec![certificate(2, &carried)]);

        // Seq 1 is committed elsewhere: sync it instead.
        let below = PrePrepare::new(ViewNumber(1), SeqNo(1), request(7), NodeId(1));
        assert!(state.on_pre_prepare(below).is_empty());

        // Seq 2 is bound to the carried certificate.
        let other = PrePrepare::new(ViewNumber(1), SeqNo(2), request(8), NodeId(1));
        assert!(state.on_pre_prepare(other).is_empty());
        let bound = PrePrepare::new(ViewNumber(1), SeqNo(2), carried, NodeId(1));
        assert_eq!(broadcasts(&state.on_pre_prepare(bound)), vec!["Prepare"]);
    }

    #[traced_test]
    #[test]
    fn test_committed_reproposal_gets_votes_but_no_second_append() {
        let (mut state, _) = make_state(2);
        let req = request(1);
        let entry = CommittedEntry {
            view: ViewNumber(0),
            seq: SeqNo(1),
            digest: req.digest(),
            request: req.clone(),
        };
        state.apply_synced(entry);

        let view = View::new(ViewNumber(1), NodeId(1), Duration::ZERO);
        state.enter_view(view, SeqNo(0), vec![]);
        let actions = state.on_pre_prepare(PrePrepare::new(ViewNumber(1), SeqNo(1), req, NodeId(1)));
        assert_eq!(broadcasts(&actions), vec!["Prepare", "Commit"]);
        assert!(appended(&actions).is_empty());
    }

    #[test]
    fn test_duplicate_request_after_commit_is_answered() {
        let (mut state, _) = make_state(3);
        let req = request(4);
        state.apply_synced(CommittedEntry {
            view: ViewNumber(0),
            seq: SeqNo(1),
            digest: req.digest(),
            request: req.clone(),
        });
        let actions = state.on_client_request(req);
        assert!(matches!(
            actions.as_slice(),
            [Action::ReplyToClient { seq, .. }] if *seq == SeqNo(1)
        ));
        assert_eq!(state.pending_count(), 0);
    }
}
