//! Per-view three-phase commit bookkeeping.
//!
//! Entries are keyed by `(view, seq)`. Prepare and commit votes are keyed by
//! `(view, seq, digest)` so votes that arrive before the pre-prepare are kept
//! and counted once it shows up.

use keel_types::{ClientRequest, Digest, NodeId, PreparedCertificate, SeqNo, ViewNumber};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    PrePrepared,
    Prepared,
    Committed,
}

/// One proposal's progress through the three phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreePcEntry {
    pub view: ViewNumber,
    pub seq: SeqNo,
    pub digest: Digest,
    pub request: ClientRequest,
    pub phase: Phase,
    /// Replicas that prepared this digest when the entry reached `Prepared`.
    pub voters: BTreeSet<NodeId>,
}

impl ThreePcEntry {
    pub fn certificate(&self) -> PreparedCertificate {
        PreparedCertificate {
            view: self.view,
            seq: self.seq,
            digest: self.digest,
            request: self.request.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreePcError {
    #[error("conflicting pre-prepare at ({view}, {seq}): have {existing}, got {proposed}")]
    ConflictingPrePrepare {
        view: ViewNumber,
        seq: SeqNo,
        existing: Digest,
        proposed: Digest,
    },

    #[error("entry ({view}, {seq}) is not prepared")]
    NotPrepared { view: ViewNumber, seq: SeqNo },
}

type VoteKey = (ViewNumber, SeqNo, Digest);

/// In-memory 3PC log. Volatile: lost when the replica restarts.
#[derive(Debug, Default)]
pub struct ThreePcLog {
    entries: BTreeMap<(ViewNumber, SeqNo), ThreePcEntry>,
    prepares: BTreeMap<VoteKey, BTreeSet<NodeId>>,
    commits: BTreeMap<VoteKey, BTreeSet<NodeId>>,
}

impl ThreePcLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, view: ViewNumber, seq: SeqNo) -> Option<&ThreePcEntry> {
        self.entries.get(&(view, seq))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a pre-prepare.
    ///
    /// Returns `Ok(true)` for a new entry and `Ok(false)` for a duplicate.
    /// A different digest at an occupied `(view, seq)` is rejected.
    pub fn record_pre_prepare(
        &mut self,
        view: ViewNumber,
        seq: SeqNo,
        request: ClientRequest,
    ) -> Result<bool, ThreePcError> {
        let digest = request.digest();
        if let Some(existing) = self.entries.get(&(view, seq)) {
            if existing.digest == digest {
                return Ok(false);
            }
            return Err(ThreePcError::ConflictingPrePrepare {
                view,
                seq,
                existing: existing.digest,
                proposed: digest,
            });
        }
        self.entries.insert(
            (view, seq),
            ThreePcEntry {
                view,
                seq,
                digest,
                request,
                phase: Phase::PrePrepared,
                voters: BTreeSet::new(),
            },
        );
        Ok(true)
    }

    /// Returns true if the vote is new.
    pub fn add_prepare(
        &mut self,
        view: ViewNumber,
        seq: SeqNo,
        digest: Digest,
        voter: NodeId,
    ) -> bool {
        self.prepares.entry((view, seq, digest)).or_default().insert(voter)
    }

    /// Returns true if the vote is new.
    pub fn add_commit(
        &mut self,
        view: ViewNumber,
        seq: SeqNo,
        digest: Digest,
        voter: NodeId,
    ) -> bool {
        self.commits.entry((view, seq, digest)).or_default().insert(voter)
    }

    pub fn prepare_count(&self, view: ViewNumber, seq: SeqNo, digest: Digest) -> usize {
        self.prepares.get(&(view, seq, digest)).map_or(0, |v| v.len())
    }

    pub fn commit_count(&self, view: ViewNumber, seq: SeqNo, digest: Digest) -> usize {
        self.commits.get(&(view, seq, digest)).map_or(0, |v| v.len())
    }

    /// Move a pre-prepared entry to `Prepared` once `quorum` replicas prepared
    /// its digest. Returns true only on the transition.
    pub fn try_mark_prepared(&mut self, view: ViewNumber, seq: SeqNo, quorum: usize) -> bool {
        let Some(entry) = self.entries.get_mut(&(view, seq)) else {
            return false;
        };
        if entry.phase != Phase::PrePrepared {
            return false;
        }
        let Some(voters) = self.prepares.get(&(view, seq, entry.digest)) else {
            return false;
        };
        if voters.len() < quorum {
            return false;
        }
        entry.voters = voters.clone();
        entry.phase = Phase::Prepared;
        debug!(view = view.0, seq = seq.0, voters = voters.len(), "Entry prepared");
        self.drop_superseded(view, seq);
        true
    }

    /// Forget uncommitted entries at `seq` from views below `view`.
    fn drop_superseded(&mut self, view: ViewNumber, seq: SeqNo) {
        let stale: Vec<(ViewNumber, SeqNo)> = self
            .entries
            .iter()
            .filter(|((v, s), e)| *s == seq && *v < view && e.phase != Phase::Committed)
            .map(|(key, _)| *key)
            .collect();
        for (v, s) in stale {
            self.entries.remove(&(v, s));
            self.prepares.retain(|(pv, ps, _), _| !(*pv == v && *ps == s));
            self.commits.retain(|(cv, cs, _), _| !(*cv == v && *cs == s));
        }
    }

    /// A prepared entry holding `quorum` commit votes for its digest.
    pub fn ready_to_commit(&self, view: ViewNumber, seq: SeqNo, quorum: usize) -> bool {
        self.entries.get(&(view, seq)).is_some_and(|entry| {
            entry.phase == Phase::Prepared && self.commit_count(view, seq, entry.digest) >= quorum
        })
    }

    /// Finalize an entry. Only `Prepared → Committed` is allowed; a committed
    /// entry is never touched again.
    pub fn mark_committed(
        &mut self,
        view: ViewNumber,
        seq: SeqNo,
    ) -> Result<&ThreePcEntry, ThreePcError> {
        match self.entries.get_mut(&(view, seq)) {
            Some(entry) if entry.phase == Phase::Prepared => {
                entry.phase = Phase::Committed;
                Ok(&*entry)
            }
            _ => Err(ThreePcError::NotPrepared { view, seq }),
        }
    }

    /// The highest-view entry at `seq` that is ready to commit.
    pub fn ready_at(&self, seq: SeqNo, quorum: usize) -> Option<ViewNumber> {
        self.entries
            .iter()
            .rev()
            .filter(|((_, s), _)| *s == seq)
            .map(|((v, _), _)| *v)
            .find(|v| self.ready_to_commit(*v, seq, quorum))
    }

    /// Certificates for entries prepared above `after`, one per sequence
    /// number, taken from the highest view that prepared it.
    pub fn prepared_certificates(&self, after: SeqNo) -> Vec<PreparedCertificate> {
        let mut best: BTreeMap<SeqNo, &ThreePcEntry> = BTreeMap::new();
        for entry in self.entries.values() {
            if entry.seq <= after || entry.phase == Phase::PrePrepared {
                continue;
            }
            match best.get(&entry.seq) {
                Some(existing) if existing.view >= entry.view => {}
                _ => {
                    best.insert(entry.seq, entry);
                }
            }
        }
        best.values().map(|e| e.certificate()).collect()
    }

    /// Drop pre-prepared entries and votes from views before `view`.
    ///
    /// Prepared entries survive until their sequence number commits or a
    /// higher view prepares it, so later view-change votes still carry them.
    pub fn discard_uncommitted_before(&mut self, view: ViewNumber) {
        let before = self.entries.len();
        self.entries
            .retain(|(v, _), entry| *v >= view || entry.phase != Phase::PrePrepared);
        let entries = &self.entries;
        self.prepares
            .retain(|(v, s, _), _| *v >= view || entries.contains_key(&(*v, *s)));
        self.commits
            .retain(|(v, s, _), _| *v >= view || entries.contains_key(&(*v, *s)));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(view = view.0, dropped, "Discarded pre-prepared entries from older views");
        }
    }

    /// Forget everything at or below `through`.
    pub fn prune(&mut self, through: SeqNo) {
        self.entries.retain(|(_, s), _| *s > through);
        self.prepares.retain(|(_, s, _), _| *s > through);
        self.commits.retain(|(_, s, _), _| *s > through);
    }

    /// No `(view, seq)` holds two committed digests.
    pub fn committed_digests_consistent(&self) -> bool {
        let mut seen: BTreeMap<(ViewNumber, SeqNo), Digest> = BTreeMap::new();
        for entry in self.entries.values().filter(|e| e.phase == Phase::Committed) {
            if let Some(d) = seen.insert((entry.view, entry.seq), entry.digest) {
                if d != entry.digest {
                    warn!(view = entry.view.0, seq = entry.seq.0, "Two digests committed");
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::RequestId;

    fn request(id: u64) -> ClientRequest {
        ClientRequest::new(RequestId(id), format!("op-{id}"))
    }

    #[test]
    fn test_conflicting_pre_prepare_rejected() {
        let mut log = ThreePcLog::new();
        let v = ViewNumber(0);
        assert_eq!(log.record_pre_prepare(v, SeqNo(1), request(1)), Ok(true));
        assert_eq!(log.record_pre_prepare(v, SeqNo(1), request(1)), Ok(false));
        let err = log.record_pre_prepare(v, SeqNo(1), request(2)).unwrap_err();
        assert!(matches!(err, ThreePcError::ConflictingPrePrepare { .. }));
        assert_eq!(log.get(v, SeqNo(1)).unwrap().digest, request(1).digest());
    }

    #[test]
    fn test_phases_advance_with_quorum() {
        let mut log = ThreePcLog::new();
        let (v, s) = (ViewNumber(1), SeqNo(3));
        let req = request(7);
        let digest = req.digest();

        // Votes may arrive before the pre-prepare.
        log.add_prepare(v, s, digest, NodeId(1));
        log.add_prepare(v, s, digest, NodeId(2));
        assert!(!log.try_mark_prepared(v, s, 3));

        log.record_pre_prepare(v, s, req).unwrap();
        assert!(!log.try_mark_prepared(v, s, 3));
        log.add_prepare(v, s, digest, NodeId(3));
        assert!(log.try_mark_prepared(v, s, 3));
        assert!(!log.try_mark_prepared(v, s, 3), "transition reported once");

        assert!(!log.ready_to_commit(v, s, 3));
        for voter in 0..3 {
            log.add_commit(v, s, digest, NodeId(voter));
        }
        assert!(log.ready_to_commit(v, s, 3));
        assert_eq!(log.ready_at(s, 3), Some(v));

        assert_eq!(log.mark_committed(v, s).unwrap().phase, Phase::Committed);
        assert_eq!(
            log.mark_committed(v, s).unwrap_err(),
            ThreePcError::NotPrepared { view: v, seq: s }
        );
        assert!(log.committed_digests_consistent());
    }

    #[test]
    fn test_votes_for_other_digest_do_not_count() {
        let mut log = ThreePcLog::new();
        let (v, s) = (ViewNumber(0), SeqNo(1));
        log.record_pre_prepare(v, s, request(1)).unwrap();
        let other = request(2).digest();
        for voter in 0..4 {
            log.add_prepare(v, s, other, NodeId(voter));
        }
        assert!(!log.try_mark_prepared(v, s, 3));
    }

    #[test]
    fn test_prepared_certificates_prefer_highest_view() {
        let mut log = ThreePcLog::new();
        for (view, id) in [(0, 1), (2, 2)] {
            let v = ViewNumber(view);
            let req = request(id);
            let digest = req.digest();
            log.record_pre_prepare(v, SeqNo(5), req).unwrap();
            for voter in 0..3 {
                log.add_prepare(v, SeqNo(5), digest, NodeId(voter));
            }
            assert!(log.try_mark_prepared(v, SeqNo(5), 3));
        }
        // Pre-prepared only: not a certificate.
        log.record_pre_prepare(ViewNumber(2), SeqNo(6), request(3)).unwrap();

        let certs = log.prepared_certificates(SeqNo(4));
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].view, ViewNumber(2));
        assert_eq!(certs[0].digest, request(2).digest());
        assert!(log.prepared_certificates(SeqNo(5)).is_empty());
    }

    fn prepared(log: &mut ThreePcLog, view: u64, seq: u64, req: ClientRequest) {
        let (v, s) = (ViewNumber(view), SeqNo(seq));
        let digest = req.digest();
        log.record_pre_prepare(v, s, req).unwrap();
        for voter in 0..3 {
            log.add_prepare(v, s, digest, NodeId(voter));
        }
        assert!(log.try_mark_prepared(v, s, 3));
    }

    #[test]
    fn test_discard_keeps_prepared_entries_from_older_views() {
        let mut log = ThreePcLog::new();
        prepared(&mut log, 0, 1, request(1));
        log.add_commit(ViewNumber(0), SeqNo(1), request(1).digest(), NodeId(0));

        log.discard_uncommitted_before(ViewNumber(1));
        log.discard_uncommitted_before(ViewNumber(2));

        let certs = log.prepared_certificates(SeqNo::ZERO);
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].view, ViewNumber(0));
        assert_eq!(certs[0].digest, request(1).digest());
        assert_eq!(log.commit_count(ViewNumber(0), SeqNo(1), request(1).digest()), 1);
    }

    #[test]
    fn test_higher_view_prepare_supersedes_older_entry() {
        let mut log = ThreePcLog::new();
        prepared(&mut log, 0, 1, request(1));
        log.record_pre_prepare(ViewNumber(0), SeqNo(2), request(2)).unwrap();
        prepared(&mut log, 2, 1, request(1));

        assert!(log.get(ViewNumber(0), SeqNo(1)).is_none());
        assert_eq!(log.prepare_count(ViewNumber(0), SeqNo(1), request(1).digest()), 0);
        assert!(log.get(ViewNumber(0), SeqNo(2)).is_some(), "other sequence numbers untouched");
        assert_eq!(log.prepared_certificates(SeqNo::ZERO)[0].view, ViewNumber(2));
    }

    #[test]
    fn test_discard_keeps_committed_and_newer_views() {
        let mut log = ThreePcLog::new();
        log.record_pre_prepare(ViewNumber(0), SeqNo(1), request(1)).unwrap();
        log.record_pre_prepare(ViewNumber(1), SeqNo(2), request(2)).unwrap();
        log.add_prepare(ViewNumber(0), SeqNo(1), request(1).digest(), NodeId(1));

        log.discard_uncommitted_before(ViewNumber(1));
        assert!(log.get(ViewNumber(0), SeqNo(1)).is_none());
        assert!(log.get(ViewNumber(1), SeqNo(2)).is_some());
        assert_eq!(log.prepare_count(ViewNumber(0), SeqNo(1), request(1).digest()), 0);

        log.prune(SeqNo(2));
        assert!(log.is_empty());
    }
}
