//! Catch-up rounds.
//!
//! A round collects [`CatchupReply`]s until enough peers have answered, then
//! derives the view to adopt and the committed entries enough of them agree on.

use keel_messages::CatchupReply;
use keel_types::{CommittedEntry, Digest, NodeId, SeqNo, ViewNumber};
use std::collections::BTreeMap;

/// Why a round was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupPurpose {
    /// A fresh session rebuilding view and log before it participates.
    Restart,
    /// A participating replica that fell behind its peers.
    LagSync,
}

/// What a completed round tells us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchupOutcome {
    /// Highest view among the replies used.
    pub view: ViewNumber,
    /// Corroborated entries, contiguous from the local tip.
    pub entries: Vec<CommittedEntry>,
    /// Replies the outcome was derived from.
    pub responders: usize,
}

#[derive(Debug, Clone)]
pub struct CatchupRound {
    purpose: CatchupPurpose,
    timeouts: u32,
    replies: BTreeMap<NodeId, CatchupReply>,
}

impl CatchupRound {
    pub fn new(purpose: CatchupPurpose) -> Self {
        Self {
            purpose,
            timeouts: 0,
            replies: BTreeMap::new(),
        }
    }

    pub fn purpose(&self) -> CatchupPurpose {
        self.purpose
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn on_timeout(&mut self) {
        self.timeouts += 1;
    }

    /// Record a reply. A later reply from the same peer replaces the earlier one.
    pub fn record(&mut self, reply: CatchupReply) -> bool {
        self.replies.insert(reply.responder, reply).is_none()
    }

    pub fn reply_count(&self) -> usize {
        self.replies.len()
    }

    pub fn participating_count(&self) -> usize {
        self.replies.values().filter(|r| r.participating).count()
    }

    /// Outcome of a restart round, if it can complete.
    ///
    /// Completes once `needed` participating peers replied, using only them.
    /// After one timeout, any `needed` replies do: the whole pool may have
    /// restarted and nobody is participating yet.
    pub fn restart_outcome(
        &self,
        needed: usize,
        weak_quorum: usize,
        local_tip: SeqNo,
    ) -> Option<CatchupOutcome> {
        let participating: Vec<&CatchupReply> =
            self.replies.values().filter(|r| r.participating).collect();
        let used = if participating.len() >= needed {
            participating
        } else if self.timeouts > 0 && self.replies.len() >= needed {
            self.replies.values().collect()
        } else {
            return None;
        };
        let threshold = weak_quorum.min(used.len());
        Some(corroborate(&used, threshold, local_tip))
    }

    /// Outcome of a lag-sync round: `weak_quorum` participating replies.
    pub fn lag_outcome(&self, weak_quorum: usize, local_tip: SeqNo) -> Option<CatchupOutcome> {
        let participating: Vec<&CatchupReply> =
            self.replies.values().filter(|r| r.participating).collect();
        if participating.len() < weak_quorum {
            return None;
        }
        Some(corroborate(&participating, weak_quorum, local_tip))
    }
}

/// Walk forward from `local_tip`, taking each entry reported with the same
/// digest by at least `threshold` replies. Stops at the first gap.
fn corroborate(replies: &[&CatchupReply], threshold: usize, local_tip: SeqNo) -> CatchupOutcome {
    let view = replies
        .iter()
        .map(|r| r.view)
        .max()
        .unwrap_or(ViewNumber::GENESIS);

    let mut entries = vec![];
    let mut next = local_tip.next();
    loop {
        let mut votes: BTreeMap<Digest, (usize, &CommittedEntry)> = BTreeMap::new();
        for reply in replies {
            if let Some(entry) = reply.entries.iter().find(|e| e.seq == next) {
                votes.entry(entry.digest).or_insert((0, entry)).0 += 1;
            }
        }
        let Some((_, entry)) = votes
            .into_values()
            .find(|(count, _)| threshold > 0 && *count >= threshold)
        else {
            break;
        };
        entries.push(entry.clone());
        next = next.next();
    }

    CatchupOutcome {
        view,
        entries,
        responders: replies.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{ClientRequest, RequestId};

    fn entry(seq: u64, payload: &str) -> CommittedEntry {
        let request = ClientRequest::new(RequestId(seq), payload);
        CommittedEntry {
            view: ViewNumber(0),
            seq: SeqNo(seq),
            digest: request.digest(),
            request,
        }
    }

    fn reply(from: u32, view: u64, participating: bool, entries: Vec<CommittedEntry>) -> CatchupReply {
        CatchupReply {
            responder: NodeId(from),
            view: ViewNumber(view),
            participating,
            last_committed: entries.last().map_or(SeqNo::ZERO, |e| e.seq),
            entries,
        }
    }

    #[test]
    fn test_restart_completes_with_participating_replies() {
        let mut round = CatchupRound::new(CatchupPurpose::Restart);
        round.record(reply(0, 3, true, vec![entry(1, "a")]));
        assert!(round.restart_outcome(2, 2, SeqNo::ZERO).is_none());

        round.record(reply(1, 2, true, vec![entry(1, "a")]));
        let outcome = round.restart_outcome(2, 2, SeqNo::ZERO).unwrap();
        assert_eq!(outcome.view, ViewNumber(3));
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.responders, 2);
    }

    #[test]
    fn test_restart_settles_for_any_replies_after_timeout() {
        let mut round = CatchupRound::new(CatchupPurpose::Restart);
        round.record(reply(0, 1, true, vec![]));
        round.record(reply(1, 0, false, vec![]));
        round.record(reply(2, 0, false, vec![]));
        assert!(round.restart_outcome(2, 2, SeqNo::ZERO).is_none());

        round.on_timeout();
        let outcome = round.restart_outcome(2, 2, SeqNo::ZERO).unwrap();
        assert_eq!(outcome.view, ViewNumber(1));
        assert_eq!(outcome.responders, 3);
    }

    #[test]
    fn test_entries_need_corroboration_and_contiguity() {
        let mut round = CatchupRound::new(CatchupPurpose::LagSync);
        round.record(reply(0, 0, true, vec![entry(2, "b"), entry(3, "c"), entry(5, "e")]));
        round.record(reply(1, 0, true, vec![entry(2, "b"), entry(3, "x"), entry(5, "e")]));
        round.record(reply(2, 0, true, vec![entry(2, "b"), entry(3, "c")]));

        let outcome = round.lag_outcome(2, SeqNo(1)).unwrap();
        let seqs: Vec<SeqNo> = outcome.entries.iter().map(|e| e.seq).collect();
        // Seq 3 has two matching reports; 4 is a gap so 5 is not taken.
        assert_eq!(seqs, vec![SeqNo(2), SeqNo(3)]);
        assert_eq!(outcome.entries[1].digest, entry(3, "c").digest);
    }

    #[test]
    fn test_lag_sync_ignores_catching_up_peers() {
        let mut round = CatchupRound::new(CatchupPurpose::LagSync);
        round.record(reply(0, 0, true, vec![entry(1, "a")]));
        round.record(reply(1, 0, false, vec![entry(1, "a")]));
        assert!(round.lag_outcome(2, SeqNo::ZERO).is_none());
        assert_eq!(round.reply_count(), 2);
        assert_eq!(round.participating_count(), 1);
    }

    #[test]
    fn test_single_reply_counts_once() {
        let mut round = CatchupRound::new(CatchupPurpose::Restart);
        assert!(round.record(reply(0, 0, false, vec![])));
        assert!(!round.record(reply(0, 1, true, vec![])));
        assert_eq!(round.participating_count(), 1);
    }
}
