//! Durable committed-log collaborator.

use keel_types::{CommittedEntry, SeqNo};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("out-of-order append: expected {expected}, got {got}")]
    OutOfOrder { expected: SeqNo, got: SeqNo },
}

/// Storage for committed entries. Survives replica restarts.
///
/// Entries are appended strictly in sequence order starting at 1.
pub trait Ledger: Send + Sync {
    fn append_committed(&mut self, entry: CommittedEntry) -> Result<(), LedgerError>;

    /// Highest committed sequence number, `SeqNo::ZERO` when empty.
    fn last_committed_seq_no(&self) -> SeqNo;

    fn committed_entry(&self, seq: SeqNo) -> Option<CommittedEntry>;

    /// Entries in `(after, through]`, in order.
    fn entries_after(&self, after: SeqNo, through: SeqNo) -> Vec<CommittedEntry> {
        let mut out = Vec::new();
        let mut seq = after.next();
        while seq <= through {
            match self.committed_entry(seq) {
                Some(entry) => out.push(entry),
                None => break,
            }
            seq = seq.next();
        }
        out
    }
}

/// Check that `entry` is the next entry after `last`.
pub fn check_next(last: SeqNo, entry: &CommittedEntry) -> Result<(), LedgerError> {
    if entry.seq != last.next() {
        return Err(LedgerError::OutOfOrder {
            expected: last.next(),
            got: entry.seq,
        });
    }
    Ok(())
}
