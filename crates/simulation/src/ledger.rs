//! In-memory ledger that outlives replica sessions.

use keel_core::{check_next, Ledger, LedgerError};
use keel_types::{CommittedEntry, SeqNo};

#[derive(Debug, Clone, Default)]
pub struct SimLedger {
    entries: Vec<CommittedEntry>,
}

impl SimLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[CommittedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Ledger for SimLedger {
    fn append_committed(&mut self, entry: CommittedEntry) -> Result<(), LedgerError> {
        check_next(self.last_committed_seq_no(), &entry)?;
        self.entries.push(entry);
        Ok(())
    }

    fn last_committed_seq_no(&self) -> SeqNo {
        self.entries.last().map_or(SeqNo::ZERO, |e| e.seq)
    }

    fn committed_entry(&self, seq: SeqNo) -> Option<CommittedEntry> {
        let index = usize::try_from(seq.0.checked_sub(1)?).ok()?;
        self.entries.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{ClientRequest, RequestId, ViewNumber};

    fn entry(seq: u64) -> CommittedEntry {
        let request = ClientRequest::new(RequestId(seq), vec![seq as u8]);
        CommittedEntry {
            view: ViewNumber(0),
            seq: SeqNo(seq),
            digest: request.digest(),
            request,
        }
    }

    #[test]
    fn test_appends_in_order_only() {
        let mut ledger = SimLedger::new();
        ledger.append_committed(entry(1)).unwrap();
        assert_eq!(
            ledger.append_committed(entry(3)),
            Err(LedgerError::OutOfOrder {
                expected: SeqNo(2),
                got: SeqNo(3)
            })
        );
        ledger.append_committed(entry(2)).unwrap();
        assert_eq!(ledger.last_committed_seq_no(), SeqNo(2));
        assert_eq!(ledger.committed_entry(SeqNo(0)), None);
        assert_eq!(ledger.entries_after(SeqNo(1), SeqNo(2)).len(), 1);
    }
}
