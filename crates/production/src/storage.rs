//! In-memory ledger shared across replica sessions.

use keel_core::{check_next, Ledger, LedgerError};
use keel_types::{CommittedEntry, SeqNo};
use parking_lot::RwLock;
use std::sync::Arc;

/// Committed log that outlives the replica session writing to it.
///
/// Clones share the same entries, so a pool can hand one clone to each
/// session and keep another to inspect or recover from.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    entries: Arc<RwLock<Vec<CommittedEntry>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<CommittedEntry> {
        self.entries.read().clone()
    }
}

impl Ledger for MemoryLedger {
    fn append_committed(&mut self, entry: CommittedEntry) -> Result<(), LedgerError> {
        let mut entries = self.entries.write();
        let last = entries.last().map_or(SeqNo::ZERO, |e| e.seq);
        check_next(last, &entry)?;
        entries.push(entry);
        Ok(())
    }

    fn last_committed_seq_no(&self) -> SeqNo {
        self.entries.read().last().map_or(SeqNo::ZERO, |e| e.seq)
    }

    fn committed_entry(&self, seq: SeqNo) -> Option<CommittedEntry> {
        let index = usize::try_from(seq.0.checked_sub(1)?).ok()?;
        self.entries.read().get(index).cloned()
    }
}
