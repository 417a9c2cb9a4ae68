//! The inconsistency flag and the commit-path gate that reads it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Whether this replica may trust that its 3PC state is consistent with the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InconsistencyFlag {
    /// Fresh session; connectivity and catch-up not yet confirmed.
    Suspect = 0,
    Clear = 1,
    /// An inconsistency incident is in progress.
    Raised = 2,
}

impl InconsistencyFlag {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => InconsistencyFlag::Clear,
            2 => InconsistencyFlag::Raised,
            _ => InconsistencyFlag::Suspect,
        }
    }
}

/// Shared handle to a replica's [`InconsistencyFlag`].
///
/// The watcher is the only writer. The commit path reads it through
/// [`CommitGate::is_open`] immediately before finalizing an entry, so a flag
/// raised in the same step blocks the finalization.
#[derive(Debug, Clone)]
pub struct CommitGate {
    state: Arc<AtomicU8>,
}

impl CommitGate {
    /// New gate in the `Suspect` state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(InconsistencyFlag::Suspect as u8)),
        }
    }

    pub fn flag(&self) -> InconsistencyFlag {
        InconsistencyFlag::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Commits and new votes are only accepted while the flag is `Clear`.
    pub fn is_open(&self) -> bool {
        self.flag() == InconsistencyFlag::Clear
    }

    /// Store a new flag value, returning the previous one.
    pub fn set(&self, flag: InconsistencyFlag) -> InconsistencyFlag {
        InconsistencyFlag::from_u8(self.state.swap(flag as u8, Ordering::AcqRel))
    }
}

impl Default for CommitGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_only_open_when_clear() {
        let gate = CommitGate::new();
        let reader = gate.clone();
        assert_eq!(reader.flag(), InconsistencyFlag::Suspect);
        assert!(!reader.is_open());

        assert_eq!(gate.set(InconsistencyFlag::Clear), InconsistencyFlag::Suspect);
        assert!(reader.is_open());

        gate.set(InconsistencyFlag::Raised);
        assert!(!reader.is_open());
    }
}
