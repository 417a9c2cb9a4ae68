//! BFT configuration.

use std::time::Duration;

/// Tunables for ordering and view change.
#[derive(Debug, Clone)]
pub struct BftConfig {
    /// Base election timeout. Doubles with each failed attempt, capped at 64x.
    pub election_timeout: Duration,

    /// Failed election attempts before a `QuorumUnreachable` fault is reported.
    pub max_election_attempts: u32,

    /// How many sequence numbers the primary may run ahead of the last commit.
    pub max_inflight: u64,

    /// Committed entries kept in memory to answer catch-up requests.
    pub committed_retention: usize,

    /// A request pending longer than this starts an election.
    pub request_timeout: Duration,

    /// Maximum number of future-view 3PC messages held for replay.
    pub future_view_stash_limit: usize,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(2),
            max_election_attempts: 3,
            max_inflight: 64,
            committed_retention: 256,
            request_timeout: Duration::from_secs(5),
            future_view_stash_limit: 1024,
        }
    }
}

impl BftConfig {
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_max_election_attempts(mut self, attempts: u32) -> Self {
        self.max_election_attempts = attempts;
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: u64) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    pub fn with_committed_retention(mut self, retention: usize) -> Self {
        self.committed_retention = retention;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_future_view_stash_limit(mut self, limit: usize) -> Self {
        self.future_view_stash_limit = limit;
        self
    }
}
