//! Replica configuration.

use keel_bft::BftConfig;
use keel_connectivity::{ConnectivityConfig, WatcherConfig};
use std::time::Duration;

/// Everything a replica session is tuned by.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub bft: BftConfig,
    pub connectivity: ConnectivityConfig,
    pub watcher: WatcherConfig,

    /// How long a fresh session waits for participating peers before it
    /// settles for any replies, and the lifetime of one lag-sync round.
    pub catchup_timeout: Duration,

    /// How long the primary may stay unreachable before an election starts.
    pub tolerate_primary_disconnection: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            bft: BftConfig::default(),
            connectivity: ConnectivityConfig::default(),
            watcher: WatcherConfig::default(),
            catchup_timeout: Duration::from_secs(1),
            tolerate_primary_disconnection: Duration::from_secs(2),
        }
    }
}

impl ReplicaConfig {
    pub fn with_bft(mut self, bft: BftConfig) -> Self {
        self.bft = bft;
        self
    }

    pub fn with_connectivity(mut self, connectivity: ConnectivityConfig) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_watcher(mut self, watcher: WatcherConfig) -> Self {
        self.watcher = watcher;
        self
    }

    /// Shorthand for toggling the inconsistency watcher.
    pub fn with_watcher_enabled(mut self, enabled: bool) -> Self {
        self.watcher.enabled = enabled;
        self
    }

    pub fn with_catchup_timeout(mut self, timeout: Duration) -> Self {
        self.catchup_timeout = timeout;
        self
    }

    pub fn with_tolerate_primary_disconnection(mut self, tolerate: Duration) -> Self {
        self.tolerate_primary_disconnection = tolerate;
        self
    }
}
