//! TOML configuration for a local pool.
//!
//! ```toml
//! [pool]
//! size = 4
//!
//! [consensus]
//! heartbeat_interval_ms = 250
//! election_timeout_ms = 2000
//! tolerate_primary_disconnection_ms = 2000
//!
//! [watcher]
//! enabled = true
//! uncertain_peer_threshold = 2
//! ```
//!
//! Every field is optional.

use keel_bft::BftConfig;
use keel_connectivity::{ConnectivityConfig, WatcherConfig};
use keel_node::ReplicaConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level pool configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolFileConfig {
    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub consensus: ConsensusSection,

    #[serde(default)]
    pub watcher: WatcherSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    /// Number of replicas.
    #[serde(default = "default_pool_size")]
    pub size: u32,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
        }
    }
}

fn default_pool_size() -> u32 {
    4
}

/// Consensus timing, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,

    #[serde(default = "default_catchup_timeout_ms")]
    pub catchup_timeout_ms: u64,

    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    #[serde(default = "default_tolerate_primary_disconnection_ms")]
    pub tolerate_primary_disconnection_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_election_attempts")]
    pub max_election_attempts: u32,

    #[serde(default = "default_max_inflight")]
    pub max_inflight: u64,

    #[serde(default = "default_committed_retention")]
    pub committed_retention: usize,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            silence_threshold_ms: default_silence_threshold_ms(),
            catchup_timeout_ms: default_catchup_timeout_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            tolerate_primary_disconnection_ms: default_tolerate_primary_disconnection_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_election_attempts: default_max_election_attempts(),
            max_inflight: default_max_inflight(),
            committed_retention: default_committed_retention(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    250
}

fn default_silence_threshold_ms() -> u64 {
    1000
}

fn default_catchup_timeout_ms() -> u64 {
    1000
}

fn default_election_timeout_ms() -> u64 {
    2000
}

fn default_tolerate_primary_disconnection_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_max_election_attempts() -> u32 {
    3
}

fn default_max_inflight() -> u64 {
    64
}

fn default_committed_retention() -> usize {
    256
}

/// Inconsistency watcher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSection {
    #[serde(default = "default_watcher_enabled")]
    pub enabled: bool,

    /// Uncertain peers tolerated before raising. Unset means `n - f - 1`.
    #[serde(default)]
    pub uncertain_peer_threshold: Option<usize>,

    #[serde(default = "default_recovery_window_ms")]
    pub recovery_window_ms: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: default_watcher_enabled(),
            uncertain_peer_threshold: None,
            recovery_window_ms: default_recovery_window_ms(),
        }
    }
}

fn default_watcher_enabled() -> bool {
    true
}

fn default_recovery_window_ms() -> u64 {
    30_000
}

impl PoolFileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".into()));
        }
        let c = &self.consensus;
        if c.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "consensus.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if c.silence_threshold_ms <= c.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "consensus.silence_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                c.silence_threshold_ms, c.heartbeat_interval_ms
            )));
        }
        if let Some(threshold) = self.watcher.uncertain_peer_threshold {
            if threshold >= self.pool.size as usize {
                return Err(ConfigError::Invalid(format!(
                    "watcher.uncertain_peer_threshold ({threshold}) must be below pool.size ({})",
                    self.pool.size
                )));
            }
        }
        Ok(())
    }

    pub fn replica_config(&self) -> ReplicaConfig {
        let c = &self.consensus;
        let bft = BftConfig::default()
            .with_election_timeout(Duration::from_millis(c.election_timeout_ms))
            .with_max_election_attempts(c.max_election_attempts)
            .with_max_inflight(c.max_inflight)
            .with_committed_retention(c.committed_retention)
            .with_request_timeout(Duration::from_millis(c.request_timeout_ms));
        let connectivity = ConnectivityConfig::default()
            .with_heartbeat_interval(Duration::from_millis(c.heartbeat_interval_ms))
            .with_silence_threshold(Duration::from_millis(c.silence_threshold_ms));
        let mut watcher = WatcherConfig::default()
            .with_enabled(self.watcher.enabled)
            .with_recovery_window(Duration::from_millis(self.watcher.recovery_window_ms));
        if let Some(threshold) = self.watcher.uncertain_peer_threshold {
            watcher = watcher.with_uncertain_peer_threshold(threshold);
        }

        ReplicaConfig::default()
            .with_bft(bft)
            .with_connectivity(connectivity)
            .with_watcher(watcher)
            .with_catchup_timeout(Duration::from_millis(c.catchup_timeout_ms))
            .with_tolerate_primary_disconnection(Duration::from_millis(
                c.tolerate_primary_disconnection_ms,
            ))
    }
}
