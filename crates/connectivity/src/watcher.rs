//! Network inconsistency watcher.
//!
//! Owns the writer side of the [`CommitGate`]. The commit path only reads it.

use keel_core::{Action, LivenessFault, NodeNotification, Resolution, TimerId};
use keel_types::{CommitGate, InconsistencyFlag, NodeId, Topology};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the inconsistency watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// When false the watcher never raises. The gate still opens after catch-up.
    pub enabled: bool,

    /// Uncertain peers tolerated before raising. `None` means `n - f - 1`:
    /// with more uncertain peers than that, fewer than `n - f` replicas
    /// (counting ourselves) can vouch for the pool's 3PC state.
    pub uncertain_peer_threshold: Option<usize>,

    /// A raised flag still set after this long is reported as a liveness fault.
    pub recovery_window: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uncertain_peer_threshold: None,
            recovery_window: Duration::from_secs(30),
        }
    }
}

impl WatcherConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_uncertain_peer_threshold(mut self, threshold: usize) -> Self {
        self.uncertain_peer_threshold = Some(threshold);
        self
    }

    pub fn with_recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = window;
        self
    }
}

/// Decides whether the local replica's view of the pool's 3PC state is trustworthy.
pub struct NetworkInconsistencyWatcher {
    local: NodeId,
    pool_size: usize,
    fault_tolerance: usize,
    strong_quorum: usize,
    config: WatcherConfig,
    gate: CommitGate,

    /// Set once connectivity reached a level where an incident is meaningful.
    armed: bool,

    /// When the current incident was raised.
    raised_at: Option<Duration>,

    /// A view change completed after the current incident was raised.
    view_change_since_raise: bool,

    /// The current incident already produced an `InconsistencyUnresolved` fault.
    fault_reported: bool,

    incidents: u64,

    now: Duration,
}

impl std::fmt::Debug for NetworkInconsistencyWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkInconsistencyWatcher")
            .field("node", &self.local)
            .field("flag", &self.gate.flag())
            .field("armed", &self.armed)
            .field("incidents", &self.incidents)
            .finish()
    }
}

impl NetworkInconsistencyWatcher {
    pub fn new(topology: &dyn Topology, config: WatcherConfig, gate: CommitGate) -> Self {
        Self {
            local: topology.local_node_id(),
            pool_size: topology.pool_size(),
            fault_tolerance: topology.fault_tolerance(),
            strong_quorum: topology.strong_quorum(),
            config,
            gate,
            armed: false,
            raised_at: None,
            view_change_since_raise: false,
            fault_reported: false,
            incidents: 0,
            now: Duration::ZERO,
        }
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn flag(&self) -> InconsistencyFlag {
        self.gate.flag()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Incidents raised in this session.
    pub fn incidents(&self) -> u64 {
        self.incidents
    }

    pub fn threshold(&self) -> usize {
        self.config
            .uncertain_peer_threshold
            .unwrap_or(self.pool_size - self.fault_tolerance - 1)
    }

    /// Re-evaluate after connectivity changed.
    pub fn evaluate(&mut self, uncertain: usize) -> Vec<Action> {
        if !self.config.enabled {
            return vec![];
        }

        if !self.armed && uncertain <= self.fault_tolerance.min(self.threshold()) {
            debug!(node = %self.local, uncertain, "Inconsistency watcher armed");
            self.armed = true;
        }

        if self.armed && self.gate.flag() == InconsistencyFlag::Clear && uncertain > self.threshold()
        {
            return self.raise(uncertain);
        }
        vec![]
    }

    fn raise(&mut self, uncertain: usize) -> Vec<Action> {
        self.gate.set(InconsistencyFlag::Raised);
        self.armed = false;
        self.raised_at = Some(self.now);
        self.view_change_since_raise = false;
        self.fault_reported = false;
        self.incidents += 1;

        warn!(
            node = %self.local,
            uncertain,
            threshold = self.threshold(),
            pool_size = self.pool_size,
            "3PC state may be inconsistent, suspending ordering"
        );

        vec![
            Action::Notify {
                notification: NodeNotification::InconsistentThreePcState {
                    uncertain_peers: uncertain,
                    pool_size: self.pool_size,
                },
            },
            Action::SetTimer {
                id: TimerId::RecoveryWindow,
                duration: self.config.recovery_window,
            },
        ]
    }

    /// Try to resolve a raised incident.
    ///
    /// `corroborating` counts replicas, including ourselves, that report the
    /// same view and committed tip as we do.
    pub fn try_clear(&mut self, uncertain: usize, corroborating: usize) -> Vec<Action> {
        if self.gate.flag() != InconsistencyFlag::Raised || uncertain > self.fault_tolerance {
            return vec![];
        }

        let resolution = if corroborating >= self.strong_quorum {
            Resolution::LogConsistent
        } else if self.view_change_since_raise {
            Resolution::ViewChangeCompleted
        } else {
            return vec![];
        };

        self.gate.set(InconsistencyFlag::Clear);
        let raised_at = self.raised_at.take().unwrap_or(self.now);
        info!(
            node = %self.local,
            ?resolution,
            after = ?self.now.saturating_sub(raised_at),
            "Inconsistency resolved, resuming ordering"
        );

        vec![
            Action::Notify {
                notification: NodeNotification::InconsistencyResolved { resolution },
            },
            Action::CancelTimer {
                id: TimerId::RecoveryWindow,
            },
        ]
    }

    /// A view change to a higher view completed.
    pub fn on_view_change_completed(&mut self) {
        if self.gate.flag() == InconsistencyFlag::Raised {
            self.view_change_since_raise = true;
        }
    }

    /// Catch-up completed. Opens the gate of a fresh session.
    pub fn on_caught_up(&mut self) -> bool {
        if self.gate.flag() == InconsistencyFlag::Suspect {
            self.gate.set(InconsistencyFlag::Clear);
            debug!(node = %self.local, "Catch-up confirmed, commit gate open");
            return true;
        }
        false
    }

    pub fn on_recovery_window_elapsed(&mut self) -> Vec<Action> {
        let Some(raised_at) = self.raised_at else {
            return vec![];
        };
        if self.gate.flag() != InconsistencyFlag::Raised || self.fault_reported {
            return vec![];
        }
        self.fault_reported = true;
        let fault = LivenessFault::InconsistencyUnresolved {
            raised_at,
            window: self.config.recovery_window,
        };
        warn!(node = %self.local, %fault, "Liveness fault");
        vec![Action::Notify {
            notification: NodeNotification::LivenessFault(fault),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::PoolTopology;
    use tracing_test::traced_test;

    fn make_watcher(n: u32, config: WatcherConfig) -> (NetworkInconsistencyWatcher, CommitGate) {
        let topology = PoolTopology::sequential(NodeId(0), n).unwrap();
        let gate = CommitGate::new();
        let mut watcher = NetworkInconsistencyWatcher::new(&topology, config, gate.clone());
        assert!(watcher.on_caught_up());
        (watcher, gate)
    }

    fn raised(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    Action::Notify {
                        notification: NodeNotification::InconsistentThreePcState { .. }
                    }
                )
            })
            .count()
    }

    #[traced_test]
    #[test]
    fn test_does_not_fire_before_armed() {
        let (mut watcher, gate) = make_watcher(4, WatcherConfig::default());
        // Fresh session, never saw enough peers.
        assert!(watcher.evaluate(3).is_empty());
        assert_eq!(gate.flag(), InconsistencyFlag::Clear);
    }

    #[traced_test]
    #[test]
    fn test_fires_once_per_incident() {
        let (mut watcher, gate) = make_watcher(4, WatcherConfig::default());
        watcher.evaluate(0);
        assert!(watcher.is_armed());

        // Two peers gone is still tolerable for n = 4.
        assert!(watcher.evaluate(2).is_empty());

        let mut fired = raised(&watcher.evaluate(3));
        fired += raised(&watcher.evaluate(3));
        fired += raised(&watcher.evaluate(2));
        fired += raised(&watcher.evaluate(3));
        assert_eq!(fired, 1);
        assert_eq!(gate.flag(), InconsistencyFlag::Raised);
        assert_eq!(watcher.incidents(), 1);
    }

    #[traced_test]
    #[test]
    fn test_clear_requires_connectivity_and_evidence() {
        let (mut watcher, gate) = make_watcher(4, WatcherConfig::default());
        watcher.evaluate(0);
        watcher.evaluate(3);

        // Connectivity still poor.
        assert!(watcher.try_clear(2, 4).is_empty());
        // Connectivity fine, but only 2 of 3 needed replicas agree.
        assert!(watcher.try_clear(1, 2).is_empty());
        assert_eq!(gate.flag(), InconsistencyFlag::Raised);

        let actions = watcher.try_clear(0, 3);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Notify {
                notification: NodeNotification::InconsistencyResolved {
                    resolution: Resolution::LogConsistent
                }
            }
        )));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CancelTimer { id: TimerId::RecoveryWindow })));
        assert!(gate.is_open());
    }

    #[traced_test]
    #[test]
    fn test_view_change_clears_incident() {
        let (mut watcher, gate) = make_watcher(4, WatcherConfig::default());
        watcher.evaluate(0);
        watcher.evaluate(3);
        watcher.on_view_change_completed();

        let actions = watcher.try_clear(1, 1);
        assert!(matches!(
            actions.first(),
            Some(Action::Notify {
                notification: NodeNotification::InconsistencyResolved {
                    resolution: Resolution::ViewChangeCompleted
                }
            })
        ));
        assert!(gate.is_open());

        // A new incident needs fresh evidence.
        watcher.evaluate(0);
        watcher.evaluate(3);
        assert!(watcher.try_clear(1, 1).is_empty());
        assert_eq!(watcher.incidents(), 2);
    }

    #[test]
    fn test_disabled_watcher_never_raises() {
        let (mut watcher, gate) = make_watcher(4, WatcherConfig::default().with_enabled(false));
        watcher.evaluate(0);
        assert!(watcher.evaluate(3).is_empty());
        assert!(gate.is_open());
    }

    #[test]
    fn test_threshold_defaults_and_overrides() {
        let (watcher, _) = make_watcher(7, WatcherConfig::default());
        assert_eq!(watcher.threshold(), 4);

        let (mut watcher, _) =
            make_watcher(7, WatcherConfig::default().with_uncertain_peer_threshold(1));
        watcher.evaluate(0);
        assert_eq!(raised(&watcher.evaluate(2)), 1);
    }

    #[traced_test]
    #[test]
    fn test_unresolved_incident_reported_once() {
        let (mut watcher, _) = make_watcher(4, WatcherConfig::default());
        watcher.evaluate(0);
        watcher.set_time(Duration::from_secs(5));
        watcher.evaluate(3);

        let first = watcher.on_recovery_window_elapsed();
        assert!(matches!(
            first.as_slice(),
            [Action::Notify {
                notification: NodeNotification::LivenessFault(
                    LivenessFault::InconsistencyUnresolved { raised_at, .. }
                )
            }] if *raised_at == Duration::from_secs(5)
        ));
        assert!(watcher.on_recovery_window_elapsed().is_empty());
    }

    #[test]
    fn test_fresh_gate_is_suspect_until_caught_up() {
        let topology = PoolTopology::sequential(NodeId(0), 4).unwrap();
        let gate = CommitGate::new();
        let mut watcher =
            NetworkInconsistencyWatcher::new(&topology, WatcherConfig::default(), gate.clone());
        assert_eq!(gate.flag(), InconsistencyFlag::Suspect);
        // Suspect is not Clear, so nothing can be raised yet.
        watcher.evaluate(0);
        assert!(watcher.evaluate(3).is_empty());
        assert!(watcher.on_caught_up());
        assert!(!watcher.on_caught_up());
        assert!(gate.is_open());
    }
}
