//! Planned restarts of pool subsets, and the checks that decide when the
//! pool is usable again.

use crate::runner::SimulationRunner;
use crate::NodeIndex;
use keel_core::Ledger;
use keel_node::ReplicaConfig;
use keel_types::{Digest, InconsistencyFlag, RequestId, SeqNo, ViewNumber};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-replica share of the restart budget.
const PER_NODE_BUDGET: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestartError {
    #[error("node {0} is not a pool member")]
    UnknownNode(NodeIndex),

    #[error("restart group is empty")]
    EmptyGroup,

    #[error("pool did not stabilise within {waited:?}")]
    PoolNotStable { waited: Duration },

    #[error("view change from {from} did not complete within {waited:?}")]
    ViewChangeIncomplete { from: ViewNumber, waited: Duration },

    #[error("{replied} of {expected} replicas answered request {request:?} within {waited:?}")]
    NotFunctional {
        request: RequestId,
        replied: usize,
        expected: usize,
        waited: Duration,
    },
}

/// How one restart group is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartTiming {
    /// How long to wait after starting the group. `None` uses the pool budget.
    pub after_restart_timeout: Option<Duration>,
    /// Start the nodes one at a time, a heartbeat apart.
    pub start_one_by_one: bool,
    /// Wait for a stable pool. Otherwise only wait for the restarted nodes
    /// to finish catching up.
    pub wait_for_elections: bool,
}

impl Default for RestartTiming {
    fn default() -> Self {
        Self {
            after_restart_timeout: None,
            start_one_by_one: false,
            wait_for_elections: true,
        }
    }
}

impl RestartTiming {
    pub fn with_after_restart_timeout(mut self, timeout: Duration) -> Self {
        self.after_restart_timeout = Some(timeout);
        self
    }

    pub fn with_start_one_by_one(mut self, one_by_one: bool) -> Self {
        self.start_one_by_one = one_by_one;
        self
    }

    pub fn with_wait_for_elections(mut self, wait: bool) -> Self {
        self.wait_for_elections = wait;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartGroup {
    pub nodes: Vec<NodeIndex>,
    pub timing: RestartTiming,
}

/// Ordered restart groups. Consumed by [`RestartRecoveryOrchestrator::execute_plan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartPlan {
    groups: Vec<RestartGroup>,
}

impl RestartPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, nodes: impl Into<Vec<NodeIndex>>, timing: RestartTiming) -> Self {
        self.groups.push(RestartGroup {
            nodes: nodes.into(),
            timing,
        });
        self
    }

    pub fn groups(&self) -> &[RestartGroup] {
        &self.groups
    }
}

/// Stops and restarts node subsets of a simulated pool.
#[derive(Debug, Clone)]
pub struct RestartRecoveryOrchestrator {
    budget: Duration,
}

impl RestartRecoveryOrchestrator {
    pub fn new(pool_size: u32, config: &ReplicaConfig) -> Self {
        Self {
            budget: Self::budget_for(pool_size, config),
        }
    }

    pub fn for_runner(runner: &SimulationRunner) -> Self {
        Self::new(runner.pool_size(), runner.config())
    }

    /// Longest wait for one restart group to settle.
    ///
    /// Primary-disconnection tolerance plus one election and one catch-up
    /// round, plus a per-replica allowance. Grows with pool size.
    pub fn budget_for(pool_size: u32, config: &ReplicaConfig) -> Duration {
        config.tolerate_primary_disconnection
            + config.bft.election_timeout
            + config.catchup_timeout
            + PER_NODE_BUDGET * pool_size
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn execute_plan(
        &self,
        runner: &mut SimulationRunner,
        plan: RestartPlan,
    ) -> Result<(), RestartError> {
        for group in plan.groups {
            self.execute_group(runner, &group.nodes, &group.timing)?;
        }
        Ok(())
    }

    /// Stop `nodes`, start them again and wait for the pool to settle.
    pub fn execute_group(
        &self,
        runner: &mut SimulationRunner,
        nodes: &[NodeIndex],
        timing: &RestartTiming,
    ) -> Result<(), RestartError> {
        if nodes.is_empty() {
            return Err(RestartError::EmptyGroup);
        }
        if let Some(&unknown) = nodes.iter().find(|&&n| n >= runner.pool_size()) {
            return Err(RestartError::UnknownNode(unknown));
        }

        info!(
            ?nodes,
            one_by_one = timing.start_one_by_one,
            wait_for_elections = timing.wait_for_elections,
            time = ?runner.now(),
            "Restarting group"
        );

        for &node in nodes {
            runner.stop_node(node);
        }

        let gap = runner.config().connectivity.heartbeat_interval;
        for (i, &node) in nodes.iter().enumerate() {
            if timing.start_one_by_one && i > 0 {
                runner.run_for(gap);
            }
            runner.start_node(node);
        }

        let waited = timing.after_restart_timeout.unwrap_or(self.budget);
        let deadline = runner.now() + waited;

        if timing.wait_for_elections {
            if !runner.run_until_condition(deadline, pool_is_stable) {
                warn!(?nodes, ?waited, "Pool did not stabilise after restart");
                return Err(RestartError::PoolNotStable { waited });
            }
            debug!(?nodes, time = ?runner.now(), "Pool stable after restart");
            return Ok(());
        }

        let rejoined = runner.run_until_condition(deadline, |r| {
            nodes
                .iter()
                .all(|&n| r.node(n).is_some_and(|s| s.is_participating()))
        });
        if !rejoined {
            debug!(?nodes, ?waited, "Restarted nodes still catching up");
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pool checks
// ═══════════════════════════════════════════════════════════════════════════

/// A strong quorum is running, and every running replica participates in
/// the same view with no election under way and a clear flag.
pub fn pool_is_stable(runner: &SimulationRunner) -> bool {
    let running = runner.running_nodes();
    let n = runner.pool_size() as usize;
    let f = n.saturating_sub(1) / 3;
    if running.len() < n - f {
        return false;
    }

    let mut views = BTreeSet::new();
    for index in running {
        let Some(node) = runner.node(index) else {
            return false;
        };
        if !node.is_participating()
            || node.coordinator().is_electing()
            || node.flag() != InconsistencyFlag::Clear
        {
            return false;
        }
        views.insert(node.view().number);
    }
    views.len() == 1
}

/// Force a view change and wait until the pool is stable in a higher view.
pub fn ensure_view_change_complete(
    runner: &mut SimulationRunner,
    budget: Duration,
) -> Result<ViewNumber, RestartError> {
    let from = runner
        .running_nodes()
        .iter()
        .filter_map(|&i| runner.node(i).map(|n| n.view().number))
        .max()
        .unwrap_or(ViewNumber::GENESIS);

    runner.request_view_change();
    let deadline = runner.now() + budget;
    let done = runner.run_until_condition(deadline, |r| {
        pool_is_stable(r)
            && r.running_nodes()
                .iter()
                .all(|&i| r.node(i).is_some_and(|n| n.view().number > from))
    });
    if !done {
        return Err(RestartError::ViewChangeIncomplete {
            from,
            waited: budget,
        });
    }

    let view = runner
        .running_nodes()
        .first()
        .and_then(|&i| runner.node(i))
        .map_or(from, |n| n.view().number);
    info!(from = from.0, to = view.0, "View change complete");
    Ok(view)
}

/// Submit a fresh request and wait until every running replica answers it.
pub fn pool_is_functional(
    runner: &mut SimulationRunner,
    budget: Duration,
) -> Result<RequestId, RestartError> {
    let request = runner.submit_request(format!("liveness-check-{}", runner.now().as_millis()));
    let deadline = runner.now() + budget;
    let answered = runner.run_until_condition(deadline, |r| {
        r.reply_count(request) >= r.running_nodes().len()
    });
    if !answered {
        return Err(RestartError::NotFunctional {
            request,
            replied: runner.reply_count(request),
            expected: runner.running_nodes().len(),
            waited: budget,
        });
    }
    debug!(request = request.0, time = ?runner.now(), "Pool functional");
    Ok(request)
}

/// No sequence number is committed with two different digests anywhere,
/// stopped replicas included.
pub fn ledgers_consistent(runner: &SimulationRunner) -> bool {
    let mut seen: BTreeMap<SeqNo, Digest> = BTreeMap::new();
    for index in 0..runner.pool_size() {
        let Some(ledger) = runner.ledger(index) else {
            continue;
        };
        for entry in ledger.entries() {
            if *seen.entry(entry.seq).or_insert(entry.digest) != entry.digest {
                warn!(node = index, seq = entry.seq.0, "Conflicting commit");
                return false;
            }
        }
    }
    true
}

/// Every running replica holds the same committed log.
pub fn ensure_all_nodes_have_same_data(runner: &SimulationRunner) -> bool {
    let tips: BTreeSet<SeqNo> = runner
        .running_nodes()
        .iter()
        .filter_map(|&i| runner.ledger(i).map(|l| l.last_committed_seq_no()))
        .collect();
    tips.len() <= 1 && ledgers_consistent(runner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_grows_with_pool_size() {
        let config = ReplicaConfig::default();
        let small = RestartRecoveryOrchestrator::budget_for(4, &config);
        let large = RestartRecoveryOrchestrator::budget_for(7, &config);
        assert!(large > small);
        assert_eq!(large - small, PER_NODE_BUDGET * 3);
        assert!(small > config.tolerate_primary_disconnection + config.bft.election_timeout);
    }

    #[test]
    fn test_plan_keeps_group_order() {
        let plan = RestartPlan::new()
            .then(vec![0, 1, 2], RestartTiming::default().with_wait_for_elections(false))
            .then(vec![3], RestartTiming::default());
        let groups: Vec<&[NodeIndex]> = plan.groups().iter().map(|g| g.nodes.as_slice()).collect();
        assert_eq!(groups, vec![&[0, 1, 2][..], &[3][..]]);
        assert!(!plan.groups()[0].timing.wait_for_elections);
    }

    #[test]
    fn test_rejects_bad_groups() {
        let mut runner = SimulationRunner::new(
            crate::NetworkConfig::default(),
            ReplicaConfig::default(),
            1,
        )
        .unwrap();
        let orchestrator = RestartRecoveryOrchestrator::for_runner(&runner);
        assert_eq!(
            orchestrator.execute_group(&mut runner, &[], &RestartTiming::default()),
            Err(RestartError::EmptyGroup)
        );
        assert_eq!(
            orchestrator.execute_group(&mut runner, &[9], &RestartTiming::default()),
            Err(RestartError::UnknownNode(9))
        );
    }
}
