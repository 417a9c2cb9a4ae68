//! The same seed reproduces the same run.

use keel_node::ReplicaConfig;
use keel_simulation::{
    NetworkConfig, NotificationRecord, RestartRecoveryOrchestrator, RestartTiming,
    SimulationRunner,
};
use keel_types::{Digest, SeqNo};
use std::time::Duration;
use tracing_test::traced_test;

fn run(seed: u64) -> (Vec<Vec<(SeqNo, Digest)>>, Vec<NotificationRecord>, u64) {
    let network = NetworkConfig::default()
        .with_pool_size(4)
        .with_packet_loss_rate(0.02);
    let mut runner = SimulationRunner::new(network, ReplicaConfig::default(), seed).unwrap();
    let orchestrator = RestartRecoveryOrchestrator::for_runner(&runner);

    runner.start_all();
    runner.run_for(Duration::from_secs(2));
    for i in 0..5 {
        runner.submit_request(format!("request-{i}"));
        runner.run_for(Duration::from_millis(100));
    }
    // Whether the group settles in time does not matter here, only that both
    // runs agree.
    let _ = orchestrator.execute_group(
        &mut runner,
        &[0, 1, 2],
        &RestartTiming::default().with_wait_for_elections(false),
    );
    runner.run_for(Duration::from_secs(3));

    let ledgers: Vec<Vec<(SeqNo, Digest)>> = (0..4)
        .map(|i| {
            runner
                .ledger(i)
                .map(|l| l.entries().iter().map(|e| (e.seq, e.digest)).collect())
                .unwrap_or_default()
        })
        .collect();
    (
        ledgers,
        runner.notifications().records().to_vec(),
        runner.stats().events_processed,
    )
}

#[traced_test]
#[test]
fn test_same_seed_same_run() {
    let first = run(99);
    let second = run(99);
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, second.1);
    assert_eq!(first.2, second.2);
    assert!(first.0.iter().any(|l| !l.is_empty()));
}

#[test]
fn test_different_seeds_agree_on_content() {
    for seed in [1, 2] {
        let (ledgers, _, _) = run(seed);
        let longest = ledgers.iter().max_by_key(|l| l.len()).cloned().unwrap_or_default();
        for ledger in &ledgers {
            assert_eq!(ledger.as_slice(), &longest[..ledger.len()], "seed {seed}");
        }
    }
}
