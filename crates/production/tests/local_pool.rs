//! Restarting replicas of a tokio pool.

use keel_core::{Ledger, NodeNotification};
use keel_node::ReplicaConfig;
use keel_production::{LocalPool, PoolError, ReplicaEvent, RunnerError};
use keel_types::{ClientRequest, CommittedEntry, NodeId, RequestId, SeqNo, ViewNumber};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_test::traced_test;

async fn wait_for(
    events: &mut broadcast::Receiver<ReplicaEvent>,
    within: Duration,
    mut done: impl FnMut(&ReplicaEvent) -> bool,
) -> bool {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if done(&event) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

async fn wait_for_replies(
    events: &mut broadcast::Receiver<ReplicaEvent>,
    request: RequestId,
    count: usize,
) -> bool {
    let mut replied = BTreeSet::new();
    wait_for(events, Duration::from_secs(10), |event| {
        if let ReplicaEvent::Reply {
            node, request_id, ..
        } = event
        {
            if *request_id == request {
                replied.insert(*node);
            }
        }
        replied.len() >= count
    })
    .await
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_requests_commit_everywhere() {
    let mut pool = LocalPool::new(4, ReplicaConfig::default()).unwrap();
    let mut events = pool.subscribe();
    pool.start_all().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let first = pool.submit("first").await;
    assert!(wait_for_replies(&mut events, first, 4).await);
    let second = pool.submit("second").await;
    assert!(wait_for_replies(&mut events, second, 4).await);

    for node in 0..4 {
        let ledger = pool.ledger(node).unwrap();
        assert_eq!(ledger.last_committed_seq_no(), SeqNo(2));
    }
    pool.shutdown().await.unwrap();
    assert!(pool.running_nodes().is_empty());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_restart_all_but_one() {
    let mut pool = LocalPool::new(4, ReplicaConfig::default()).unwrap();
    let mut events = pool.subscribe();
    pool.start_all().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let before = pool.submit("before").await;
    assert!(wait_for_replies(&mut events, before, 4).await);

    for node in 0..3 {
        pool.stop(node).await.unwrap();
    }
    for node in 0..3 {
        pool.start(node).unwrap();
    }

    let raised = wait_for(&mut events, Duration::from_secs(5), |event| {
        matches!(
            event,
            ReplicaEvent::Notification {
                node: NodeId(3),
                notification: NodeNotification::InconsistentThreePcState { .. },
            }
        )
    })
    .await;
    assert!(raised, "survivor never noticed the restart");

    let resolved = wait_for(&mut events, Duration::from_secs(10), |event| {
        matches!(
            event,
            ReplicaEvent::Notification {
                node: NodeId(3),
                notification: NodeNotification::InconsistencyResolved { .. },
            }
        )
    })
    .await;
    assert!(resolved, "survivor incident never resolved");

    pool.restart(3).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let after = pool.submit("after").await;
    assert!(wait_for_replies(&mut events, after, 4).await);
    for node in 0..4 {
        assert_eq!(
            pool.ledger(node).map(|l| l.last_committed_seq_no()),
            Some(SeqNo(2))
        );
    }
    pool.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_start_twice_rejected() {
    let mut pool = LocalPool::new(4, ReplicaConfig::default()).unwrap();
    pool.start(0).unwrap();
    assert!(pool.start(0).is_err());
    assert!(pool.start(9).is_err());
    pool.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_rejected_append_stops_replica() {
    let mut pool = LocalPool::new(4, ReplicaConfig::default()).unwrap();
    let mut events = pool.subscribe();
    pool.start_all().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Something else already wrote seq 1 into node 2's ledger.
    let stray = ClientRequest::new(RequestId(99), "stray");
    let mut ledger = pool.ledger(2).unwrap().clone();
    ledger
        .append_committed(CommittedEntry {
            view: ViewNumber(0),
            seq: SeqNo(1),
            digest: stray.digest(),
            request: stray,
        })
        .unwrap();

    let request = pool.submit("first").await;
    assert!(wait_for_replies(&mut events, request, 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = pool.stop(2).await;
    assert!(
        matches!(result, Err(PoolError::Runner(RunnerError::Ledger(_)))),
        "unexpected stop result: {result:?}"
    );
    assert_eq!(pool.ledger(2).unwrap().len(), 1);
    pool.shutdown().await.unwrap();
}
