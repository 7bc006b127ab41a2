//! Restart and replay from durable commit logs.

mod common;

use common::{assert_chain_integrity, drain, test_runtime, TestCluster};
use hiera_consensus::{AdmissionError, ConsensusError, ConsensusEvent, ConsensusFault};
use hiera_storage::{FileLogProvider, LogProvider};
use hiera_types::Hash;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(60);

fn file_logs(dir: &TempDir, n: usize) -> Vec<Arc<dyn LogProvider>> {
    (0..n)
        .map(|i| {
            let provider = FileLogProvider::new(dir.path().join(format!("node-{i}")));
            Arc::new(provider) as Arc<dyn LogProvider>
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_restart_replays_identical_tip() {
    let dir = TempDir::new().unwrap();
    let mut cluster = TestCluster::with_logs(4, test_runtime(2), file_logs(&dir, 4)).start();
    let channel = cluster.channel_id();

    for i in 0..6 {
        cluster.node(0).submit(cluster.transaction(i)).unwrap();
    }
    cluster.wait_for_height(3, WAIT).await;
    // Let any in-flight round settle.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let before: Vec<_> = (0..4)
        .map(|i| cluster.node(i).get_chain_tip(&channel).unwrap())
        .collect();
    let chains: Vec<_> = (0..4).map(|i| cluster.blocks(i)).collect();
    for i in 0..4 {
        cluster.stop_node(i);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..4 {
        cluster.start_node(i);
    }
    for i in 0..4 {
        assert_eq!(cluster.node(i).get_chain_tip(&channel).unwrap(), before[i]);
        assert_eq!(cluster.blocks(i), chains[i]);
        assert_chain_integrity(&chains[i], Hash::ZERO, 3);
    }

    // Replayed transactions stay committed.
    let replayed = cluster.transaction(0);
    assert!(matches!(
        cluster.node(1).submit(replayed),
        Err(ConsensusError::Admission(AdmissionError::DuplicateId(_)))
    ));

    // The cluster resumes at the next sequence.
    let height = cluster.height(0);
    cluster.node(2).submit(cluster.transaction(100)).unwrap();
    cluster.node(2).submit(cluster.transaction(101)).unwrap();
    cluster.wait_for_height(height + 1, WAIT).await;
    for i in 0..4 {
        assert_chain_integrity(&cluster.blocks(i), Hash::ZERO, 3);
    }
    cluster.assert_agreement();
}

#[tokio::test(start_paused = true)]
async fn test_lagging_node_recovers_after_restart() {
    let dir = TempDir::new().unwrap();
    let mut cluster = TestCluster::with_logs(4, test_runtime(1), file_logs(&dir, 4)).start();

    cluster.stop_node(3);
    for i in 0..3 {
        cluster.node(0).submit(cluster.transaction(i)).unwrap();
    }
    cluster.wait_for_height(3, WAIT).await;

    cluster.start_node(3);
    assert_eq!(cluster.height(3), 0);
    cluster.node(0).submit(cluster.transaction(10)).unwrap();
    cluster.wait_for_height(4, WAIT).await;

    assert_chain_integrity(&cluster.blocks(3), Hash::ZERO, 3);
    cluster.assert_agreement();
}

#[tokio::test(start_paused = true)]
async fn test_single_node_file_restart() {
    let dir = TempDir::new().unwrap();
    let mut cluster = TestCluster::with_logs(1, test_runtime(1), file_logs(&dir, 1)).start();
    for i in 0..5 {
        cluster.node(0).submit(cluster.transaction(i)).unwrap();
    }
    cluster.wait_for_height(5, WAIT).await;
    let tip = cluster.node(0).get_chain_tip(&cluster.channel_id()).unwrap();

    cluster.stop_node(0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.start_node(0);
    assert_eq!(cluster.node(0).get_chain_tip(&cluster.channel_id()).unwrap(), tip);
    assert_chain_integrity(&cluster.blocks(0), Hash::ZERO, 1);
}

#[tokio::test(start_paused = true)]
async fn test_restarted_proposer_does_not_equivocate() {
    let dir = TempDir::new().unwrap();
    let mut cluster = TestCluster::with_logs(4, test_runtime(1), file_logs(&dir, 4));
    let proposer = cluster.proposer_index(0, 0);
    let witness = (0..4).find(|i| *i != proposer).unwrap();
    let others: Vec<_> = (0..4).filter(|i| *i != proposer && *i != witness).collect();

    // Two of four validators: the round-0 proposal cannot reach a quorum.
    cluster.start_node(proposer);
    cluster.start_node(witness);
    let mut proposed = cluster.node(proposer).subscribe();
    let mut observed = cluster.node(witness).subscribe();
    cluster.node(witness).submit(cluster.transaction(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!drain(&mut proposed, |e| matches!(e, ConsensusEvent::BlockProposed { .. })).is_empty());

    // After a restart the proposer has a different transaction to offer.
    cluster.stop_node(proposer);
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.start_node(proposer);
    cluster.node(proposer).submit(cluster.transaction(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in others {
        cluster.start_node(i);
    }
    cluster.wait_for_height(1, WAIT).await;

    let offender = cluster.keys[proposer].public_key();
    let equivocations = drain(&mut observed, |e| {
        matches!(
            e,
            ConsensusEvent::FaultDetected {
                fault: ConsensusFault::Equivocation { offender: o, .. },
                ..
            } if *o == offender
        )
    });
    assert!(equivocations.is_empty(), "proposer equivocated: {equivocations:?}");
    for i in 0..4 {
        assert_chain_integrity(&cluster.blocks(i), Hash::ZERO, 3);
    }
    cluster.assert_agreement();
}
