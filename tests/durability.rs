//! Raft state survives a full restart when nodes keep their logs on disk.

mod common;

use common::{cluster_config, node};
use quorum_mesh::consensus::ProposalValue;
use quorum_mesh::time::SystemClock;
use quorum_mesh::toolkit::simulator::SimulatedCluster;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn term_and_log_are_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = cluster_config(&["a", "b", "c"]);
    config.node.data_dir = Some(dir.path().to_path_buf());

    let (term, entries) = {
        let cluster = SimulatedCluster::new(&config, SystemClock).unwrap();
        assert!(cluster.elect(&node("a")).await.unwrap().won);
        let leader = cluster.engine(&node("a")).unwrap();
        let response = leader
            .propose(ProposalValue::ConfigChange {
                key: "durable".into(),
                value: "yes".into(),
            })
            .await
            .unwrap();
        assert!(response.accepted);
        (leader.consensus().term(), leader.consensus().core().log_entries())
    };
    assert!(!entries.is_empty());
    assert!(dir.path().join("a").exists());

    let reopened = SimulatedCluster::new(&config, SystemClock).unwrap();
    let a = reopened.engine(&node("a")).unwrap();
    assert_eq!(a.consensus().term(), term);
    assert_eq!(a.consensus().core().log_entries(), entries);
}
