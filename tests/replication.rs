//! Replicated writes and reads through `CoordinationEngine` over a simulated network.

mod common;

use common::{cluster, cluster_led_by, node};
use quorum_mesh::consensus::ProposalValue;
use quorum_mesh::core::engine::ReplicateRequest;
use quorum_mesh::replication::{
    ConflictStrategy, ConsistencyLevel, ItemId, ReplicaRole, ReplicableItem, ReplicaWrite,
    SyncStatus, WriteMode, WriteOutcome,
};
use quorum_mesh::transport::{Message, Transport};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn strong_write_leaves_a_majority_synchronized() {
    let cluster = cluster_led_by(&["a", "b", "c", "d", "e"], "a").await;
    let leader = cluster.engine(&node("a")).unwrap();
    let response = leader
        .replicate(ReplicateRequest::new("orders/1", b"pending".to_vec()).consistency(ConsistencyLevel::Strong))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.version, 1);
    assert!(response.committed_index.is_some());

    let record = leader.replication().record(&ItemId::from("orders/1")).unwrap();
    let synchronized = record
        .replicas
        .iter()
        .filter(|r| r.sync_status == SyncStatus::Synchronized)
        .count();
    assert!(synchronized >= 2, "{record:?}");

    let committed = leader.consensus().core().applied();
    assert_eq!(committed.data.get(&ItemId::from("orders/1")).map(|d| d.version), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versions_advance_on_rewrite() {
    let cluster = cluster_led_by(&["a", "b", "c"], "a").await;
    let leader = cluster.engine(&node("a")).unwrap();
    for (expected, value) in [(1, "v1"), (2, "v2"), (3, "v3")] {
        let response = leader
            .replicate(ReplicateRequest::new("k", value.as_bytes().to_vec()))
            .await
            .unwrap();
        assert_eq!(response.version, expected);
    }
    let read = leader.read(&ItemId::from("k"), None).await.unwrap();
    assert_eq!(read.item.content, b"v3".to_vec());
    assert_eq!(read.item.version(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn other_coordinators_locate_items_they_did_not_write() {
    let cluster = cluster_led_by(&["a", "b", "c"], "a").await;
    let leader = cluster.engine(&node("a")).unwrap();
    leader
        .replicate(ReplicateRequest::new("cfg", b"on".to_vec()))
        .await
        .unwrap();
    let other = cluster.engine(&node("c")).unwrap();
    assert!(other.replication().record(&ItemId::from("cfg")).is_none());
    let read = other
        .read(&ItemId::from("cfg"), Some(ConsistencyLevel::Strong))
        .await
        .unwrap();
    assert_eq!(read.item.content, b"on".to_vec());
    assert!(other.replication().record(&ItemId::from("cfg")).is_some());
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let cluster = cluster(&["a", "b"]);
    let item = ReplicableItem::new("dup", b"payload".to_vec(), node("a"), 2, ConsistencyLevel::Strong);
    let write = Message::ReplicaWrite(ReplicaWrite {
        item: item.clone(),
        role: ReplicaRole::Secondary,
        mode: WriteMode::Normal,
        primary: None,
    });
    let network = cluster.network();
    let timeout = Duration::from_millis(100);
    let first = network.call(&node("a"), &node("b"), write.clone(), timeout).await.unwrap();
    let second = network.call(&node("a"), &node("b"), write, timeout).await.unwrap();
    match (first, second) {
        (Message::ReplicaWriteAck(first), Message::ReplicaWriteAck(second)) => {
            assert_eq!(first.outcome, WriteOutcome::Stored { version: 1 });
            assert_eq!(second.outcome, WriteOutcome::AlreadyCurrent { version: 1 });
        }
        other => panic!("unexpected {other:?}"),
    }
    let host = cluster.engine(&node("b")).unwrap().host();
    assert_eq!(host.store().len(), 1);
    assert_eq!(host.store().version_of(&ItemId::from("dup")), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diverged_copy_is_resolved_by_last_write_wins() {
    let cluster = cluster_led_by(&["a", "b", "c"], "a").await;
    let leader = cluster.engine(&node("a")).unwrap();
    leader
        .replicate(ReplicateRequest::new("doc", b"v1".to_vec()))
        .await
        .unwrap();
    assert!(leader
        .resolve_conflict(&ItemId::from("doc"), ConflictStrategy::LastWriteWins)
        .await
        .unwrap()
        .is_none());

    let newer = ReplicableItem::at_version("doc", b"v9".to_vec(), node("c"), 3, ConsistencyLevel::Strong, 2);
    let store = cluster.engine(&node("c")).unwrap().host().store().clone();
    store.handle_write(ReplicaWrite {
        item: newer,
        role: ReplicaRole::Secondary,
        mode: WriteMode::Repair,
        primary: None,
    });

    let result = leader
        .resolve_conflict(&ItemId::from("doc"), ConflictStrategy::LastWriteWins)
        .await
        .unwrap()
        .expect("divergent copies");
    assert_eq!(result.source, node("c"));
    let read = leader.read(&ItemId::from("doc"), Some(ConsistencyLevel::Strong)).await.unwrap();
    assert_eq!(read.item.content, b"v9".to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn committed_data_advances_the_next_version() {
    let cluster = cluster_led_by(&["a", "b", "c"], "a").await;
    let leader = cluster.engine(&node("a")).unwrap();
    let response = leader
        .propose(ProposalValue::DataCommit {
            item_id: ItemId::from("seeded"),
            version: 4,
            checksum: 0,
        })
        .await
        .unwrap();
    assert!(response.accepted);
    let written = leader
        .replicate(ReplicateRequest::new("seeded", b"next".to_vec()))
        .await
        .unwrap();
    assert_eq!(written.version, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_short_of_the_replication_factor_is_partial() {
    let cluster = cluster_led_by(&["a", "b", "c"], "a").await;
    let leader = cluster.engine(&node("a")).unwrap();
    cluster.crash(&node("c"));
    let response = leader
        .replicate(ReplicateRequest::new("half", b"x".to_vec()).consistency(ConsistencyLevel::Strong))
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.replicas_achieved, 2);
    assert_eq!(response.unreachable_nodes, vec![node("c")]);
    assert_eq!(response.attempts, 2);
    assert!(leader.alerts().len() >= 1);
}
