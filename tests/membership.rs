//! Membership changes through the facade and their effect on the replication topology.

mod common;

use common::{cluster, cluster_led_by, node};
use quorum_mesh::membership::NodeDescriptor;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn registering_a_node_extends_the_topology() {
    let cluster = cluster(&["a", "b", "c"]);
    let engine = cluster.engine(&node("b")).unwrap();
    let before = engine.topology().expect("topology built at startup");
    assert_eq!(before.topology.nodes.len(), 3);

    engine.register_node(NodeDescriptor::new("d")).await.unwrap();
    let after = engine.topology().unwrap();
    assert_eq!(after.topology.nodes.len(), 4);
    assert!(after.topology.nodes.contains(&node("d")));

    engine.deregister_node(&node("d")).await.unwrap();
    let trimmed = engine.topology().unwrap();
    assert!(!trimmed.topology.nodes.contains(&node("d")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_adds_registered_nodes_to_the_voting_set() {
    let cluster = cluster_led_by(&["a", "b", "c"], "a").await;
    let leader = cluster.engine(&node("a")).unwrap();
    leader.register_node(NodeDescriptor::new("d")).await.unwrap();
    assert!(leader.consensus().core().members().contains(&node("d")));
    assert!(leader.topology().unwrap().topology.nodes.contains(&node("d")));
}
