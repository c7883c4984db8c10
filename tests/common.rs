//! Common test harness utilities for integration tests.
//!
//! - Building cluster configurations
//! - Spinning up simulated clusters with an elected leader
//! - Polling helpers for conditions that settle over several rounds

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use quorum_mesh::config::{ClusterNodeConfig, Config};
use quorum_mesh::membership::NodeId;
use quorum_mesh::time::SystemClock;
use quorum_mesh::toolkit::simulator::SimulatedCluster;
use std::future::Future;
use std::time::Duration;

pub fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

/// Default config for a cluster of `ids`, addressed as the first node.
pub fn cluster_config(ids: &[&str]) -> Config {
    let mut config = Config::for_node(ids[0]);
    config.cluster.nodes = ids.iter().map(|id| ClusterNodeConfig::named(*id)).collect();
    config
}

pub fn cluster(ids: &[&str]) -> SimulatedCluster<SystemClock> {
    SimulatedCluster::new(&cluster_config(ids), SystemClock).expect("build simulated cluster")
}

/// Cluster of `ids` where `leader` has won an election.
pub async fn cluster_led_by(ids: &[&str], leader: &str) -> SimulatedCluster<SystemClock> {
    let cluster = cluster(ids);
    let outcome = cluster.elect(&node(leader)).await.expect("known node");
    assert!(outcome.won, "{leader} failed to win: {outcome:?}");
    cluster
}

/// Re-evaluate `check` until it holds or `attempts` run out, pausing between tries.
pub async fn eventually<F, Fut>(attempts: usize, pause: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..attempts {
        if check().await {
            return true;
        }
        tokio::time::sleep(pause).await;
    }
    false
}
