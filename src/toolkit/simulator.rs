use crate::config::{ClusterNodeConfig, Config};
use crate::consensus::ElectionOutcome;
use crate::core::engine::CoordinationEngine;
use crate::membership::NodeId;
use crate::storage::{DurableLog, FileLog, MemoryLog};
use crate::time::Clock;
use crate::transport::{MemoryNetwork, MessageHandler};
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A whole cluster in one process: one `CoordinationEngine` per configured node, wired
/// together through a [`MemoryNetwork`] that can crash, partition, and slow nodes down.
pub struct SimulatedCluster<C: Clock> {
    network: MemoryNetwork,
    engines: BTreeMap<NodeId, Arc<CoordinationEngine<C>>>,
}

impl<C: Clock> std::fmt::Debug for SimulatedCluster<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCluster")
            .field("nodes", &self.engines.keys().collect::<Vec<_>>())
            .field("network", &self.network)
            .finish()
    }
}

impl<C: Clock> SimulatedCluster<C> {
    /// Build every node listed in `base.cluster.nodes`. With `node.data_dir` set, each node
    /// keeps its Raft log under `<data_dir>/<node id>`; otherwise logs live in memory.
    pub fn new(base: &Config, clock: C) -> Result<Self> {
        if base.cluster.nodes.is_empty() {
            bail!("cluster.nodes is empty; nothing to simulate");
        }
        let network = MemoryNetwork::new();
        let mut engines = BTreeMap::new();
        for node in &base.cluster.nodes {
            let mut config = base.clone();
            config.node.id = node.id.clone();
            let storage: Arc<dyn DurableLog> = match &base.node.data_dir {
                Some(dir) => Arc::new(
                    FileLog::open(dir.join(&node.id))
                        .with_context(|| format!("open log for {}", node.id))?,
                ),
                None => Arc::new(MemoryLog::new()),
            };
            let engine = CoordinationEngine::with_restarter(
                config,
                clock.clone(),
                Arc::new(network.clone()),
                storage,
                Arc::new(network.clone()),
            )?;
            let handler: Arc<dyn MessageHandler> = engine.host();
            network.register(engine.local_id().clone(), handler);
            engines.insert(engine.local_id().clone(), Arc::new(engine));
        }
        let descriptors = base.cluster_descriptors();
        for engine in engines.values() {
            engine
                .initialize_network(descriptors.clone())
                .with_context(|| format!("initialize {}", engine.local_id()))?;
        }
        tracing::info!(nodes = engines.len(), "simulated cluster ready");
        Ok(Self { network, engines })
    }

    /// Cluster of `ids` with default settings everywhere else.
    pub fn with_nodes(ids: &[&str], clock: C) -> Result<Self> {
        let mut config = Config::for_node(ids.first().copied().unwrap_or("node-0"));
        config.cluster.nodes = ids.iter().map(|id| ClusterNodeConfig::named(*id)).collect();
        Self::new(&config, clock)
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.engines.keys().cloned().collect()
    }

    pub fn engine(&self, id: &NodeId) -> Option<Arc<CoordinationEngine<C>>> {
        self.engines.get(id).cloned()
    }

    pub fn engines(&self) -> impl Iterator<Item = &Arc<CoordinationEngine<C>>> {
        self.engines.values()
    }

    /// Engines whose node is not crashed.
    pub fn running(&self) -> Vec<Arc<CoordinationEngine<C>>> {
        self.engines
            .iter()
            .filter(|(id, _)| !self.network.is_crashed(id))
            .map(|(_, engine)| engine.clone())
            .collect()
    }

    /// The running leader with the highest term, if any.
    pub fn leader(&self) -> Option<Arc<CoordinationEngine<C>>> {
        self.running()
            .into_iter()
            .filter(|e| e.consensus().is_leader())
            .max_by_key(|e| e.consensus().term())
    }

    pub async fn elect(&self, id: &NodeId) -> Option<ElectionOutcome> {
        let engine = self.engine(id)?;
        Some(engine.consensus().start_election().await)
    }

    /// One timer step on every running node: leaders heartbeat, everyone else checks
    /// whether an election is due.
    pub async fn step(&self) {
        let steps = self.running().into_iter().map(|engine| async move {
            engine.consensus().tick().await;
            if engine.consensus().is_leader() {
                engine.consensus().send_heartbeats().await;
            }
        });
        futures::future::join_all(steps).await;
    }

    /// Step the cluster until a running node leads or `within` elapses.
    pub async fn wait_for_leader(&self, within: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + within;
        let pause = self
            .engines
            .values()
            .next()
            .map_or(Duration::from_millis(10), |e| {
                e.config().consensus.heartbeat_interval()
            });
        loop {
            if let Some(leader) = self.leader() {
                return Some(leader.local_id().clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            self.step().await;
            tokio::time::sleep(pause).await;
        }
    }

    pub fn crash(&self, id: &NodeId) -> bool {
        let crashed = self.network.crash(id);
        if crashed {
            tracing::warn!(node = %id, "node crashed");
        }
        crashed
    }

    pub fn restart(&self, id: &NodeId) -> bool {
        let restarted = self.network.restart(id);
        if restarted {
            tracing::info!(node = %id, "node restarted");
        }
        restarted
    }

    pub fn partition(&self, groups: &[Vec<NodeId>]) {
        tracing::warn!(groups = ?groups, "network partitioned");
        self.network.partition(groups);
    }

    pub fn heal(&self) {
        tracing::info!("network healed");
        self.network.heal();
    }

    pub fn set_latency(&self, id: &NodeId, latency: Duration) {
        self.network.set_latency(id, latency);
    }

    pub fn clear_latency(&self, id: &NodeId) {
        self.network.clear_latency(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SystemClock;

    #[test]
    fn empty_cluster_is_rejected() {
        let err = SimulatedCluster::new(&Config::default(), SystemClock).unwrap_err();
        assert!(err.to_string().contains("cluster.nodes"));
    }

    #[tokio::test]
    async fn cluster_elects_a_single_leader() {
        let cluster = SimulatedCluster::with_nodes(&["a", "b", "c"], SystemClock).unwrap();
        let outcome = cluster.elect(&"a".into()).await.unwrap();
        assert!(outcome.won);
        let leader = cluster.leader().unwrap();
        assert_eq!(leader.local_id(), &NodeId::from("a"));
        let leaders = cluster.engines().filter(|e| e.consensus().is_leader()).count();
        assert_eq!(leaders, 1);
        assert_eq!(cluster.engine(&"b".into()).unwrap().membership().len(), 3);
    }
}
