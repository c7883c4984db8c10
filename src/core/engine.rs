//! `CoordinationEngine`: one node's facade over membership, replication, consensus,
//! and fault tolerance.

use crate::config::Config;
use crate::consensus::{
    ConsensusError, ConsensusModule, ConsensusOutcome, PartitionRecovery, ProposalPriority,
    ProposalValue, RaftCore,
};
use crate::core::host::NodeHost;
use crate::fault::{
    FailureDetectionResult, FailureType, FaultToleranceSystem, NodeFailure, NodeRestarter,
    ProbeReport, RecoveryAction, RecoveryResult, RedundancyReport, RepairOutcome,
};
use crate::membership::{
    LoadBalancePlan, MembershipError, Node, NodeDescriptor, NodeId, NodeManager, NodeStatus,
};
use crate::ops::health::{overall_health, AlertLevel, AlertLog, HealthReport};
use crate::replication::{
    optimize_topology, strategy_for, ConflictResolutionResult, ConflictStrategy, ConsistencyLevel,
    ItemId, ItemPriority, LinkProfile, OptimizedTopology, ReadOutcome, ReplicableItem,
    ReplicaStore, ReplicationEngine, ReplicationError, ReplicationResult, ReplicationTopology,
    SyncReport, TopologyError, TopologyShape,
};
use crate::storage::DurableLog;
use crate::time::{unix_millis, Clock};
use crate::transport::Transport;
use anyhow::Context;
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error(transparent)]
    Replication(#[from] ReplicationError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Replicate API input. Unset fields fall back to the configured defaults.
#[derive(Debug, Clone)]
pub struct ReplicateRequest {
    pub item_id: ItemId,
    pub payload: Vec<u8>,
    pub consistency: Option<ConsistencyLevel>,
    pub replication_factor: Option<usize>,
    pub priority: ItemPriority,
}

impl ReplicateRequest {
    pub fn new(item_id: impl Into<ItemId>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            item_id: item_id.into(),
            payload: payload.into(),
            consistency: None,
            replication_factor: None,
            priority: ItemPriority::default(),
        }
    }

    pub fn consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency = Some(level);
        self
    }

    pub fn replication_factor(mut self, rf: usize) -> Self {
        self.replication_factor = Some(rf);
        self
    }

    pub fn priority(mut self, priority: ItemPriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicateResponse {
    pub item_id: ItemId,
    pub version: u64,
    /// Every one of the replication factor's replicas acknowledged.
    pub success: bool,
    /// The consistency level's ack threshold was met; the write is durable at that level
    /// even when `success` is false.
    pub strategy_satisfied: bool,
    pub replicas_achieved: usize,
    pub unreachable_nodes: Vec<NodeId>,
    pub latency_ms: u64,
    /// Write rounds, including retries against recomputed targets.
    pub attempts: u32,
    /// Log index of the committed `DataCommit`, when this node led and the commit succeeded.
    pub committed_index: Option<u64>,
    pub detail: ReplicationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposeResponse {
    pub accepted: bool,
    pub agreed_value: Option<ProposalValue>,
    pub term: u64,
    pub index: u64,
    pub rounds_required: u32,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureHandling {
    pub detection: FailureDetectionResult,
    pub recovery: RecoveryResult,
    pub isolated: bool,
    /// Outcome of removing the node from the voting set, when this node led.
    pub membership_change: Option<ConsensusOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub probe: ProbeReport,
    pub partition_recovery: Option<PartitionRecovery>,
    /// Recovery for nodes first declared failed by this cycle's probe round.
    pub failures: Vec<FailureHandling>,
    pub sync: SyncReport,
    pub redundancy: RedundancyReport,
    pub repair: RepairOutcome,
    pub topology: Option<OptimizedTopology>,
    pub load_balance: LoadBalancePlan,
}

pub struct CoordinationEngine<C: Clock> {
    config: Config,
    local: NodeId,
    membership: Arc<NodeManager<C>>,
    replication: ReplicationEngine<C>,
    consensus: ConsensusModule<C>,
    fault: Arc<FaultToleranceSystem<C>>,
    host: Arc<NodeHost<C>>,
    alerts: AlertLog,
    topology: RwLock<Option<OptimizedTopology>>,
}

impl<C: Clock> std::fmt::Debug for CoordinationEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationEngine")
            .field("local", &self.local)
            .field("role", &self.consensus.role())
            .field("term", &self.consensus.term())
            .field("nodes", &self.membership.len())
            .finish_non_exhaustive()
    }
}

fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(base_ms..=base_ms * 2))
}

impl<C: Clock> CoordinationEngine<C> {
    /// Wire up one node. The voting set starts as `cluster.nodes`, or just this node when
    /// no cluster is configured. The caller registers [`Self::host`] with the transport.
    pub fn new(
        config: Config,
        clock: C,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn DurableLog>,
    ) -> anyhow::Result<Self> {
        Self::build(config, clock, transport, storage, None)
    }

    /// As [`Self::new`], with a hook used to restart crashed peers during recovery.
    pub fn with_restarter(
        config: Config,
        clock: C,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn DurableLog>,
        restarter: Arc<dyn NodeRestarter>,
    ) -> anyhow::Result<Self> {
        Self::build(config, clock, transport, storage, Some(restarter))
    }

    fn build(
        config: Config,
        clock: C,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn DurableLog>,
        restarter: Option<Arc<dyn NodeRestarter>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let local = config.node_id();
        let mut members: Vec<NodeId> = config
            .cluster
            .nodes
            .iter()
            .map(|n| NodeId::from(n.id.as_str()))
            .collect();
        if members.is_empty() {
            members.push(local.clone());
        }
        let raft = Arc::new(
            RaftCore::new(
                local.clone(),
                members,
                clock.clone(),
                config.consensus.clone(),
                storage,
            )
            .with_context(|| format!("start consensus on {local}"))?,
        );
        let store = Arc::new(ReplicaStore::new(local.clone(), clock.clone()));
        let host = Arc::new(NodeHost::new(raft.clone(), store));
        let membership = Arc::new(NodeManager::new(
            clock.clone(),
            config.membership.clone(),
            config.fault.heartbeat_interval(),
        ));
        let replication = ReplicationEngine::new(
            local.clone(),
            clock,
            transport.clone(),
            config.replication.clone(),
        );
        let consensus = ConsensusModule::new(raft, transport.clone());
        let alerts = AlertLog::default();
        let mut fault = FaultToleranceSystem::new(
            local.clone(),
            config.fault.clone(),
            membership.clone(),
            replication.clone(),
            transport,
            alerts.clone(),
        );
        if let Some(restarter) = restarter {
            fault = fault.with_restarter(restarter);
        }
        Ok(Self {
            config,
            local,
            membership,
            replication,
            consensus,
            fault: Arc::new(fault),
            host,
            alerts,
            topology: RwLock::new(None),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn membership(&self) -> &Arc<NodeManager<C>> {
        &self.membership
    }

    pub fn replication(&self) -> &ReplicationEngine<C> {
        &self.replication
    }

    pub fn consensus(&self) -> &ConsensusModule<C> {
        &self.consensus
    }

    pub fn fault(&self) -> &Arc<FaultToleranceSystem<C>> {
        &self.fault
    }

    pub fn host(&self) -> Arc<NodeHost<C>> {
        self.host.clone()
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    pub fn topology(&self) -> Option<OptimizedTopology> {
        self.topology.read().clone()
    }

    /// Register every descriptor (the configured cluster when empty) and compute the
    /// initial replication topology. Already-registered nodes are skipped.
    pub fn initialize_network(&self, descriptors: Vec<NodeDescriptor>) -> Result<usize, CoordinationError> {
        let descriptors = if descriptors.is_empty() {
            self.config.cluster_descriptors()
        } else {
            descriptors
        };
        let mut registered = 0;
        for descriptor in descriptors {
            match self.membership.register(descriptor) {
                Ok(()) => registered += 1,
                Err(MembershipError::DuplicateNode(id)) => {
                    tracing::debug!(node = %id, "already registered");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if self.membership.get(&self.local).is_none() {
            self.membership.register(NodeDescriptor::new(self.local.clone()))?;
            registered += 1;
        }
        self.refresh_topology()?;
        tracing::info!(node = %self.local, registered, "network initialized");
        Ok(registered)
    }

    /// Register a node; the leader also proposes adding it to the voting set.
    pub async fn register_node(&self, descriptor: NodeDescriptor) -> Result<(), CoordinationError> {
        let id = descriptor.id.clone();
        self.membership.register(descriptor)?;
        if self.consensus.is_leader() && !self.consensus.core().members().contains(&id) {
            let result = self.consensus.add_member(&id).await?;
            if !result.is_committed() {
                tracing::warn!(node = %id, outcome = ?result.outcome, "voting-set addition not committed");
            }
        }
        self.refresh_topology_logged();
        Ok(())
    }

    /// Remove a node from membership and the replica registry; the leader also drops it
    /// from the voting set.
    pub async fn deregister_node(&self, id: &NodeId) -> Result<Node, CoordinationError> {
        let node = self.membership.deregister(id)?;
        let affected = self.replication.remove_node(id);
        if self.consensus.is_leader() && self.consensus.core().members().contains(id) {
            let result = self.consensus.remove_member(id).await?;
            if !result.is_committed() {
                tracing::warn!(node = %id, outcome = ?result.outcome, "voting-set removal not committed");
            }
        }
        tracing::info!(node = %id, items = affected.len(), "node deregistered");
        self.refresh_topology_logged();
        Ok(node)
    }

    /// Membership already changed; a topology that cannot be rebuilt keeps the old one.
    pub(crate) fn refresh_topology_logged(&self) {
        if let Err(err) = self.refresh_topology() {
            tracing::warn!(node = %self.local, error = %err, "topology refresh failed");
        }
    }

    fn next_item(&self, request: &ReplicateRequest) -> ReplicableItem {
        let consistency = request
            .consistency
            .unwrap_or(self.config.replication.default_consistency);
        let rf = request
            .replication_factor
            .unwrap_or(self.config.replication.replication_factor)
            .max(1);
        let registered = self.replication.current_version(&request.item_id).unwrap_or(0);
        let committed = self
            .consensus
            .core()
            .applied()
            .data
            .get(&request.item_id)
            .map_or(0, |d| d.version);
        ReplicableItem::at_version(
            request.item_id.clone(),
            request.payload.clone(),
            self.local.clone(),
            rf,
            consistency,
            registered.max(committed) + 1,
        )
        .with_priority(request.priority)
    }

    /// Write an item under the strategy its consistency level selects. Targets that do not
    /// answer are excluded and the write retried, up to `replication.max_retries` times;
    /// after that the partial result is returned.
    pub async fn replicate(&self, request: ReplicateRequest) -> Result<ReplicateResponse, CoordinationError> {
        let item = self.next_item(&request);
        let rf = item.metadata.replication_factor;
        let strategy = strategy_for(item.metadata.consistency, self.config.replication.weak_quorum);
        let started = tokio::time::Instant::now();
        let mut excluded: Vec<NodeId> = Vec::new();
        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            let targets = self.membership.select_targets(rf, &excluded);
            if targets.is_empty() {
                return Err(ReplicationError::NoTargets(item.id.clone()).into());
            }
            let result = self.replication.replicate(item.clone(), &targets, strategy).await?;
            if result.success || attempts > self.config.replication.max_retries || result.unreachable.is_empty() {
                break result;
            }
            tracing::info!(
                item = %item.id,
                attempt = attempts,
                unreachable = result.unreachable.len(),
                "retrying replication against recomputed targets"
            );
            excluded.extend(result.unreachable.iter().cloned());
        };
        let mut unreachable = excluded;
        unreachable.extend(result.unreachable.iter().cloned());
        unreachable.sort();
        unreachable.dedup();
        if !result.success && (!result.strategy_satisfied || !unreachable.is_empty()) {
            self.alerts.raise(
                AlertLevel::Warning,
                format!(
                    "{} partially replicated: {}/{} replicas, {} required by {}",
                    item.id, result.replicas_achieved, rf, result.required_acks, strategy
                ),
                unreachable.clone(),
            );
        }
        let committed_index = if result.strategy_satisfied && self.consensus.is_leader() {
            self.commit_data(&item).await
        } else {
            None
        };
        Ok(ReplicateResponse {
            item_id: item.id.clone(),
            version: item.version(),
            success: result.success,
            strategy_satisfied: result.strategy_satisfied,
            replicas_achieved: result.replicas_achieved,
            unreachable_nodes: unreachable,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
            committed_index,
            detail: result,
        })
    }

    async fn commit_data(&self, item: &ReplicableItem) -> Option<u64> {
        let value = ProposalValue::DataCommit {
            item_id: item.id.clone(),
            version: item.version(),
            checksum: item.metadata.checksum,
        };
        let proposal = self.consensus.propose(value, ProposalPriority::Normal).ok()?;
        let result = self.consensus.achieve_consensus(&proposal).await;
        result.is_committed().then_some(result.index)
    }

    /// Read an item. Items written through another coordinator are located by asking the
    /// live nodes first.
    pub async fn read(
        &self,
        item_id: &ItemId,
        consistency: Option<ConsistencyLevel>,
    ) -> Result<ReadOutcome, CoordinationError> {
        let record = match self.replication.record(item_id) {
            Some(record) => record,
            None => {
                self.replication
                    .locate(item_id, &self.membership.live_ids())
                    .await?
            }
        };
        let consistency = consistency.unwrap_or(record.metadata.consistency);
        Ok(self.replication.read(item_id, consistency).await?)
    }

    /// Propose a value and drive it to commit. Lost elections, timeouts, and term conflicts
    /// are retried with randomized backoff; after `consensus.max_proposal_attempts` the
    /// call fails with `Unavailable`. A follower that knows the leader rejects with
    /// `NotLeader` so the caller can redirect.
    pub async fn propose(&self, value: ProposalValue) -> Result<ProposeResponse, CoordinationError> {
        let max_attempts = self.config.consensus.max_proposal_attempts.max(1);
        let backoff = self.config.consensus.round_backoff();
        let mut last = String::from("no attempt made");
        for attempt in 1..=max_attempts {
            if !self.consensus.is_leader() {
                match self.consensus.leader() {
                    Some(leader) if leader != self.local => {
                        return Err(ConsensusError::NotLeader { leader: Some(leader) }.into());
                    }
                    _ => {
                        let election = self.consensus.start_election().await;
                        if !election.won {
                            last = format!("election for term {} lost", election.term);
                            tokio::time::sleep(jittered(backoff)).await;
                            continue;
                        }
                    }
                }
            }
            match self.consensus.propose(value.clone(), ProposalPriority::Normal) {
                Ok(proposal) => {
                    let result = self.consensus.achieve_consensus(&proposal).await;
                    if result.is_committed() {
                        return Ok(ProposeResponse {
                            accepted: true,
                            agreed_value: result.agreed_value,
                            term: result.term,
                            index: result.index,
                            rounds_required: result.rounds,
                            attempts: attempt,
                        });
                    }
                    last = format!("{:?} in term {}", result.outcome, result.term);
                }
                Err(ConsensusError::NotLeader { leader: Some(leader) }) if leader != self.local => {
                    return Err(ConsensusError::NotLeader { leader: Some(leader) }.into());
                }
                Err(err) => last = err.to_string(),
            }
            tracing::debug!(node = %self.local, attempt, reason = %last, "proposal retry");
            tokio::time::sleep(jittered(backoff)).await;
        }
        self.alerts.raise(
            AlertLevel::Critical,
            format!("consensus unavailable after {max_attempts} attempts: {last}"),
            vec![self.local.clone()],
        );
        Err(ConsensusError::Unavailable {
            attempts: max_attempts,
            last,
        }
        .into())
    }

    /// Recover a failed node: restart it, or re-replicate its items. A node that stays down
    /// is quarantined and, when this node leads, removed from the voting set.
    pub async fn handle_failure(&self, node: &NodeId) -> Result<FailureHandling, CoordinationError> {
        let detection = self.fault.detect_failure(node);
        let failure = detection.failure.clone().unwrap_or_else(|| NodeFailure {
            node_id: node.clone(),
            failure_type: FailureType::Crash,
            confidence: detection.confidence,
            timestamp_ms: unix_millis(),
            severity: FailureType::Crash.base_severity(),
        });
        let recovery = self.fault.recover(&failure).await;
        let mut isolated = false;
        let mut membership_change = None;
        if recovery.action == RecoveryAction::ReReplicated {
            self.fault.isolate(node)?;
            isolated = true;
            if self.consensus.is_leader() && self.consensus.core().members().contains(node) {
                let result = self.consensus.remove_member(node).await?;
                membership_change = Some(result.outcome);
            }
        }
        Ok(FailureHandling {
            detection,
            recovery,
            isolated,
            membership_change,
        })
    }

    pub fn health_report(&self) -> HealthReport {
        let snapshot = self.membership.health_snapshot();
        let members = snapshot
            .iter()
            .filter(|s| s.status != NodeStatus::Quarantined)
            .count();
        let live = snapshot.iter().filter(|s| s.status.is_live()).count();
        let per_node_health: BTreeMap<NodeId, f64> = snapshot
            .into_iter()
            .map(|s| (s.node_id, s.health_score))
            .collect();
        HealthReport {
            overall_health: overall_health(&per_node_health, live, members),
            per_node_health,
            alerts: self.alerts.snapshot(),
            leader: self.consensus.leader(),
            term: self.consensus.term(),
            generated_at: Utc::now(),
        }
    }

    /// Recompute the optimized replication topology over live nodes, using measured
    /// heartbeat latency and answer rate for links from this node.
    pub fn refresh_topology(&self) -> Result<Option<OptimizedTopology>, CoordinationError> {
        let nodes = self.membership.live_ids();
        if nodes.is_empty() {
            *self.topology.write() = None;
            return Ok(None);
        }
        let mut topology = ReplicationTopology::build(
            nodes.clone(),
            TopologyShape::Mesh,
            self.config.replication.replication_factor,
            LinkProfile::default(),
        );
        for node in nodes.iter().filter(|n| **n != self.local) {
            if let Some((rtt, answered)) = self.fault.link_estimate(node) {
                let bandwidth = self
                    .membership
                    .get(node)
                    .map_or(LinkProfile::default().bandwidth_mbps, |n| {
                        n.capabilities.bandwidth_mbps.max(1.0) as u64
                    });
                topology.set_link(
                    &self.local,
                    node,
                    LinkProfile {
                        bandwidth_mbps: bandwidth,
                        latency_ms: rtt.as_secs_f64() * 1000.0,
                        reliability: answered.clamp(0.01, 1.0),
                    },
                );
            }
        }
        let optimized = optimize_topology(&topology, self.config.replication.min_edge_reliability)?;
        *self.topology.write() = Some(optimized.clone());
        Ok(Some(optimized))
    }

    /// Act on a probe round: re-sync healed partitions when leading, then run failure
    /// handling for every node the round declared failed. A node is declared failed by
    /// exactly one round, so whoever ran that round owns its recovery.
    pub async fn handle_probe_report(
        &self,
        report: &ProbeReport,
    ) -> (Option<PartitionRecovery>, Vec<FailureHandling>) {
        let partition_recovery = if !report.healed.is_empty() && self.consensus.is_leader() {
            let recovery = self.consensus.handle_partition(&report.healed).await;
            tracing::info!(
                node = %self.local,
                converged = recovery.converged(),
                peers = recovery.peers.len(),
                "partition recovery finished"
            );
            Some(recovery)
        } else {
            None
        };
        let mut failures = Vec::with_capacity(report.newly_failed.len());
        for failure in &report.newly_failed {
            match self.handle_failure(&failure.node_id).await {
                Ok(handling) => failures.push(handling),
                Err(err) => {
                    tracing::warn!(node = %failure.node_id, error = %err, "failure handling failed");
                }
            }
        }
        (partition_recovery, failures)
    }

    /// One maintenance cycle: heartbeat round with its failure handling, partition repair,
    /// anti-entropy, redundancy repair, topology refresh, and a load-balance plan.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, CoordinationError> {
        let probe = self.fault.probe_round().await;
        let (partition_recovery, failures) = self.handle_probe_report(&probe).await;
        let sync = self.replication.sync_pass().await;
        let redundancy = self.fault.maintain_redundancy();
        let repair = self.fault.repair_redundancy(&redundancy).await;
        let topology = self.refresh_topology()?;
        let load_balance = self.membership.load_balance(&self.membership.live_ids());
        if load_balance.needs_rebalance() {
            tracing::info!(
                variance = load_balance.variance,
                moves = load_balance.suggestions.len(),
                "load rebalancing suggested"
            );
        }
        Ok(MaintenanceReport {
            probe,
            partition_recovery,
            failures,
            sync,
            redundancy,
            repair,
            topology,
            load_balance,
        })
    }

    /// Detect and resolve divergent copies of `item_id`. `Ok(None)` when copies agree.
    /// Failures raise an alert for manual intervention.
    pub async fn resolve_conflict(
        &self,
        item_id: &ItemId,
        strategy: ConflictStrategy,
    ) -> Result<Option<ConflictResolutionResult>, CoordinationError> {
        let Some(conflict) = self.replication.detect_conflict(item_id).await? else {
            return Ok(None);
        };
        match self
            .replication
            .resolve_conflict(&conflict, strategy, Some(&self.consensus))
            .await
        {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                self.alerts.raise(
                    AlertLevel::Warning,
                    format!("unresolved conflict on {item_id}: {err}"),
                    conflict.nodes(),
                );
                Err(err.into())
            }
        }
    }
}
