//! Failure detection, isolation, recovery, and redundancy maintenance.
//!
//! - `detector` - Consecutive-miss heartbeat monitor and failure taxonomy
//! - `partition` - Partition records and per-round classification
//! - `recovery` - Restart hook and recovery results
//! - `redundancy` - Redundancy gap planning

pub mod detector;
pub mod partition;
pub mod recovery;
pub mod redundancy;

pub use detector::{
    FailureDetectionResult, FailureType, HeartbeatMonitor, ImpactSeverity, NodeFailure, ProbeOutcome,
    ProbeState,
};
pub use partition::{classify_round, Partition, PartitionCause};
pub use recovery::{NodeRestarter, RecoveryAction, RecoveryResult};
pub use redundancy::{plan_redundancy, PlacementTask, RedundancyGap, RedundancyReport, RepairOutcome};

use crate::config::{Config, FaultConfig};
use crate::consensus::quorum;
use crate::membership::{MembershipError, NodeId, NodeManager, NodeStatus};
use crate::ops::health::{AlertLevel, AlertLog};
use crate::replication::{ItemId, ReplicaRole, ReplicationEngine};
use crate::time::Clock;
use crate::toolkit::chaos::{self, ChaosScenario, ScenarioReport};
use crate::transport::{unexpected, Heartbeat, Message, Transport};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What one heartbeat round observed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    pub probed: usize,
    pub answered: Vec<NodeId>,
    pub missed: Vec<NodeId>,
    pub detections: Vec<FailureDetectionResult>,
    /// Nodes declared failed in this round.
    pub newly_failed: Vec<NodeFailure>,
    /// Failed or degraded nodes that answered normally again.
    pub recovered: Vec<NodeId>,
    pub partition: Option<Partition>,
    /// Partitions whose nodes all answered this round.
    pub healed: Vec<Partition>,
}

pub struct FaultToleranceSystem<C: Clock> {
    local: NodeId,
    config: FaultConfig,
    membership: Arc<NodeManager<C>>,
    replication: ReplicationEngine<C>,
    transport: Arc<dyn Transport>,
    restarter: Option<Arc<dyn NodeRestarter>>,
    alerts: AlertLog,
    monitor: Mutex<HeartbeatMonitor>,
    partitions: Mutex<Vec<Partition>>,
    sequence: AtomicU64,
}

impl<C: Clock> std::fmt::Debug for FaultToleranceSystem<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultToleranceSystem")
            .field("local", &self.local)
            .field("partitions", &self.partitions.lock().len())
            .finish_non_exhaustive()
    }
}

impl<C: Clock> FaultToleranceSystem<C> {
    pub fn new(
        local: NodeId,
        config: FaultConfig,
        membership: Arc<NodeManager<C>>,
        replication: ReplicationEngine<C>,
        transport: Arc<dyn Transport>,
        alerts: AlertLog,
    ) -> Self {
        Self {
            local,
            monitor: Mutex::new(HeartbeatMonitor::new(config.clone())),
            config,
            membership,
            replication,
            transport,
            restarter: None,
            alerts,
            partitions: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_restarter(mut self, restarter: Arc<dyn NodeRestarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    pub fn active_partitions(&self) -> Vec<Partition> {
        self.partitions.lock().clone()
    }

    /// Last heartbeat round-trip to `node` and the fraction of probes it answered.
    pub fn link_estimate(&self, node: &NodeId) -> Option<(std::time::Duration, f64)> {
        let monitor = self.monitor.lock();
        let state = monitor.state(node)?;
        let rtt = state.last_rtt?;
        let answered = state.probes.saturating_sub(state.misses) as f64 / state.probes.max(1) as f64;
        Some((rtt, answered))
    }

    async fn probe(&self, node: NodeId) -> (NodeId, ProbeOutcome) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let started = tokio::time::Instant::now();
        let reply = self
            .transport
            .call(
                &self.local,
                &node,
                Message::Heartbeat(Heartbeat { sequence }),
                self.config.heartbeat_interval(),
            )
            .await;
        let outcome = match reply {
            Ok(Message::HeartbeatAck(ack)) => ProbeOutcome::Answered {
                rtt: started.elapsed(),
                load_factor: ack.load_factor,
            },
            Ok(other) => ProbeOutcome::Missed(unexpected("heartbeat_ack", &other)),
            Err(err) => ProbeOutcome::Missed(err),
        };
        (node, outcome)
    }

    /// One heartbeat to every non-quarantined peer. A miss only bumps the node's counter;
    /// status changes to `Failed` once the miss threshold is reached.
    pub async fn probe_round(&self) -> ProbeReport {
        let targets: Vec<(NodeId, NodeStatus)> = self
            .membership
            .all()
            .into_iter()
            .filter(|n| n.id != self.local && n.status != NodeStatus::Quarantined)
            .map(|n| (n.id, n.status))
            .collect();
        let outcomes = join_all(targets.iter().map(|(id, _)| self.probe(id.clone()))).await;

        let mut report = ProbeReport {
            probed: targets.len(),
            ..ProbeReport::default()
        };
        let mut newly_lost = BTreeSet::new();
        let mut unreachable = BTreeSet::new();
        {
            let mut monitor = self.monitor.lock();
            for (node, outcome) in outcomes {
                let was_answering = monitor
                    .state(&node)
                    .map_or(true, |s| s.consecutive_misses == 0);
                match &outcome {
                    ProbeOutcome::Answered { load_factor, .. } => {
                        if let Err(err) = self.membership.record_heartbeat(&node, Some(*load_factor)) {
                            tracing::debug!(node = %node, error = %err, "heartbeat from unknown node");
                        }
                        report.answered.push(node.clone());
                    }
                    ProbeOutcome::Missed(err) => {
                        tracing::debug!(node = %node, error = %err, "heartbeat missed");
                        if err.is_transient() && was_answering {
                            newly_lost.insert(node.clone());
                        }
                        unreachable.insert(node.clone());
                        report.missed.push(node.clone());
                    }
                }
                monitor.record(&node, outcome);
            }
        }

        report.healed = self.heal_partitions(&unreachable);
        report.partition = self.detect_partition(&newly_lost, &unreachable, report.answered.len(), targets.len() + 1);

        for (node, status) in targets {
            let result = self.detect_failure(&node);
            let answered_cleanly = result.consecutive_misses == 0
                && result.slow_responses == 0
                && report.answered.contains(&node);
            if result.failed && status.is_live() {
                if let Some(failure) = result.failure.clone() {
                    report.newly_failed.push(self.declare_failed(failure));
                }
            } else if !result.failed
                && status == NodeStatus::Active
                && result.failure.as_ref().map(|f| f.failure_type) == Some(FailureType::Performance)
            {
                self.set_status(&node, NodeStatus::Degraded);
                self.alerts.raise(
                    AlertLevel::Warning,
                    format!("node {node} violates heartbeat response SLA"),
                    vec![node.clone()],
                );
            } else if answered_cleanly && matches!(status, NodeStatus::Failed | NodeStatus::Degraded) {
                self.set_status(&node, NodeStatus::Active);
                tracing::info!(node = %node, "node answering heartbeats again");
                report.recovered.push(node.clone());
            }
            report.detections.push(result);
        }
        report
    }

    fn set_status(&self, node: &NodeId, status: NodeStatus) {
        if let Err(err) = self.membership.set_status(node, status) {
            tracing::warn!(node = %node, error = %err, "status update failed");
        }
    }

    fn declare_failed(&self, mut failure: NodeFailure) -> NodeFailure {
        let node = failure.node_id.clone();
        self.set_status(&node, NodeStatus::Failed);
        let hosted = self.replication.mark_node_failed(&node);
        let members = self
            .membership
            .all()
            .iter()
            .filter(|n| n.status != NodeStatus::Quarantined)
            .count();
        let live = self.membership.live_ids().len();
        let hosts_primary = hosted.iter().any(|id| {
            self.replication.record(id).map_or(false, |r| {
                r.replicas
                    .iter()
                    .any(|rep| rep.node_id == node && rep.role == ReplicaRole::Primary)
            })
        });
        if live < quorum(members.max(1)) {
            failure.severity = ImpactSeverity::Critical;
        } else if hosts_primary {
            failure.severity = failure.severity.max(ImpactSeverity::High);
        }
        let level = if failure.severity == ImpactSeverity::Critical {
            AlertLevel::Critical
        } else {
            AlertLevel::Warning
        };
        self.alerts.raise(
            level,
            format!(
                "node {node} declared failed ({:?}, {} items affected)",
                failure.failure_type,
                hosted.len()
            ),
            vec![node],
        );
        failure
    }

    /// Current verdict for `node` from its probe history.
    pub fn detect_failure(&self, node: &NodeId) -> FailureDetectionResult {
        let partitioned = self.partitions.lock().iter().any(|p| p.contains(node));
        self.monitor.lock().assess(node, partitioned)
    }

    /// Record a partition when two or more nodes vanished in the same round, or this node
    /// can no longer see a majority. `members` includes this node.
    pub fn detect_partition(
        &self,
        newly_lost: &BTreeSet<NodeId>,
        unreachable: &BTreeSet<NodeId>,
        reachable: usize,
        members: usize,
    ) -> Option<Partition> {
        let estimate = self.config.heartbeat_interval() * self.config.miss_threshold.max(1);
        let partition = classify_round(newly_lost, unreachable, reachable, members, estimate)?;
        let mut partitions = self.partitions.lock();
        if partitions
            .iter()
            .any(|p| p.unreachable == partition.unreachable)
        {
            return None;
        }
        self.alerts.raise(
            AlertLevel::Warning,
            format!("partition detected ({:?})", partition.cause),
            partition.unreachable.iter().cloned().collect(),
        );
        partitions.push(partition.clone());
        Some(partition)
    }

    fn heal_partitions(&self, unreachable: &BTreeSet<NodeId>) -> Vec<Partition> {
        let mut partitions = self.partitions.lock();
        let (healed, open): (Vec<Partition>, Vec<Partition>) = partitions
            .drain(..)
            .partition(|p| p.unreachable.is_disjoint(unreachable));
        *partitions = open;
        for partition in &healed {
            tracing::info!(partition = %partition.id, nodes = partition.unreachable.len(), "partition healed");
        }
        healed
    }

    /// Quarantine `node`: no further probes, and its replicas leave the registry.
    pub fn isolate(&self, node: &NodeId) -> Result<Vec<ItemId>, MembershipError> {
        self.membership.set_status(node, NodeStatus::Quarantined)?;
        self.monitor.lock().forget(node);
        let affected = self.replication.remove_node(node);
        self.alerts.raise(
            AlertLevel::Warning,
            format!("node {node} quarantined ({} items re-homed)", affected.len()),
            vec![node.clone()],
        );
        Ok(affected)
    }

    /// Try to restart a crashed or unreachable node; if it stays down, copy its items from
    /// surviving replicas to other live nodes.
    pub async fn recover(&self, failure: &NodeFailure) -> RecoveryResult {
        let started = tokio::time::Instant::now();
        let node = failure.node_id.clone();
        let mut result = RecoveryResult {
            node_id: node.clone(),
            failure_type: failure.failure_type,
            action: RecoveryAction::Deferred,
            restart_attempts: 0,
            re_replicated: Vec::new(),
            unrecovered: Vec::new(),
            recovered: false,
            duration: Default::default(),
        };
        if matches!(failure.failure_type, FailureType::Performance | FailureType::Partition) {
            result.duration = started.elapsed();
            return result;
        }

        if let Some(restarter) = &self.restarter {
            for attempt in 1..=self.config.restart_attempts {
                result.restart_attempts = attempt;
                if !restarter.restart(&node) {
                    continue;
                }
                let (_, outcome) = self.probe(node.clone()).await;
                if let ProbeOutcome::Answered { load_factor, .. } = outcome {
                    self.monitor.lock().reset(&node);
                    if let Err(err) = self.membership.record_heartbeat(&node, Some(load_factor)) {
                        tracing::debug!(node = %node, error = %err, "heartbeat from unknown node");
                    }
                    self.set_status(&node, NodeStatus::Active);
                    let sync = self.replication.sync_pass().await;
                    tracing::info!(node = %node, attempt, repaired = sync.repaired, "node restarted");
                    result.action = RecoveryAction::Restarted;
                    result.recovered = true;
                    result.duration = started.elapsed();
                    return result;
                }
            }
        }

        result.action = RecoveryAction::ReReplicated;
        for item in self.replication.mark_node_failed(&node) {
            let exclude = self
                .replication
                .record(&item)
                .map(|r| r.nodes())
                .unwrap_or_default();
            let Some(target) = self.membership.select_targets(1, &exclude).into_iter().next() else {
                result.unrecovered.push(item);
                continue;
            };
            match self.replication.re_replicate(&item, &target).await {
                Ok(()) => result.re_replicated.push((item, target)),
                Err(err) => {
                    tracing::warn!(item = %item, node = %target, error = %err, "re-replication failed");
                    result.unrecovered.push(item);
                }
            }
        }
        result.recovered = result.unrecovered.is_empty();
        if !result.recovered {
            self.alerts.raise(
                AlertLevel::Critical,
                format!(
                    "{} items below replication target after losing {node}",
                    result.unrecovered.len()
                ),
                vec![node],
            );
        }
        result.duration = started.elapsed();
        result
    }

    /// Gap between each item's healthy replicas and its replication factor, with placements.
    pub fn maintain_redundancy(&self) -> RedundancyReport {
        let registry = self.replication.registry_snapshot();
        let report = plan_redundancy(
            &registry,
            |node| self.membership.status(node).map_or(false, NodeStatus::is_live),
            |count, exclude| self.membership.select_targets(count, exclude),
        );
        if !report.unplaceable.is_empty() {
            self.alerts.raise(
                AlertLevel::Critical,
                format!(
                    "{} items cannot reach their replication factor",
                    report.unplaceable.len()
                ),
                Vec::new(),
            );
        } else if !report.is_satisfied() {
            tracing::info!(
                gaps = report.gaps.len(),
                missing = report.total_gap(),
                "redundancy below target"
            );
        }
        report
    }

    pub async fn repair_redundancy(&self, report: &RedundancyReport) -> RepairOutcome {
        let mut outcome = RepairOutcome::default();
        for task in &report.placements {
            match self.replication.re_replicate(&task.item_id, &task.target).await {
                Ok(()) => outcome.placed.push(task.clone()),
                Err(err) => {
                    tracing::warn!(item = %task.item_id, node = %task.target, error = %err, "placement failed");
                    outcome.failed.push(task.clone());
                }
            }
        }
        outcome
    }
}

/// Offline chaos hook: run each scenario against a fresh in-process cluster built from `config`.
pub async fn simulate_failure_scenarios(
    config: &Config,
    scenarios: &[ChaosScenario],
) -> anyhow::Result<Vec<ScenarioReport>> {
    chaos::run_scenarios(config, scenarios).await
}
