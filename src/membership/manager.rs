//! Membership registry: the single owner and writer of node lifecycle state.

use super::node::{Node, NodeDescriptor, NodeId, NodeStatus};
use crate::config::MembershipConfig;
use crate::time::Clock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

const STATUS_SCORE_DEGRADED: f64 = 0.6;
const STALE_HEARTBEAT_PENALTY: f64 = 0.3;
const OVERLOAD_PENALTY: f64 = 0.2;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),
    #[error("node {node} has invalid capabilities: {reason}")]
    InvalidCapability { node: NodeId, reason: String },
    #[error("node id must be non-empty")]
    InvalidNodeId,
}

/// Lifecycle notifications; topology and consensus views subscribe to these.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Registered(NodeId),
    Deregistered(NodeId),
    StatusChanged {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
}

/// Per-node health as reported in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealthStatus {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub health_score: f64,
    pub load_factor: f64,
    pub heartbeat_age_ms: u64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceSuggestion {
    pub from: NodeId,
    pub to: NodeId,
    /// Fraction of load to move from `from` to `to`.
    pub load_delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancePlan {
    /// Nodes sorted by ascending load factor.
    pub ordered: Vec<(NodeId, f64)>,
    pub mean_load: f64,
    pub variance: f64,
    pub suggestions: Vec<RebalanceSuggestion>,
}

impl LoadBalancePlan {
    pub fn needs_rebalance(&self) -> bool {
        !self.suggestions.is_empty()
    }
}

/// Owns node membership, health, and load for the local coordinator.
pub struct NodeManager<C: Clock> {
    clock: C,
    config: MembershipConfig,
    stale_after: Duration,
    nodes: RwLock<HashMap<NodeId, Node>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl<C: Clock> std::fmt::Debug for NodeManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("nodes", &self.nodes.read().len())
            .finish()
    }
}

impl<C: Clock> NodeManager<C> {
    /// `heartbeat_interval` sets the staleness horizon (two missed intervals) for health scoring.
    pub fn new(clock: C, config: MembershipConfig, heartbeat_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            clock,
            config,
            stale_after: heartbeat_interval * 2,
            nodes: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn register(&self, descriptor: NodeDescriptor) -> Result<(), MembershipError> {
        if descriptor.id.as_str().trim().is_empty() {
            return Err(MembershipError::InvalidNodeId);
        }
        if let Some(reason) = descriptor.capabilities.invalid_reason() {
            return Err(MembershipError::InvalidCapability {
                node: descriptor.id,
                reason,
            });
        }
        let id = descriptor.id.clone();
        {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&id) {
                return Err(MembershipError::DuplicateNode(id));
            }
            nodes.insert(id.clone(), Node::from_descriptor(descriptor, self.clock.now()));
        }
        tracing::info!(node = %id, "node registered");
        let _ = self.events.send(MembershipEvent::Registered(id));
        Ok(())
    }

    pub fn deregister(&self, id: &NodeId) -> Result<Node, MembershipError> {
        let removed = self
            .nodes
            .write()
            .remove(id)
            .ok_or_else(|| MembershipError::UnknownNode(id.clone()))?;
        tracing::info!(node = %id, "node deregistered");
        let _ = self.events.send(MembershipEvent::Deregistered(id.clone()));
        Ok(removed)
    }

    /// Live (active or degraded) nodes, sorted by id.
    pub fn discover(&self) -> Vec<Node> {
        let mut live: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.status.is_live())
            .cloned()
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live
    }

    pub fn live_ids(&self) -> Vec<NodeId> {
        self.discover().into_iter().map(|n| n.id).collect()
    }

    /// Every registered node regardless of status, sorted by id.
    pub fn all(&self) -> Vec<Node> {
        let mut all: Vec<Node> = self.nodes.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.nodes.read().get(id).cloned()
    }

    pub fn status(&self, id: &NodeId) -> Option<NodeStatus> {
        self.nodes.read().get(id).map(|n| n.status)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Sole writer of `Node::status`. Returns the previous status.
    pub fn set_status(&self, id: &NodeId, status: NodeStatus) -> Result<NodeStatus, MembershipError> {
        let previous = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| MembershipError::UnknownNode(id.clone()))?;
            std::mem::replace(&mut node.status, status)
        };
        if previous != status {
            tracing::info!(node = %id, ?previous, ?status, "node status changed");
            let _ = self.events.send(MembershipEvent::StatusChanged {
                node: id.clone(),
                from: previous,
                to: status,
            });
        }
        Ok(previous)
    }

    pub fn record_heartbeat(&self, id: &NodeId, load_factor: Option<f64>) -> Result<(), MembershipError> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| MembershipError::UnknownNode(id.clone()))?;
        node.last_heartbeat = self.clock.now();
        if let Some(load) = load_factor {
            node.load_factor = sanitize_load(load);
        }
        Ok(())
    }

    pub fn update_load(&self, id: &NodeId, load_factor: f64) -> Result<(), MembershipError> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| MembershipError::UnknownNode(id.clone()))?;
        node.load_factor = sanitize_load(load_factor);
        Ok(())
    }

    /// Least-loaded live nodes for placement; active nodes rank ahead of degraded ones.
    pub fn select_targets(&self, count: usize, exclude: &[NodeId]) -> Vec<NodeId> {
        let mut candidates: Vec<Node> = self
            .discover()
            .into_iter()
            .filter(|n| !exclude.contains(&n.id))
            .collect();
        candidates.sort_by(|a, b| {
            let rank = |s: NodeStatus| u8::from(s != NodeStatus::Active);
            rank(a.status)
                .cmp(&rank(b.status))
                .then(a.load_factor.total_cmp(&b.load_factor))
                .then(a.id.cmp(&b.id))
        });
        candidates.into_iter().take(count).map(|n| n.id).collect()
    }

    /// Sort `ids` by load and suggest moves when variance exceeds the configured threshold.
    pub fn load_balance(&self, ids: &[NodeId]) -> LoadBalancePlan {
        let mut ordered: Vec<(NodeId, f64)> = {
            let nodes = self.nodes.read();
            ids.iter()
                .filter_map(|id| nodes.get(id).map(|n| (id.clone(), n.load_factor)))
                .collect()
        };
        ordered.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        if ordered.is_empty() {
            return LoadBalancePlan {
                ordered,
                mean_load: 0.0,
                variance: 0.0,
                suggestions: Vec::new(),
            };
        }
        let n = ordered.len() as f64;
        let mean = ordered.iter().map(|(_, l)| l).sum::<f64>() / n;
        let variance = ordered.iter().map(|(_, l)| (l - mean).powi(2)).sum::<f64>() / n;
        let mut suggestions = Vec::new();
        if variance > self.config.load_variance_threshold {
            // Pair the heaviest surplus with the deepest deficit until one side runs out.
            let mut surplus: Vec<(NodeId, f64)> = ordered
                .iter()
                .rev()
                .filter(|(_, l)| *l > mean)
                .map(|(id, l)| (id.clone(), l - mean))
                .collect();
            let mut deficit: Vec<(NodeId, f64)> = ordered
                .iter()
                .filter(|(_, l)| *l < mean)
                .map(|(id, l)| (id.clone(), mean - l))
                .collect();
            let (mut i, mut j) = (0, 0);
            while i < surplus.len() && j < deficit.len() {
                let delta = surplus[i].1.min(deficit[j].1);
                if delta > f64::EPSILON {
                    suggestions.push(RebalanceSuggestion {
                        from: surplus[i].0.clone(),
                        to: deficit[j].0.clone(),
                        load_delta: delta,
                    });
                }
                surplus[i].1 -= delta;
                deficit[j].1 -= delta;
                if surplus[i].1 <= f64::EPSILON {
                    i += 1;
                }
                if deficit[j].1 <= f64::EPSILON {
                    j += 1;
                }
            }
        }
        LoadBalancePlan {
            ordered,
            mean_load: mean,
            variance,
            suggestions,
        }
    }

    pub fn health_snapshot(&self) -> Vec<NodeHealthStatus> {
        let now = self.clock.now();
        let mut out: Vec<NodeHealthStatus> = self
            .nodes
            .read()
            .values()
            .map(|node| {
                let mut issues = Vec::new();
                let mut score = match node.status {
                    NodeStatus::Active => 1.0,
                    NodeStatus::Degraded => {
                        issues.push("node degraded".to_string());
                        STATUS_SCORE_DEGRADED
                    }
                    NodeStatus::Failed => {
                        issues.push("node failed".to_string());
                        0.0
                    }
                    NodeStatus::Quarantined => {
                        issues.push("node quarantined".to_string());
                        0.0
                    }
                };
                let age = now.saturating_duration_since(node.last_heartbeat);
                if age > self.stale_after {
                    issues.push(format!("heartbeat stale ({}ms)", age.as_millis()));
                    score -= STALE_HEARTBEAT_PENALTY;
                }
                if node.load_factor > self.config.overload_threshold {
                    issues.push(format!("overloaded (load {:.2})", node.load_factor));
                    score -= OVERLOAD_PENALTY;
                }
                NodeHealthStatus {
                    node_id: node.id.clone(),
                    status: node.status,
                    health_score: score.clamp(0.0, 1.0),
                    load_factor: node.load_factor,
                    heartbeat_age_ms: age.as_millis() as u64,
                    issues,
                }
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }
}

fn sanitize_load(load: f64) -> f64 {
    if load.is_finite() {
        load.max(0.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::NodeCapabilities;
    use crate::time::ManualClock;

    fn manager() -> (NodeManager<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let mgr = NodeManager::new(
            clock.clone(),
            MembershipConfig::default(),
            Duration::from_millis(100),
        );
        (mgr, clock)
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (mgr, _) = manager();
        mgr.register(NodeDescriptor::new("a")).unwrap();
        let err = mgr.register(NodeDescriptor::new("a")).unwrap_err();
        assert_eq!(err, MembershipError::DuplicateNode(NodeId::from("a")));
    }

    #[test]
    fn invalid_capabilities_rejected() {
        let (mgr, _) = manager();
        let mut desc = NodeDescriptor::new("a");
        desc.capabilities = NodeCapabilities {
            processing_power: 0.0,
            ..NodeCapabilities::default()
        };
        assert!(matches!(
            mgr.register(desc),
            Err(MembershipError::InvalidCapability { .. })
        ));
        assert_eq!(mgr.register(NodeDescriptor::new("  ")), Err(MembershipError::InvalidNodeId));
    }

    #[test]
    fn discover_skips_failed_and_quarantined() {
        let (mgr, _) = manager();
        for id in ["a", "b", "c", "d"] {
            mgr.register(NodeDescriptor::new(id)).unwrap();
        }
        mgr.set_status(&"b".into(), NodeStatus::Failed).unwrap();
        mgr.set_status(&"c".into(), NodeStatus::Quarantined).unwrap();
        mgr.set_status(&"d".into(), NodeStatus::Degraded).unwrap();
        let live: Vec<String> = mgr.discover().into_iter().map(|n| n.id.to_string()).collect();
        assert_eq!(live, vec!["a", "d"]);
    }

    #[test]
    fn status_change_emits_event() {
        let (mgr, _) = manager();
        let mut rx = mgr.subscribe();
        mgr.register(NodeDescriptor::new("a")).unwrap();
        mgr.set_status(&"a".into(), NodeStatus::Failed).unwrap();
        assert_eq!(rx.try_recv().unwrap(), MembershipEvent::Registered("a".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            MembershipEvent::StatusChanged {
                node: "a".into(),
                from: NodeStatus::Active,
                to: NodeStatus::Failed
            }
        );
    }

    #[test]
    fn balanced_cluster_has_no_suggestions() {
        let (mgr, _) = manager();
        let ids: Vec<NodeId> = ["a", "b", "c"].iter().map(|s| NodeId::from(*s)).collect();
        for id in &ids {
            mgr.register(NodeDescriptor::new(id.clone())).unwrap();
            mgr.update_load(id, 0.5).unwrap();
        }
        let plan = mgr.load_balance(&ids);
        assert!(!plan.needs_rebalance());
        assert!(plan.variance.abs() < 1e-9);
    }

    #[test]
    fn skewed_cluster_moves_load_from_heaviest_to_lightest() {
        let (mgr, _) = manager();
        let loads = [("a", 0.9), ("b", 0.1), ("c", 0.5)];
        let ids: Vec<NodeId> = loads.iter().map(|(id, _)| NodeId::from(*id)).collect();
        for (id, load) in loads {
            mgr.register(NodeDescriptor::new(id)).unwrap();
            mgr.update_load(&id.into(), load).unwrap();
        }
        let plan = mgr.load_balance(&ids);
        assert_eq!(plan.ordered[0].0, NodeId::from("b"));
        assert_eq!(plan.suggestions.len(), 1);
        let s = &plan.suggestions[0];
        assert_eq!((s.from.as_str(), s.to.as_str()), ("a", "b"));
        assert!((s.load_delta - 0.4).abs() < 1e-9);
    }

    #[test]
    fn health_penalizes_stale_heartbeat_and_overload() {
        let (mgr, clock) = manager();
        mgr.register(NodeDescriptor::new("a")).unwrap();
        mgr.register(NodeDescriptor::new("b")).unwrap();
        clock.advance(Duration::from_millis(500));
        mgr.record_heartbeat(&"b".into(), Some(0.95)).unwrap();
        let snap = mgr.health_snapshot();
        let a = &snap[0];
        let b = &snap[1];
        assert!((a.health_score - 0.7).abs() < 1e-9);
        assert!(a.issues.iter().any(|i| i.contains("heartbeat stale")));
        assert!((b.health_score - 0.8).abs() < 1e-9);
        assert!(b.issues.iter().any(|i| i.contains("overloaded")));
    }

    #[test]
    fn select_targets_prefers_active_least_loaded() {
        let (mgr, _) = manager();
        for (id, load) in [("a", 0.7), ("b", 0.2), ("c", 0.1), ("d", 0.0)] {
            mgr.register(NodeDescriptor::new(id)).unwrap();
            mgr.update_load(&id.into(), load).unwrap();
        }
        mgr.set_status(&"d".into(), NodeStatus::Degraded).unwrap();
        let picked = mgr.select_targets(3, &["c".into()]);
        let picked: Vec<&str> = picked.iter().map(|n| n.as_str()).collect();
        assert_eq!(picked, vec!["b", "a", "d"]);
    }
}
