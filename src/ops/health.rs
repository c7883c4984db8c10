use crate::membership::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

const DEFAULT_ALERT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub affected_nodes: Vec<NodeId>,
    pub timestamp: DateTime<Utc>,
}

/// Bounded in-memory alert history. Every alert is also emitted as a tracing event.
#[derive(Debug, Clone)]
pub struct AlertLog {
    inner: Arc<Mutex<VecDeque<Alert>>>,
    capacity: usize,
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ALERT_CAPACITY)
    }
}

impl AlertLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn raise(&self, level: AlertLevel, message: impl Into<String>, affected_nodes: Vec<NodeId>) {
        let message = message.into();
        let nodes = affected_nodes
            .iter()
            .map(NodeId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        match level {
            AlertLevel::Info => tracing::info!(target: "alert", nodes = %nodes, "{message}"),
            AlertLevel::Warning => tracing::warn!(target: "alert", nodes = %nodes, "{message}"),
            AlertLevel::Critical => tracing::error!(target: "alert", nodes = %nodes, "{message}"),
        }
        let mut alerts = self.inner.lock();
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(Alert {
            level,
            message,
            affected_nodes,
            timestamp: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> Vec<Alert> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Alerts raised at or after `since`.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<Alert> {
        self.inner
            .lock()
            .iter()
            .filter(|a| a.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn count_at(&self, level: AlertLevel) -> usize {
        self.inner.lock().iter().filter(|a| a.level == level).count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodic cluster health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Mean of per-node health, scaled down when the cluster lacks a voting majority.
    pub overall_health: f64,
    pub per_node_health: BTreeMap<NodeId, f64>,
    pub alerts: Vec<Alert>,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Mean node health, multiplied by the fraction of a majority still live when below quorum.
pub fn overall_health(per_node: &BTreeMap<NodeId, f64>, live: usize, members: usize) -> f64 {
    if per_node.is_empty() {
        return 0.0;
    }
    let mean = per_node.values().sum::<f64>() / per_node.len() as f64;
    let majority = members / 2 + 1;
    let scale = if members == 0 || live >= majority {
        1.0
    } else {
        live as f64 / majority as f64
    };
    (mean * scale).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_log_drops_oldest_at_capacity() {
        let log = AlertLog::with_capacity(2);
        log.raise(AlertLevel::Info, "one", vec![]);
        log.raise(AlertLevel::Warning, "two", vec!["n1".into()]);
        log.raise(AlertLevel::Critical, "three", vec![]);
        let messages: Vec<_> = log.snapshot().into_iter().map(|a| a.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert_eq!(log.count_at(AlertLevel::Critical), 1);
    }

    #[test]
    fn overall_health_penalises_lost_majority() {
        let per_node: BTreeMap<NodeId, f64> =
            [("a".into(), 1.0), ("b".into(), 1.0), ("c".into(), 0.0)].into_iter().collect();
        let healthy = overall_health(&per_node, 2, 3);
        assert!((healthy - 2.0 / 3.0).abs() < 1e-9);
        let degraded = overall_health(&per_node, 1, 3);
        assert!(degraded < healthy);
    }
}
