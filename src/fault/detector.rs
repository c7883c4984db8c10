//! Consecutive-miss heartbeat failure detection.

use crate::config::FaultConfig;
use crate::membership::NodeId;
use crate::time::unix_millis;
use crate::transport::TransportError;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Process unreachable: the transport refuses delivery.
    Crash,
    /// Requests time out; possibly transient.
    Network,
    /// Heartbeats arrive but miss the response-time SLA.
    Performance,
    /// A node subset is mutually unreachable from this side.
    Partition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FailureType {
    pub fn base_severity(self) -> ImpactSeverity {
        match self {
            FailureType::Performance => ImpactSeverity::Low,
            FailureType::Network => ImpactSeverity::Medium,
            FailureType::Crash | FailureType::Partition => ImpactSeverity::High,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub failure_type: FailureType,
    pub confidence: f64,
    pub timestamp_ms: u64,
    pub severity: ImpactSeverity,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetectionResult {
    pub node_id: NodeId,
    /// Set only once the consecutive-miss threshold is reached.
    pub failed: bool,
    /// `min(1, misses / threshold)`, or the slow-response ratio for performance failures.
    pub confidence: f64,
    pub consecutive_misses: u32,
    pub slow_responses: u32,
    pub last_rtt_ms: Option<u64>,
    pub failure: Option<NodeFailure>,
}

/// Result of one heartbeat exchange.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Answered { rtt: Duration, load_factor: f64 },
    Missed(TransportError),
}

#[derive(Debug, Clone, Default)]
pub struct ProbeState {
    pub consecutive_misses: u32,
    /// Consecutive answers slower than the SLA.
    pub slow_responses: u32,
    pub last_rtt: Option<Duration>,
    pub last_error: Option<TransportError>,
    pub probes: u64,
    pub misses: u64,
}

/// Per-node probe bookkeeping. A miss only increments a counter; failure needs
/// `miss_threshold` misses in a row, and any answer resets the streak.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: FaultConfig,
    probes: HashMap<NodeId, ProbeState>,
}

impl HeartbeatMonitor {
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            probes: HashMap::new(),
        }
    }

    pub fn record(&mut self, node: &NodeId, outcome: ProbeOutcome) -> &ProbeState {
        let sla = self.config.performance_sla();
        let state = self.probes.entry(node.clone()).or_default();
        state.probes += 1;
        match outcome {
            ProbeOutcome::Answered { rtt, .. } => {
                state.consecutive_misses = 0;
                state.last_error = None;
                state.last_rtt = Some(rtt);
                if rtt > sla {
                    state.slow_responses += 1;
                } else {
                    state.slow_responses = 0;
                }
            }
            ProbeOutcome::Missed(err) => {
                state.consecutive_misses += 1;
                state.misses += 1;
                state.last_error = Some(err);
            }
        }
        state
    }

    pub fn state(&self, node: &NodeId) -> Option<&ProbeState> {
        self.probes.get(node)
    }

    pub fn forget(&mut self, node: &NodeId) {
        self.probes.remove(node);
    }

    pub fn reset(&mut self, node: &NodeId) {
        self.probes.insert(node.clone(), ProbeState::default());
    }

    /// `partitioned` marks the node as lost along with others in the same round.
    pub fn assess(&self, node: &NodeId, partitioned: bool) -> FailureDetectionResult {
        let threshold = self.config.miss_threshold.max(1);
        let state = self.probes.get(node).cloned().unwrap_or_default();
        let miss_confidence = (f64::from(state.consecutive_misses) / f64::from(threshold)).min(1.0);
        let failed = state.consecutive_misses >= threshold;
        let failure = if failed {
            let failure_type = if partitioned {
                FailureType::Partition
            } else {
                match state.last_error {
                    Some(TransportError::Unreachable { .. }) => FailureType::Crash,
                    _ => FailureType::Network,
                }
            };
            Some(NodeFailure {
                node_id: node.clone(),
                failure_type,
                confidence: miss_confidence,
                timestamp_ms: unix_millis(),
                severity: failure_type.base_severity(),
            })
        } else if state.slow_responses >= self.config.slow_threshold.max(1) {
            Some(NodeFailure {
                node_id: node.clone(),
                failure_type: FailureType::Performance,
                confidence: (f64::from(state.slow_responses)
                    / f64::from(self.config.slow_threshold.max(1)))
                .min(1.0),
                timestamp_ms: unix_millis(),
                severity: ImpactSeverity::Low,
            })
        } else {
            None
        };
        let confidence = match &failure {
            Some(f) if f.failure_type == FailureType::Performance => f.confidence,
            _ => miss_confidence,
        };
        FailureDetectionResult {
            node_id: node.clone(),
            failed,
            confidence,
            consecutive_misses: state.consecutive_misses,
            slow_responses: state.slow_responses,
            last_rtt_ms: state.last_rtt.map(|d| d.as_millis() as u64),
            failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(FaultConfig {
            miss_threshold: 3,
            slow_threshold: 2,
            performance_sla_ms: 50,
            ..FaultConfig::default()
        })
    }

    fn refused() -> ProbeOutcome {
        ProbeOutcome::Missed(TransportError::Unreachable {
            from: "a".into(),
            to: "b".into(),
        })
    }

    #[test]
    fn confidence_rises_with_each_miss_and_fails_at_threshold() {
        let mut monitor = monitor();
        let node: NodeId = "b".into();
        let mut last = 0.0;
        for miss in 1..=3 {
            monitor.record(&node, refused());
            let result = monitor.assess(&node, false);
            assert!(result.confidence > last);
            last = result.confidence;
            assert_eq!(result.failed, miss == 3);
        }
        let failure = monitor.assess(&node, false).failure.unwrap();
        assert_eq!(failure.failure_type, FailureType::Crash);
        assert!((failure.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn answer_resets_miss_streak() {
        let mut monitor = monitor();
        let node: NodeId = "b".into();
        monitor.record(&node, refused());
        monitor.record(&node, refused());
        monitor.record(
            &node,
            ProbeOutcome::Answered {
                rtt: Duration::from_millis(5),
                load_factor: 0.1,
            },
        );
        monitor.record(&node, refused());
        let result = monitor.assess(&node, false);
        assert!(!result.failed);
        assert_eq!(result.consecutive_misses, 1);
    }

    #[test]
    fn slow_answers_report_performance_without_failing() {
        let mut monitor = monitor();
        let node: NodeId = "b".into();
        for _ in 0..2 {
            monitor.record(
                &node,
                ProbeOutcome::Answered {
                    rtt: Duration::from_millis(80),
                    load_factor: 0.9,
                },
            );
        }
        let result = monitor.assess(&node, false);
        assert!(!result.failed);
        assert_eq!(
            result.failure.map(|f| f.failure_type),
            Some(FailureType::Performance)
        );
    }

    #[test]
    fn timeouts_in_a_partition_are_classified_as_partition() {
        let mut monitor = monitor();
        let node: NodeId = "b".into();
        for _ in 0..3 {
            monitor.record(
                &node,
                ProbeOutcome::Missed(TransportError::Timeout {
                    to: node.clone(),
                    after_ms: 10,
                }),
            );
        }
        assert_eq!(
            monitor.assess(&node, false).failure.unwrap().failure_type,
            FailureType::Network
        );
        assert_eq!(
            monitor.assess(&node, true).failure.unwrap().failure_type,
            FailureType::Partition
        );
    }
}
