use crate::consensus::quorum;
use crate::membership::NodeId;
use crate::time::unix_millis;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionCause {
    /// Two or more nodes stopped answering in the same probe round.
    SimultaneousLoss,
    /// This node can no longer reach a majority.
    MinorityIsolation,
}

/// A node subset this side cannot reach.
#[derive(Debug, Clone, Serialize)]
pub struct Partition {
    pub id: Uuid,
    pub unreachable: BTreeSet<NodeId>,
    pub cause: PartitionCause,
    pub detected_at_ms: u64,
    pub estimated_duration: Duration,
}

impl Partition {
    pub fn new(unreachable: BTreeSet<NodeId>, cause: PartitionCause, estimated_duration: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            unreachable,
            cause,
            detected_at_ms: unix_millis(),
            estimated_duration,
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.unreachable.contains(node)
    }
}

/// Classify one probe round. `newly_lost` are nodes that answered last round and timed out
/// this round; `reachable` counts peers that answered; `members` includes this node.
pub fn classify_round(
    newly_lost: &BTreeSet<NodeId>,
    unreachable: &BTreeSet<NodeId>,
    reachable: usize,
    members: usize,
    estimated_duration: Duration,
) -> Option<Partition> {
    if members > 1 && reachable + 1 < quorum(members) && !unreachable.is_empty() {
        return Some(Partition::new(
            unreachable.clone(),
            PartitionCause::MinorityIsolation,
            estimated_duration,
        ));
    }
    if newly_lost.len() >= 2 {
        return Some(Partition::new(
            newly_lost.clone(),
            PartitionCause::SimultaneousLoss,
            estimated_duration,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|s| NodeId::from(*s)).collect()
    }

    #[test]
    fn single_loss_is_not_a_partition() {
        let lost = set(&["b"]);
        assert!(classify_round(&lost, &lost, 3, 5, Duration::from_secs(1)).is_none());
    }

    #[test]
    fn simultaneous_loss_is_a_partition() {
        let lost = set(&["b", "c"]);
        let partition = classify_round(&lost, &lost, 2, 5, Duration::from_secs(1)).unwrap();
        assert_eq!(partition.cause, PartitionCause::SimultaneousLoss);
        assert!(partition.contains(&"c".into()));
    }

    #[test]
    fn minority_side_detects_isolation() {
        let unreachable = set(&["c", "d", "e"]);
        let partition =
            classify_round(&BTreeSet::new(), &unreachable, 1, 5, Duration::from_secs(1)).unwrap();
        assert_eq!(partition.cause, PartitionCause::MinorityIsolation);
        assert_eq!(partition.unreachable.len(), 3);
    }
}
