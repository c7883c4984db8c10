use super::item::ConsistencyLevel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a write fans out to its targets and how many acks it waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "quorum", rename_all = "snake_case")]
pub enum ReplicationStrategy {
    /// Every target, waited on.
    Synchronous,
    /// Primary awaited; secondaries converge in the background.
    Asynchronous,
    /// Primary plus one secondary.
    SemiSynchronous,
    Quorum(usize),
    /// Sequential primary -> secondary -> tertiary; a dead link is skipped.
    Chain,
    /// Single writable primary; slaves refuse writes that do not come from it.
    MasterSlave,
}

impl fmt::Display for ReplicationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationStrategy::Synchronous => f.write_str("synchronous"),
            ReplicationStrategy::Asynchronous => f.write_str("asynchronous"),
            ReplicationStrategy::SemiSynchronous => f.write_str("semi_synchronous"),
            ReplicationStrategy::Quorum(q) => write!(f, "quorum({q})"),
            ReplicationStrategy::Chain => f.write_str("chain"),
            ReplicationStrategy::MasterSlave => f.write_str("master_slave"),
        }
    }
}

/// Strategy implied by a consistency level. `weak_quorum` comes from
/// `replication.weak_quorum` (2 by default).
pub fn strategy_for(level: ConsistencyLevel, weak_quorum: usize) -> ReplicationStrategy {
    match level {
        ConsistencyLevel::Strong => ReplicationStrategy::Synchronous,
        ConsistencyLevel::Causal => ReplicationStrategy::SemiSynchronous,
        ConsistencyLevel::Eventual => ReplicationStrategy::Asynchronous,
        ConsistencyLevel::Weak => ReplicationStrategy::Quorum(weak_quorum),
    }
}

impl ReplicationStrategy {
    /// Acks required before a write reports success, for a replication factor `rf`.
    pub fn required_acks(self, rf: usize) -> usize {
        let rf = rf.max(1);
        match self {
            ReplicationStrategy::Synchronous
            | ReplicationStrategy::Chain
            | ReplicationStrategy::MasterSlave => rf,
            ReplicationStrategy::SemiSynchronous => rf.min(2),
            ReplicationStrategy::Asynchronous => 1,
            ReplicationStrategy::Quorum(q) => q.max(1),
        }
    }

    /// Whether the caller waits for every target before returning.
    pub fn waits_for_all(self) -> bool {
        matches!(
            self,
            ReplicationStrategy::Synchronous
                | ReplicationStrategy::Chain
                | ReplicationStrategy::MasterSlave
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_maps_to_strategy() {
        assert_eq!(strategy_for(ConsistencyLevel::Strong, 2), ReplicationStrategy::Synchronous);
        assert_eq!(strategy_for(ConsistencyLevel::Causal, 2), ReplicationStrategy::SemiSynchronous);
        assert_eq!(strategy_for(ConsistencyLevel::Eventual, 2), ReplicationStrategy::Asynchronous);
        assert_eq!(strategy_for(ConsistencyLevel::Weak, 2), ReplicationStrategy::Quorum(2));
    }

    #[test]
    fn required_acks_per_strategy() {
        assert_eq!(ReplicationStrategy::Synchronous.required_acks(3), 3);
        assert_eq!(ReplicationStrategy::SemiSynchronous.required_acks(3), 2);
        assert_eq!(ReplicationStrategy::SemiSynchronous.required_acks(1), 1);
        assert_eq!(ReplicationStrategy::Asynchronous.required_acks(5), 1);
        assert_eq!(ReplicationStrategy::Quorum(2).required_acks(5), 2);
        assert_eq!(ReplicationStrategy::Quorum(0).required_acks(5), 1);
    }
}
