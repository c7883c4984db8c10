//! Replica conflict model and winner selection.
//!
//! Selection is pure; republishing the winner happens in the engine.

use super::item::{ItemId, ReplicableItem};
use crate::membership::NodeId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Replicas hold different versions or different content at one version.
    VersionDivergence,
    /// At least one replica fails checksum verification.
    Corruption,
    /// Writes accepted on both sides of a partition.
    ConcurrentWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    PriorityWeightedMerge,
    RollbackToVersion(u64),
    Consensus,
}

/// One replica's copy as observed when the conflict was detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictCandidate {
    pub node: NodeId,
    pub item: ReplicableItem,
}

impl ConflictCandidate {
    pub fn is_valid(&self) -> bool {
        self.item.verify()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub item_id: ItemId,
    pub conflict_type: ConflictType,
    pub candidates: Vec<ConflictCandidate>,
}

impl Conflict {
    pub fn max_version(&self) -> u64 {
        self.candidates
            .iter()
            .map(|c| c.item.metadata.version)
            .max()
            .unwrap_or(0)
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.candidates.iter().map(|c| c.node.clone()).collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn valid(&self) -> impl Iterator<Item = &ConflictCandidate> {
        self.candidates.iter().filter(|c| c.is_valid())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolutionResult {
    pub item_id: ItemId,
    pub strategy: ConflictStrategy,
    pub conflict_type: ConflictType,
    /// Node whose copy won.
    pub source: NodeId,
    /// Version the winner was republished at.
    pub resolved_version: u64,
    pub resolved_checksum: u64,
    pub repaired: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("conflict on {0} has no valid candidate")]
    NoValidCandidate(ItemId),
    #[error("no candidate of {item} at version {version}")]
    VersionNotFound { item: ItemId, version: u64 },
    #[error("consensus resolution needs an arbiter")]
    NoArbiter,
    #[error("arbiter could not decide: {0}")]
    Arbiter(String),
}

/// Decides a conflict through cluster agreement.
pub trait ConflictArbiter: Send + Sync {
    /// Returns the index into `conflict.candidates` the cluster agreed on.
    fn arbitrate<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, Result<usize, ConflictError>>;
}

/// Newest version wins; ties go to the later wall-clock stamp, then the larger checksum.
pub fn last_write_wins(conflict: &Conflict) -> Result<usize, ConflictError> {
    conflict
        .candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_valid())
        .max_by_key(|(_, c)| {
            let m = &c.item.metadata;
            (m.version, m.updated_at_ms, m.checksum)
        })
        .map(|(idx, _)| idx)
        .ok_or_else(|| ConflictError::NoValidCandidate(conflict.item_id.clone()))
}

/// Content held by the heaviest group of replicas wins, each replica weighing its item priority.
pub fn priority_weighted(conflict: &Conflict) -> Result<usize, ConflictError> {
    let mut weights: HashMap<u64, u32> = HashMap::new();
    for candidate in conflict.valid() {
        *weights.entry(candidate.item.metadata.checksum).or_default() +=
            candidate.item.metadata.priority.weight();
    }
    conflict
        .candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_valid())
        .max_by_key(|(_, c)| {
            let m = &c.item.metadata;
            (weights.get(&m.checksum).copied().unwrap_or(0), m.version, m.checksum)
        })
        .map(|(idx, _)| idx)
        .ok_or_else(|| ConflictError::NoValidCandidate(conflict.item_id.clone()))
}

pub fn rollback_to(conflict: &Conflict, version: u64) -> Result<usize, ConflictError> {
    conflict
        .candidates
        .iter()
        .position(|c| c.is_valid() && c.item.metadata.version == version)
        .ok_or_else(|| ConflictError::VersionNotFound {
            item: conflict.item_id.clone(),
            version,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{ConsistencyLevel, ItemPriority};

    fn candidate(node: &str, version: u64, content: &[u8], priority: ItemPriority) -> ConflictCandidate {
        ConflictCandidate {
            node: node.into(),
            item: ReplicableItem::at_version(
                "x",
                content.to_vec(),
                "owner".into(),
                3,
                ConsistencyLevel::Strong,
                version,
            )
            .with_priority(priority),
        }
    }

    fn conflict(candidates: Vec<ConflictCandidate>) -> Conflict {
        Conflict {
            item_id: "x".into(),
            conflict_type: ConflictType::VersionDivergence,
            candidates,
        }
    }

    #[test]
    fn last_write_wins_takes_highest_valid_version() {
        let mut corrupt = candidate("c", 9, b"zzz", ItemPriority::Normal);
        corrupt.item.content = b"broken".to_vec();
        let c = conflict(vec![
            candidate("a", 2, b"old", ItemPriority::Normal),
            candidate("b", 3, b"new", ItemPriority::Normal),
            corrupt,
        ]);
        assert_eq!(last_write_wins(&c).unwrap(), 1);
        assert_eq!(c.max_version(), 9);
    }

    #[test]
    fn weighted_merge_sums_priority_per_content() {
        let c = conflict(vec![
            candidate("a", 4, b"lonely", ItemPriority::High),
            candidate("b", 3, b"shared", ItemPriority::Normal),
            candidate("c", 3, b"shared", ItemPriority::Normal),
            candidate("d", 3, b"shared", ItemPriority::Low),
        ]);
        // shared: 2 + 2 + 1 = 5 beats lonely: 4
        let winner = priority_weighted(&c).unwrap();
        assert_eq!(c.candidates[winner].item.content, b"shared".to_vec());
    }

    #[test]
    fn rollback_requires_matching_version() {
        let c = conflict(vec![
            candidate("a", 2, b"two", ItemPriority::Normal),
            candidate("b", 3, b"three", ItemPriority::Normal),
        ]);
        assert_eq!(rollback_to(&c, 2).unwrap(), 0);
        assert!(matches!(
            rollback_to(&c, 7),
            Err(ConflictError::VersionNotFound { version: 7, .. })
        ));
    }

    #[test]
    fn all_corrupt_is_unresolvable() {
        let mut only = candidate("a", 1, b"x", ItemPriority::Normal);
        only.item.content.clear();
        let c = conflict(vec![only]);
        assert!(matches!(last_write_wins(&c), Err(ConflictError::NoValidCandidate(_))));
    }
}
