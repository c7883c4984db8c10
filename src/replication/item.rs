use crate::membership::NodeId;
use crate::time::unix_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::time::Instant;
use twox_hash::XxHash64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How many replicas must be synchronized before a write is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    #[default]
    Strong,
    Causal,
    Eventual,
    Weak,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl ItemPriority {
    pub fn weight(self) -> u32 {
        match self {
            ItemPriority::Low => 1,
            ItemPriority::Normal => 2,
            ItemPriority::High => 4,
            ItemPriority::Critical => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub size: u64,
    pub checksum: u64,
    pub version: u64,
    pub owner: NodeId,
    pub replication_factor: usize,
    pub consistency: ConsistencyLevel,
    pub priority: ItemPriority,
    pub updated_at_ms: u64,
}

/// A versioned blob replicated across nodes. Immutable once committed at a version;
/// writes produce a new version through [`ReplicableItem::next_version`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicableItem {
    pub id: ItemId,
    pub content: Vec<u8>,
    pub metadata: ItemMetadata,
}

pub fn content_checksum(content: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(content);
    hasher.finish()
}

impl ReplicableItem {
    /// First version (1) of a new item.
    pub fn new(
        id: impl Into<ItemId>,
        content: Vec<u8>,
        owner: NodeId,
        replication_factor: usize,
        consistency: ConsistencyLevel,
    ) -> Self {
        Self::at_version(id, content, owner, replication_factor, consistency, 1)
    }

    pub fn at_version(
        id: impl Into<ItemId>,
        content: Vec<u8>,
        owner: NodeId,
        replication_factor: usize,
        consistency: ConsistencyLevel,
        version: u64,
    ) -> Self {
        let metadata = ItemMetadata {
            size: content.len() as u64,
            checksum: content_checksum(&content),
            version,
            owner,
            replication_factor,
            consistency,
            priority: ItemPriority::default(),
            updated_at_ms: unix_millis(),
        };
        Self {
            id: id.into(),
            content,
            metadata,
        }
    }

    pub fn with_priority(mut self, priority: ItemPriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Successor carrying new content at `version + 1`.
    pub fn next_version(&self, content: Vec<u8>) -> Self {
        let mut next = self.clone();
        next.metadata.size = content.len() as u64;
        next.metadata.checksum = content_checksum(&content);
        next.metadata.version = self.metadata.version + 1;
        next.metadata.updated_at_ms = unix_millis();
        next.content = content;
        next
    }

    /// Same content re-stamped at an explicit version (conflict repair).
    pub fn restamped(&self, version: u64) -> Self {
        let mut next = self.clone();
        next.metadata.version = version;
        next.metadata.updated_at_ms = unix_millis();
        next
    }

    pub fn verify(&self) -> bool {
        self.metadata.size == self.content.len() as u64
            && self.metadata.checksum == content_checksum(&self.content)
    }

    /// Metadata-only copy for witness replicas.
    pub fn witness_copy(&self) -> Self {
        Self {
            id: self.id.clone(),
            content: Vec::new(),
            metadata: self.metadata.clone(),
        }
    }

    /// Majority of the configured replication factor: ⌈(rf + 1) / 2⌉.
    pub fn majority(&self) -> usize {
        majority_of(self.metadata.replication_factor)
    }
}

pub fn majority_of(n: usize) -> usize {
    n / 2 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    Primary,
    Secondary,
    /// Vote-only; stores metadata, never content.
    Witness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synchronized,
    Synchronizing,
    OutOfSync,
    Failed,
}

/// Coordinator-side record of one copy of an item.
#[derive(Debug, Clone)]
pub struct Replica {
    pub item_id: ItemId,
    pub node_id: NodeId,
    pub role: ReplicaRole,
    pub sync_status: SyncStatus,
    pub version: u64,
    pub last_sync: Option<Instant>,
}

impl Replica {
    pub fn holds_data(&self) -> bool {
        self.role != ReplicaRole::Witness
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_version_rechecksums() {
        let v1 = ReplicableItem::new("x", b"one".to_vec(), "n1".into(), 3, ConsistencyLevel::Strong);
        let v2 = v1.next_version(b"two".to_vec());
        assert_eq!(v2.version(), 2);
        assert_ne!(v1.metadata.checksum, v2.metadata.checksum);
        assert!(v2.verify());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let mut item = ReplicableItem::new("x", b"one".to_vec(), "n1".into(), 3, ConsistencyLevel::Weak);
        item.content = b"oNe".to_vec();
        assert!(!item.verify());
    }

    #[test]
    fn majority_matches_ceiling_formula() {
        for rf in 1..10usize {
            assert_eq!(majority_of(rf), (rf + 2) / 2, "rf={rf}");
        }
    }
}
