//! Per-node replica storage. Only mutated through delivered `ReplicaWrite` messages.

use super::item::{ItemId, ReplicableItem, ReplicaRole};
use crate::membership::NodeId;
use crate::time::Clock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Versions must strictly advance.
    Normal,
    /// Conflict repair and re-replication: overwrite whatever is stored.
    Repair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaWrite {
    pub item: ReplicableItem,
    pub role: ReplicaRole,
    pub mode: WriteMode,
    /// Writable primary for master-slave items; slaves refuse writes from anyone else.
    #[serde(default)]
    pub primary: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    Stored { version: u64 },
    AlreadyCurrent { version: u64 },
    /// Same version, different content.
    Conflict { stored_version: u64, stored_checksum: u64 },
    /// Incoming version is older than what is held.
    Stale { stored_version: u64 },
    Corrupt,
    ReadOnly { primary: NodeId },
}

impl WriteOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            WriteOutcome::Stored { .. } | WriteOutcome::AlreadyCurrent { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaWriteAck {
    pub node: NodeId,
    pub item_id: ItemId,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaRead {
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaReadResponse {
    pub node: NodeId,
    pub item: Option<ReplicableItem>,
    pub role: Option<ReplicaRole>,
}

#[derive(Debug, Clone)]
struct StoredReplica {
    item: ReplicableItem,
    role: ReplicaRole,
    primary: Option<NodeId>,
    stored_at: Instant,
}

pub struct ReplicaStore<C: Clock> {
    node: NodeId,
    clock: C,
    items: RwLock<HashMap<ItemId, StoredReplica>>,
}

impl<C: Clock> std::fmt::Debug for ReplicaStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaStore")
            .field("node", &self.node)
            .field("items", &self.items.read().len())
            .finish()
    }
}

impl<C: Clock> ReplicaStore<C> {
    pub fn new(node: NodeId, clock: C) -> Self {
        Self {
            node,
            clock,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn handle_write(&self, write: ReplicaWrite) -> ReplicaWriteAck {
        let item_id = write.item.id.clone();
        let outcome = self.apply_write(write);
        if !outcome.is_ack() {
            tracing::debug!(node = %self.node, item = %item_id, ?outcome, "replica write refused");
        }
        ReplicaWriteAck {
            node: self.node.clone(),
            item_id,
            outcome,
        }
    }

    fn apply_write(&self, write: ReplicaWrite) -> WriteOutcome {
        let ReplicaWrite {
            item,
            role,
            mode,
            primary,
        } = write;
        let item = if role == ReplicaRole::Witness {
            item.witness_copy()
        } else {
            if !item.verify() {
                return WriteOutcome::Corrupt;
            }
            item
        };
        let mut items = self.items.write();
        if let Some(existing) = items.get(&item.id) {
            let held = &existing.item.metadata;
            let incoming = &item.metadata;
            if held.version == incoming.version && held.checksum == incoming.checksum {
                return WriteOutcome::AlreadyCurrent {
                    version: held.version,
                };
            }
            if mode == WriteMode::Normal {
                if let Some(owner) = &existing.primary {
                    if existing.role != ReplicaRole::Primary && primary.as_ref() != Some(owner) {
                        return WriteOutcome::ReadOnly {
                            primary: owner.clone(),
                        };
                    }
                }
                if incoming.version == held.version {
                    return WriteOutcome::Conflict {
                        stored_version: held.version,
                        stored_checksum: held.checksum,
                    };
                }
                if incoming.version < held.version {
                    return WriteOutcome::Stale {
                        stored_version: held.version,
                    };
                }
            }
        }
        let version = item.metadata.version;
        items.insert(
            item.id.clone(),
            StoredReplica {
                item,
                role,
                primary,
                stored_at: self.clock.now(),
            },
        );
        WriteOutcome::Stored { version }
    }

    pub fn handle_read(&self, read: &ReplicaRead) -> ReplicaReadResponse {
        let items = self.items.read();
        let stored = items.get(&read.item_id);
        ReplicaReadResponse {
            node: self.node.clone(),
            item: stored.map(|s| s.item.clone()),
            role: stored.map(|s| s.role),
        }
    }

    pub fn get(&self, id: &ItemId) -> Option<ReplicableItem> {
        self.items.read().get(id).map(|s| s.item.clone())
    }

    pub fn version_of(&self, id: &ItemId) -> Option<u64> {
        self.items.read().get(id).map(|s| s.item.metadata.version)
    }

    /// When the replica was last written locally.
    pub fn stored_at(&self, id: &ItemId) -> Option<Instant> {
        self.items.read().get(id).map(|s| s.stored_at)
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.items.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn remove(&self, id: &ItemId) -> bool {
        self.items.write().remove(id).is_some()
    }

    /// Fault injection: replace stored bytes without touching metadata.
    pub fn inject_corruption(&self, id: &ItemId, content: Vec<u8>) -> bool {
        match self.items.write().get_mut(id) {
            Some(stored) => {
                stored.item.content = content;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ConsistencyLevel;
    use crate::time::SystemClock;

    fn store() -> ReplicaStore<SystemClock> {
        ReplicaStore::new("n1".into(), SystemClock)
    }

    fn item(version: u64, content: &[u8]) -> ReplicableItem {
        ReplicableItem::at_version(
            "x",
            content.to_vec(),
            "owner".into(),
            3,
            ConsistencyLevel::Strong,
            version,
        )
    }

    fn write(item: ReplicableItem, mode: WriteMode) -> ReplicaWrite {
        ReplicaWrite {
            item,
            role: ReplicaRole::Secondary,
            mode,
            primary: None,
        }
    }

    #[test]
    fn duplicate_delivery_is_idempotent() {
        let s = store();
        let first = s.handle_write(write(item(1, b"a"), WriteMode::Normal));
        assert_eq!(first.outcome, WriteOutcome::Stored { version: 1 });
        let again = s.handle_write(write(item(1, b"a"), WriteMode::Normal));
        assert_eq!(again.outcome, WriteOutcome::AlreadyCurrent { version: 1 });
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn divergent_same_version_is_conflict() {
        let s = store();
        s.handle_write(write(item(2, b"a"), WriteMode::Normal));
        let ack = s.handle_write(write(item(2, b"b"), WriteMode::Normal));
        assert!(matches!(ack.outcome, WriteOutcome::Conflict { stored_version: 2, .. }));
        assert_eq!(s.get(&"x".into()).unwrap().content, b"a".to_vec());
    }

    #[test]
    fn older_version_is_stale_unless_repair() {
        let s = store();
        s.handle_write(write(item(3, b"new"), WriteMode::Normal));
        let ack = s.handle_write(write(item(2, b"old"), WriteMode::Normal));
        assert_eq!(ack.outcome, WriteOutcome::Stale { stored_version: 3 });
        let ack = s.handle_write(write(item(2, b"old"), WriteMode::Repair));
        assert_eq!(ack.outcome, WriteOutcome::Stored { version: 2 });
    }

    #[test]
    fn corrupt_payload_rejected() {
        let s = store();
        let mut bad = item(1, b"payload");
        bad.content = b"tampered".to_vec();
        let ack = s.handle_write(write(bad, WriteMode::Normal));
        assert_eq!(ack.outcome, WriteOutcome::Corrupt);
        assert!(s.is_empty());
    }

    #[test]
    fn witness_keeps_metadata_only() {
        let s = store();
        let mut w = write(item(1, b"payload"), WriteMode::Normal);
        w.role = ReplicaRole::Witness;
        s.handle_write(w);
        let held = s.get(&"x".into()).unwrap();
        assert!(held.content.is_empty());
        assert_eq!(held.metadata.version, 1);
    }

    #[test]
    fn slave_refuses_writes_from_other_primary() {
        let s = store();
        let mut first = write(item(1, b"a"), WriteMode::Normal);
        first.primary = Some("p1".into());
        s.handle_write(first);
        let mut rogue = write(item(2, b"b"), WriteMode::Normal);
        rogue.primary = Some("p2".into());
        let ack = s.handle_write(rogue);
        assert_eq!(ack.outcome, WriteOutcome::ReadOnly { primary: "p1".into() });
        let mut legit = write(item(2, b"b"), WriteMode::Normal);
        legit.primary = Some("p1".into());
        assert!(s.handle_write(legit).outcome.is_ack());
    }
}
