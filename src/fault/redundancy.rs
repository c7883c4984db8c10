use crate::membership::NodeId;
use crate::replication::{ItemId, ItemPriority, ItemRecord, SyncStatus};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RedundancyGap {
    pub item_id: ItemId,
    pub priority: ItemPriority,
    pub target: usize,
    pub healthy: usize,
    pub gap: usize,
}

/// A replica to add on `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementTask {
    pub item_id: ItemId,
    pub target: NodeId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RedundancyReport {
    pub examined: usize,
    pub gaps: Vec<RedundancyGap>,
    pub placements: Vec<PlacementTask>,
    /// Items short of replicas with no eligible node left to place them on.
    pub unplaceable: Vec<ItemId>,
}

impl RedundancyReport {
    pub fn total_gap(&self) -> usize {
        self.gaps.iter().map(|g| g.gap).sum()
    }

    pub fn is_satisfied(&self) -> bool {
        self.gaps.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairOutcome {
    pub placed: Vec<PlacementTask>,
    pub failed: Vec<PlacementTask>,
}

/// Compare each item's healthy data replicas on live nodes with its replication factor and
/// plan placements. Higher-priority items, then larger gaps, get nodes first; `select`
/// returns up to `count` live nodes not in `exclude`.
pub fn plan_redundancy(
    registry: &[(ItemId, ItemRecord)],
    is_live: impl Fn(&NodeId) -> bool,
    select: impl Fn(usize, &[NodeId]) -> Vec<NodeId>,
) -> RedundancyReport {
    let mut report = RedundancyReport {
        examined: registry.len(),
        ..RedundancyReport::default()
    };
    for (id, record) in registry {
        let healthy = record
            .replicas
            .iter()
            .filter(|r| r.holds_data() && r.sync_status != SyncStatus::Failed && is_live(&r.node_id))
            .count();
        let target = record.metadata.replication_factor;
        if healthy < target {
            report.gaps.push(RedundancyGap {
                item_id: id.clone(),
                priority: record.metadata.priority,
                target,
                healthy,
                gap: target - healthy,
            });
        }
    }
    report
        .gaps
        .sort_by(|a, b| b.priority.cmp(&a.priority).then(b.gap.cmp(&a.gap)).then(a.item_id.cmp(&b.item_id)));
    for gap in &report.gaps {
        let exclude = registry
            .iter()
            .find(|(id, _)| id == &gap.item_id)
            .map(|(_, record)| record.nodes())
            .unwrap_or_default();
        let chosen = select(gap.gap, &exclude);
        if chosen.is_empty() {
            report.unplaceable.push(gap.item_id.clone());
        }
        report
            .placements
            .extend(chosen.into_iter().map(|target| PlacementTask {
                item_id: gap.item_id.clone(),
                target,
            }));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{
        ConsistencyLevel, ReplicableItem, Replica, ReplicaRole, ReplicationStrategy,
    };

    fn record(id: &str, rf: usize, priority: ItemPriority, replicas: &[(&str, SyncStatus)]) -> (ItemId, ItemRecord) {
        let item = ReplicableItem::new(id, b"v".to_vec(), "a".into(), rf, ConsistencyLevel::Strong)
            .with_priority(priority);
        let replicas = replicas
            .iter()
            .enumerate()
            .map(|(i, (node, status))| Replica {
                item_id: id.into(),
                node_id: (*node).into(),
                role: if i == 0 { ReplicaRole::Primary } else { ReplicaRole::Secondary },
                sync_status: *status,
                version: 1,
                last_sync: None,
            })
            .collect();
        (
            id.into(),
            ItemRecord {
                metadata: item.metadata,
                strategy: ReplicationStrategy::Synchronous,
                replicas,
            },
        )
    }

    #[test]
    fn plans_placements_for_failed_replicas_by_priority() {
        let registry = vec![
            record("low", 3, ItemPriority::Low, &[("a", SyncStatus::Synchronized), ("b", SyncStatus::Failed), ("c", SyncStatus::Synchronized)]),
            record("hot", 3, ItemPriority::Critical, &[("a", SyncStatus::Synchronized), ("b", SyncStatus::Failed), ("c", SyncStatus::Synchronized)]),
            record("ok", 2, ItemPriority::Normal, &[("a", SyncStatus::Synchronized), ("c", SyncStatus::Synchronized)]),
        ];
        let spare = ["d", "e"];
        let report = plan_redundancy(
            &registry,
            |_| true,
            |count, exclude| {
                spare
                    .iter()
                    .map(|s| NodeId::from(*s))
                    .filter(|n| !exclude.contains(n))
                    .take(count)
                    .collect()
            },
        );
        assert_eq!(report.examined, 3);
        assert_eq!(report.total_gap(), 2);
        assert_eq!(report.gaps[0].item_id, ItemId::from("hot"));
        assert_eq!(report.placements.len(), 2);
        assert!(report.unplaceable.is_empty());
    }

    #[test]
    fn dead_node_counts_as_missing_and_no_spare_is_unplaceable() {
        let registry = vec![record("x", 2, ItemPriority::Normal, &[("a", SyncStatus::Synchronized), ("b", SyncStatus::Synchronized)])];
        let report = plan_redundancy(&registry, |n| n.as_str() != "b", |_, _| Vec::new());
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.unplaceable, vec![ItemId::from("x")]);
    }
}
