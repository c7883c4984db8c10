//! Coordinator-side replication: fan-out per strategy, replica registry, anti-entropy,
//! and conflict repair.

use super::conflict::{
    last_write_wins, priority_weighted, rollback_to, Conflict, ConflictArbiter, ConflictCandidate,
    ConflictError, ConflictResolutionResult, ConflictStrategy, ConflictType,
};
use super::item::{
    majority_of, ConsistencyLevel, ItemId, ItemMetadata, ReplicableItem, Replica, ReplicaRole,
    SyncStatus,
};
use super::store::{ReplicaRead, ReplicaReadResponse, ReplicaWrite, WriteMode, WriteOutcome};
use super::strategy::{strategy_for, ReplicationStrategy};
use crate::config::ReplicationConfig;
use crate::membership::NodeId;
use crate::time::Clock;
use crate::transport::{unexpected, Message, PinFuture, Transport, TransportError};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("no replication targets for {0}")]
    NoTargets(ItemId),
    #[error("item {0} fails checksum verification")]
    CorruptItem(ItemId),
    #[error("item {item} offered at version {offered}, registry holds {current}")]
    StaleVersion {
        item: ItemId,
        offered: u64,
        current: u64,
    },
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
    #[error("{item}: {answered} valid replicas answered, {required} required")]
    InsufficientReplicas {
        item: ItemId,
        answered: usize,
        required: usize,
    },
    #[error("no synchronized replica of {0} could serve as a repair source")]
    NoSource(ItemId),
    #[error("repair of {item} on {node} failed")]
    RepairFailed { item: ItemId, node: NodeId },
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// Coordinator's view of one item and where its copies live.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub metadata: ItemMetadata,
    pub strategy: ReplicationStrategy,
    pub replicas: Vec<Replica>,
}

impl ItemRecord {
    pub fn synchronized_data_replicas(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.holds_data() && r.sync_status == SyncStatus::Synchronized)
            .count()
    }

    /// Data replicas not known to be lost.
    pub fn healthy_data_replicas(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.holds_data() && r.sync_status != SyncStatus::Failed)
            .count()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.replicas.iter().map(|r| r.node_id.clone()).collect()
    }

    fn replica_mut(&mut self, node: &NodeId) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| &r.node_id == node)
    }
}

/// A target refused a write because it holds something else.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaConflict {
    pub node: NodeId,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationResult {
    pub item_id: ItemId,
    pub version: u64,
    pub strategy: ReplicationStrategy,
    /// Acks reached the replication factor. Anything less is a partial success and
    /// `unreachable` names the targets that did not answer.
    pub success: bool,
    /// The strategy's own wait threshold was met (`required_acks`, plus a synchronized
    /// majority for strong writes).
    pub strategy_satisfied: bool,
    /// Acknowledged targets, witnesses included.
    pub replicas_achieved: usize,
    pub synchronized_data_replicas: usize,
    pub required_acks: usize,
    pub unreachable: Vec<NodeId>,
    /// Targets still in flight when the call returned; they converge in the background.
    pub pending: Vec<NodeId>,
    pub conflicts: Vec<ReplicaConflict>,
    pub latency: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadOutcome {
    pub item: ReplicableItem,
    pub answered: usize,
    pub required: usize,
    pub stale: Vec<NodeId>,
    pub corrupt: Vec<NodeId>,
    pub unreachable: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub examined: usize,
    pub repaired: usize,
    pub failed: usize,
    pub missing_source: Vec<ItemId>,
}

struct WriteReply {
    node: NodeId,
    role: ReplicaRole,
    result: Result<Message, TransportError>,
}

enum ReplyClass {
    Acked,
    Refused(WriteOutcome),
    Lost,
}

#[derive(Default)]
struct AckTally {
    acks: usize,
    /// The primary acknowledged; a refused or lost primary write does not count.
    primary_answered: bool,
    secondary_acked: bool,
    unreachable: Vec<NodeId>,
    conflicts: Vec<ReplicaConflict>,
    answered: BTreeSet<NodeId>,
}

impl AckTally {
    fn record(&mut self, node: NodeId, role: ReplicaRole, class: ReplyClass) {
        self.answered.insert(node.clone());
        match class {
            ReplyClass::Acked => {
                self.acks += 1;
                if role == ReplicaRole::Primary {
                    self.primary_answered = true;
                }
                if role == ReplicaRole::Secondary {
                    self.secondary_acked = true;
                }
            }
            ReplyClass::Refused(outcome) => self.conflicts.push(ReplicaConflict { node, outcome }),
            ReplyClass::Lost => self.unreachable.push(node),
        }
    }

    fn satisfied(&self, strategy: ReplicationStrategy) -> bool {
        match strategy {
            ReplicationStrategy::Asynchronous => self.primary_answered,
            ReplicationStrategy::SemiSynchronous => self.primary_answered && self.secondary_acked,
            ReplicationStrategy::Quorum(q) => self.acks >= q.max(1),
            _ => false,
        }
    }
}

/// First target is primary, the next `rf - 1` secondaries, the rest witnesses.
pub fn assign_roles(targets: &[NodeId], rf: usize) -> Vec<(NodeId, ReplicaRole)> {
    let mut seen = BTreeSet::new();
    targets
        .iter()
        .filter(|t| seen.insert((*t).clone()))
        .cloned()
        .enumerate()
        .map(|(i, node)| {
            let role = match i {
                0 => ReplicaRole::Primary,
                i if i < rf.max(1) => ReplicaRole::Secondary,
                _ => ReplicaRole::Witness,
            };
            (node, role)
        })
        .collect()
}

pub struct ReplicationEngine<C: Clock> {
    inner: Arc<EngineInner<C>>,
}

impl<C: Clock> Clone for ReplicationEngine<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct EngineInner<C: Clock> {
    local: NodeId,
    clock: C,
    transport: Arc<dyn Transport>,
    config: ReplicationConfig,
    registry: RwLock<HashMap<ItemId, ItemRecord>>,
}

impl<C: Clock> std::fmt::Debug for ReplicationEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("local", &self.inner.local)
            .field("items", &self.inner.registry.read().len())
            .finish()
    }
}

impl<C: Clock> ReplicationEngine<C> {
    pub fn new(
        local: NodeId,
        clock: C,
        transport: Arc<dyn Transport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                local,
                clock,
                transport,
                config,
                registry: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    pub fn record(&self, id: &ItemId) -> Option<ItemRecord> {
        self.inner.registry.read().get(id).cloned()
    }

    pub fn registry_snapshot(&self) -> Vec<(ItemId, ItemRecord)> {
        let mut out: Vec<_> = self
            .inner
            .registry
            .read()
            .iter()
            .map(|(id, rec)| (id.clone(), rec.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn current_version(&self, id: &ItemId) -> Option<u64> {
        self.inner.registry.read().get(id).map(|r| r.metadata.version)
    }

    /// Successor of the registered version carrying `content`.
    pub fn next_version(&self, id: &ItemId, content: Vec<u8>) -> Result<ReplicableItem, ReplicationError> {
        let metadata = self
            .inner
            .registry
            .read()
            .get(id)
            .map(|r| r.metadata.clone())
            .ok_or_else(|| ReplicationError::UnknownItem(id.clone()))?;
        let current = ReplicableItem {
            id: id.clone(),
            content: Vec::new(),
            metadata,
        };
        Ok(current.next_version(content))
    }

    pub fn replicas_on(&self, node: &NodeId) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .inner
            .registry
            .read()
            .iter()
            .filter(|(_, rec)| rec.replicas.iter().any(|r| &r.node_id == node))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Write `item` to `targets` under `strategy`.
    pub async fn replicate(
        &self,
        item: ReplicableItem,
        targets: &[NodeId],
        strategy: ReplicationStrategy,
    ) -> Result<ReplicationResult, ReplicationError> {
        let started = self.inner.clock.now();
        if !item.verify() {
            return Err(ReplicationError::CorruptItem(item.id));
        }
        let rf = item.metadata.replication_factor.max(1);
        let placements = assign_roles(targets, rf);
        if placements.is_empty() {
            return Err(ReplicationError::NoTargets(item.id));
        }
        self.begin(&item, &placements, strategy)?;

        let deadline = tokio::time::Instant::now() + self.inner.config.strategy_timeout();
        let mut tally = AckTally::default();
        let mut pending = Vec::new();
        match strategy {
            ReplicationStrategy::Chain => {
                let mut rest = placements.into_iter();
                while let Some((node, role)) = rest.next() {
                    if tokio::time::Instant::now() >= deadline {
                        let remaining: Vec<_> = std::iter::once((node, role)).chain(rest).collect();
                        pending = remaining.iter().map(|(n, _)| n.clone()).collect();
                        self.continue_chain_in_background(item.clone(), remaining);
                        break;
                    }
                    let write = self.write_for(&item, role, WriteMode::Normal, None);
                    let reply = self.send_write(node, role, write).await;
                    let (node, class) = self.absorb(&item.id, item.version(), reply);
                    // A dead link is skipped; the chain continues with the next hop.
                    tally.record(node, role, class);
                }
            }
            ReplicationStrategy::MasterSlave => {
                let primary = placements[0].0.clone();
                let write = self.write_for(&item, ReplicaRole::Primary, WriteMode::Normal, Some(primary.clone()));
                let reply = self.send_write(primary.clone(), ReplicaRole::Primary, write).await;
                let (node, class) = self.absorb(&item.id, item.version(), reply);
                tally.record(node, ReplicaRole::Primary, class);
                let expected = placements[1..].iter().map(|(n, _)| n.clone()).collect();
                let slaves = placements[1..]
                    .iter()
                    .map(|(node, role)| {
                        let write = self.write_for(&item, *role, WriteMode::Normal, Some(primary.clone()));
                        self.send_write(node.clone(), *role, write)
                    })
                    .collect();
                pending = self
                    .collect_replies(&item, expected, slaves, strategy, deadline, &mut tally)
                    .await;
            }
            _ => {
                let expected = placements.iter().map(|(n, _)| n.clone()).collect();
                let fanout = placements
                    .iter()
                    .map(|(node, role)| {
                        let write = self.write_for(&item, *role, WriteMode::Normal, None);
                        self.send_write(node.clone(), *role, write)
                    })
                    .collect();
                pending = self
                    .collect_replies(&item, expected, fanout, strategy, deadline, &mut tally)
                    .await;
            }
        }

        let required_acks = strategy.required_acks(rf);
        let synchronized = self
            .record(&item.id)
            .map(|r| r.synchronized_data_replicas())
            .unwrap_or(0);
        let mut strategy_satisfied = tally.acks >= required_acks;
        if item.metadata.consistency == ConsistencyLevel::Strong {
            strategy_satisfied &= synchronized >= majority_of(rf);
        }
        let result = ReplicationResult {
            item_id: item.id.clone(),
            version: item.version(),
            strategy,
            success: tally.acks >= rf,
            strategy_satisfied,
            replicas_achieved: tally.acks,
            synchronized_data_replicas: synchronized,
            required_acks,
            unreachable: tally.unreachable,
            pending,
            conflicts: tally.conflicts,
            latency: self.inner.clock.now().saturating_duration_since(started),
        };
        if result.strategy_satisfied {
            tracing::debug!(
                item = %result.item_id,
                version = result.version,
                strategy = %strategy,
                acks = result.replicas_achieved,
                "replication acknowledged"
            );
        } else {
            tracing::warn!(
                item = %result.item_id,
                version = result.version,
                strategy = %strategy,
                acks = result.replicas_achieved,
                required = required_acks,
                unreachable = ?result.unreachable,
                "replication short of required acks"
            );
        }
        Ok(result)
    }

    fn begin(
        &self,
        item: &ReplicableItem,
        placements: &[(NodeId, ReplicaRole)],
        strategy: ReplicationStrategy,
    ) -> Result<(), ReplicationError> {
        let mut registry = self.inner.registry.write();
        if let Some(existing) = registry.get(&item.id) {
            let current = existing.metadata.version;
            let offered = item.version();
            let same_write = offered == current && existing.metadata.checksum == item.metadata.checksum;
            if offered < current || (offered == current && !same_write) {
                return Err(ReplicationError::StaleVersion {
                    item: item.id.clone(),
                    offered,
                    current,
                });
            }
        }
        let replicas = placements
            .iter()
            .map(|(node, role)| Replica {
                item_id: item.id.clone(),
                node_id: node.clone(),
                role: *role,
                sync_status: SyncStatus::Synchronizing,
                version: 0,
                last_sync: None,
            })
            .collect();
        registry.insert(
            item.id.clone(),
            ItemRecord {
                metadata: item.metadata.clone(),
                strategy,
                replicas,
            },
        );
        Ok(())
    }

    fn write_for(
        &self,
        item: &ReplicableItem,
        role: ReplicaRole,
        mode: WriteMode,
        primary: Option<NodeId>,
    ) -> ReplicaWrite {
        ReplicaWrite {
            item: if role == ReplicaRole::Witness {
                item.witness_copy()
            } else {
                item.clone()
            },
            role,
            mode,
            primary,
        }
    }

    fn send_write(&self, node: NodeId, role: ReplicaRole, write: ReplicaWrite) -> PinFuture<WriteReply> {
        let call = self.inner.transport.call(
            &self.inner.local,
            &node,
            Message::ReplicaWrite(write),
            self.inner.config.ack_timeout(),
        );
        Box::pin(async move {
            WriteReply {
                node,
                role,
                result: call.await,
            }
        })
    }

    /// Drain replies until the strategy is satisfied or the deadline passes. Anything left
    /// keeps running in the background and updates the registry when it lands.
    async fn collect_replies(
        &self,
        item: &ReplicableItem,
        expected: Vec<NodeId>,
        futures: Vec<PinFuture<WriteReply>>,
        strategy: ReplicationStrategy,
        deadline: tokio::time::Instant,
        tally: &mut AckTally,
    ) -> Vec<NodeId> {
        let mut in_flight: FuturesUnordered<PinFuture<WriteReply>> = futures.into_iter().collect();
        while !in_flight.is_empty() && !tally.satisfied(strategy) {
            match tokio::time::timeout_at(deadline, in_flight.next()).await {
                Ok(Some(reply)) => {
                    let role = reply.role;
                    let (node, class) = self.absorb(&item.id, item.version(), reply);
                    tally.record(node, role, class);
                }
                Ok(None) | Err(_) => break,
            }
        }
        if in_flight.is_empty() {
            return Vec::new();
        }
        let engine = self.clone();
        let item_id = item.id.clone();
        let version = item.version();
        tokio::spawn(async move {
            while let Some(reply) = in_flight.next().await {
                let (node, class) = engine.absorb(&item_id, version, reply);
                if let ReplyClass::Lost = class {
                    tracing::debug!(item = %item_id, node = %node, "background replica write lost");
                }
            }
        });
        expected
            .into_iter()
            .filter(|n| !tally.answered.contains(n))
            .collect()
    }

    fn continue_chain_in_background(&self, item: ReplicableItem, remaining: Vec<(NodeId, ReplicaRole)>) {
        let engine = self.clone();
        tokio::spawn(async move {
            for (node, role) in remaining {
                let write = engine.write_for(&item, role, WriteMode::Normal, None);
                let reply = engine.send_write(node, role, write).await;
                engine.absorb(&item.id, item.version(), reply);
            }
        });
    }

    /// Fold one write reply into the registry.
    fn absorb(&self, item_id: &ItemId, version: u64, reply: WriteReply) -> (NodeId, ReplyClass) {
        let WriteReply { node, role: _, result } = reply;
        let (status, class) = match result {
            Ok(Message::ReplicaWriteAck(ack)) if ack.outcome.is_ack() => {
                (SyncStatus::Synchronized, ReplyClass::Acked)
            }
            Ok(Message::ReplicaWriteAck(ack)) => (SyncStatus::OutOfSync, ReplyClass::Refused(ack.outcome)),
            Ok(other) => {
                let err = unexpected("replica_write_ack", &other);
                tracing::warn!(item = %item_id, node = %node, error = %err, "bad replica response");
                (SyncStatus::OutOfSync, ReplyClass::Lost)
            }
            Err(TransportError::Unreachable { .. }) => (SyncStatus::Failed, ReplyClass::Lost),
            Err(err) => {
                tracing::debug!(item = %item_id, node = %node, error = %err, "replica write not confirmed");
                (SyncStatus::OutOfSync, ReplyClass::Lost)
            }
        };
        let now = self.inner.clock.now();
        let mut registry = self.inner.registry.write();
        if let Some(record) = registry.get_mut(item_id) {
            if record.metadata.version == version {
                if let Some(replica) = record.replica_mut(&node) {
                    replica.sync_status = status;
                    if status == SyncStatus::Synchronized {
                        replica.version = version;
                        replica.last_sync = Some(now);
                    }
                }
            }
        }
        (node, class)
    }

    async fn read_from(&self, node: &NodeId, item_id: &ItemId) -> Result<Option<ReplicableItem>, TransportError> {
        let response = self
            .inner
            .transport
            .call(
                &self.inner.local,
                node,
                Message::ReplicaRead(ReplicaRead {
                    item_id: item_id.clone(),
                }),
                self.inner.config.ack_timeout(),
            )
            .await?;
        match response {
            Message::ReplicaReadResponse(resp) => Ok(resp.item),
            other => Err(unexpected("replica_read_response", &other)),
        }
    }

    /// Read from every data replica. Strong reads need a majority of valid answers.
    pub async fn read(
        &self,
        item_id: &ItemId,
        consistency: ConsistencyLevel,
    ) -> Result<ReadOutcome, ReplicationError> {
        let record = self
            .record(item_id)
            .ok_or_else(|| ReplicationError::UnknownItem(item_id.clone()))?;
        let holders: Vec<NodeId> = record
            .replicas
            .iter()
            .filter(|r| r.holds_data())
            .map(|r| r.node_id.clone())
            .collect();
        let replies = futures::future::join_all(holders.iter().map(|node| async move {
            (node.clone(), self.read_from(node, item_id).await)
        }))
        .await;

        let mut valid: Vec<(NodeId, ReplicableItem)> = Vec::new();
        let mut corrupt = Vec::new();
        let mut unreachable = Vec::new();
        let mut missing = Vec::new();
        for (node, reply) in replies {
            match reply {
                Ok(Some(item)) if item.verify() => valid.push((node, item)),
                Ok(Some(_)) => corrupt.push(node),
                Ok(None) => missing.push(node),
                Err(_) => unreachable.push(node),
            }
        }
        let required = match consistency {
            ConsistencyLevel::Strong => majority_of(record.metadata.replication_factor.max(1)),
            _ => 1,
        };
        if valid.len() < required {
            return Err(ReplicationError::InsufficientReplicas {
                item: item_id.clone(),
                answered: valid.len(),
                required,
            });
        }
        let Some(best) = valid.iter().map(|(_, item)| item).max_by_key(|item| item.version()).cloned() else {
            return Err(ReplicationError::InsufficientReplicas {
                item: item_id.clone(),
                answered: 0,
                required,
            });
        };
        let mut stale: Vec<NodeId> = valid
            .iter()
            .filter(|(_, item)| item.version() < best.version())
            .map(|(node, _)| node.clone())
            .collect();
        stale.extend(missing);
        if !stale.is_empty() || !corrupt.is_empty() {
            let mut registry = self.inner.registry.write();
            if let Some(rec) = registry.get_mut(item_id) {
                for node in stale.iter().chain(corrupt.iter()) {
                    if let Some(replica) = rec.replica_mut(node) {
                        replica.sync_status = SyncStatus::OutOfSync;
                    }
                }
            }
        }
        if !corrupt.is_empty() {
            tracing::warn!(item = %item_id, nodes = ?corrupt, "corrupt replicas found on read");
        }
        Ok(ReadOutcome {
            item: best,
            answered: valid.len(),
            required,
            stale,
            corrupt,
            unreachable,
        })
    }

    /// Registry entry for an item this coordinator did not write, rebuilt by asking
    /// `candidates` for their copies. The highest valid data copy sets the registered version.
    pub async fn locate(&self, item_id: &ItemId, candidates: &[NodeId]) -> Result<ItemRecord, ReplicationError> {
        if let Some(record) = self.record(item_id) {
            return Ok(record);
        }
        let replies = futures::future::join_all(candidates.iter().map(|node| async move {
            let reply = self
                .inner
                .transport
                .call(
                    &self.inner.local,
                    node,
                    Message::ReplicaRead(ReplicaRead {
                        item_id: item_id.clone(),
                    }),
                    self.inner.config.ack_timeout(),
                )
                .await;
            (node.clone(), reply)
        }))
        .await;
        let held: Vec<(NodeId, ReplicaRole, ReplicableItem)> = replies
            .into_iter()
            .filter_map(|(node, reply)| match reply {
                Ok(Message::ReplicaReadResponse(ReplicaReadResponse {
                    item: Some(item),
                    role,
                    ..
                })) => Some((node, role.unwrap_or(ReplicaRole::Secondary), item)),
                _ => None,
            })
            .collect();
        let metadata = held
            .iter()
            .filter(|(_, role, item)| *role != ReplicaRole::Witness && item.verify())
            .map(|(_, _, item)| &item.metadata)
            .max_by_key(|m| m.version)
            .cloned()
            .ok_or_else(|| ReplicationError::NoSource(item_id.clone()))?;
        let now = self.inner.clock.now();
        let replicas = held
            .into_iter()
            .map(|(node, role, item)| {
                let current = item.version() == metadata.version
                    && (role == ReplicaRole::Witness || item.verify());
                Replica {
                    item_id: item_id.clone(),
                    node_id: node,
                    role,
                    sync_status: if current {
                        SyncStatus::Synchronized
                    } else {
                        SyncStatus::OutOfSync
                    },
                    version: item.version(),
                    last_sync: current.then_some(now),
                }
            })
            .collect();
        let record = ItemRecord {
            strategy: strategy_for(metadata.consistency, self.inner.config.weak_quorum),
            metadata,
            replicas,
        };
        tracing::debug!(item = %item_id, replicas = record.replicas.len(), "item located");
        Ok(self
            .inner
            .registry
            .write()
            .entry(item_id.clone())
            .or_insert(record)
            .clone())
    }

    /// Fetch the registered version from a synchronized data replica.
    async fn authoritative_copy(&self, record: &ItemRecord, id: &ItemId) -> Option<(NodeId, ReplicableItem)> {
        let sources = record
            .replicas
            .iter()
            .filter(|r| r.holds_data() && r.sync_status == SyncStatus::Synchronized);
        for source in sources {
            if let Ok(Some(item)) = self.read_from(&source.node_id, id).await {
                if item.verify() && item.version() == record.metadata.version {
                    return Some((source.node_id.clone(), item));
                }
            }
        }
        None
    }

    /// Anti-entropy: push the registered version to every replica not known to hold it.
    pub async fn sync_pass(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for (id, record) in self.registry_snapshot() {
            report.examined += 1;
            let lagging: Vec<(NodeId, ReplicaRole)> = record
                .replicas
                .iter()
                .filter(|r| r.sync_status != SyncStatus::Synchronized)
                .map(|r| (r.node_id.clone(), r.role))
                .collect();
            if lagging.is_empty() {
                continue;
            }
            let Some((_, source)) = self.authoritative_copy(&record, &id).await else {
                report.missing_source.push(id);
                continue;
            };
            let pushes: Vec<_> = lagging
                .into_iter()
                .map(|(node, role)| {
                    let write = self.write_for(&source, role, WriteMode::Repair, None);
                    self.send_write(node, role, write)
                })
                .collect();
            for reply in futures::future::join_all(pushes).await {
                match self.absorb(&id, source.version(), reply).1 {
                    ReplyClass::Acked => report.repaired += 1,
                    _ => report.failed += 1,
                }
            }
        }
        if report.repaired > 0 || report.failed > 0 {
            tracing::info!(
                repaired = report.repaired,
                failed = report.failed,
                missing_source = report.missing_source.len(),
                "replica sync pass"
            );
        }
        report
    }

    /// Copy an item from a surviving replica onto `target`.
    pub async fn re_replicate(&self, id: &ItemId, target: &NodeId) -> Result<(), ReplicationError> {
        let record = self
            .record(id)
            .ok_or_else(|| ReplicationError::UnknownItem(id.clone()))?;
        let (_, source) = self
            .authoritative_copy(&record, id)
            .await
            .ok_or_else(|| ReplicationError::NoSource(id.clone()))?;
        let role = if record.replicas.iter().any(|r| r.role == ReplicaRole::Primary) {
            ReplicaRole::Secondary
        } else {
            ReplicaRole::Primary
        };
        {
            let mut registry = self.inner.registry.write();
            if let Some(rec) = registry.get_mut(id) {
                if rec.replica_mut(target).is_none() {
                    rec.replicas.push(Replica {
                        item_id: id.clone(),
                        node_id: target.clone(),
                        role,
                        sync_status: SyncStatus::Synchronizing,
                        version: 0,
                        last_sync: None,
                    });
                }
            }
        }
        let write = self.write_for(&source, role, WriteMode::Repair, None);
        let reply = self.send_write(target.clone(), role, write).await;
        match self.absorb(id, source.version(), reply).1 {
            ReplyClass::Acked => {
                tracing::info!(item = %id, node = %target, version = source.version(), "item re-replicated");
                Ok(())
            }
            _ => Err(ReplicationError::RepairFailed {
                item: id.clone(),
                node: target.clone(),
            }),
        }
    }

    /// Mark every replica on `node` as failed. Returns the affected items.
    pub fn mark_node_failed(&self, node: &NodeId) -> Vec<ItemId> {
        let mut affected = Vec::new();
        let mut registry = self.inner.registry.write();
        for (id, record) in registry.iter_mut() {
            if let Some(replica) = record.replica_mut(node) {
                replica.sync_status = SyncStatus::Failed;
                affected.push(id.clone());
            }
        }
        affected.sort();
        affected
    }

    /// Drop replicas hosted on `node`, promoting a synchronized secondary where the primary left.
    pub fn remove_node(&self, node: &NodeId) -> Vec<ItemId> {
        let mut affected = Vec::new();
        let mut registry = self.inner.registry.write();
        for (id, record) in registry.iter_mut() {
            let Some(pos) = record.replicas.iter().position(|r| &r.node_id == node) else {
                continue;
            };
            let removed = record.replicas.remove(pos);
            if removed.role == ReplicaRole::Primary {
                if let Some(next) = record
                    .replicas
                    .iter_mut()
                    .find(|r| r.role == ReplicaRole::Secondary && r.sync_status == SyncStatus::Synchronized)
                {
                    next.role = ReplicaRole::Primary;
                }
            }
            affected.push(id.clone());
        }
        affected.sort();
        affected
    }

    /// Read every data replica and report whether their copies disagree.
    pub async fn detect_conflict(&self, id: &ItemId) -> Result<Option<Conflict>, ReplicationError> {
        let record = self
            .record(id)
            .ok_or_else(|| ReplicationError::UnknownItem(id.clone()))?;
        let mut candidates = Vec::new();
        for replica in record.replicas.iter().filter(|r| r.holds_data()) {
            if let Ok(Some(item)) = self.read_from(&replica.node_id, id).await {
                candidates.push(ConflictCandidate {
                    node: replica.node_id.clone(),
                    item,
                });
            }
        }
        let conflict_type = if candidates.iter().any(|c| !c.is_valid()) {
            ConflictType::Corruption
        } else {
            let distinct: BTreeSet<(u64, u64)> = candidates
                .iter()
                .map(|c| (c.item.metadata.version, c.item.metadata.checksum))
                .collect();
            if distinct.len() <= 1 {
                return Ok(None);
            }
            let versions: BTreeSet<u64> = distinct.iter().map(|(v, _)| *v).collect();
            if versions.len() < distinct.len() {
                ConflictType::ConcurrentWrite
            } else {
                ConflictType::VersionDivergence
            }
        };
        Ok(Some(Conflict {
            item_id: id.clone(),
            conflict_type,
            candidates,
        }))
    }

    /// Pick a winner and republish it at `max_version + 1` to every involved node.
    pub async fn resolve_conflict(
        &self,
        conflict: &Conflict,
        strategy: ConflictStrategy,
        arbiter: Option<&dyn ConflictArbiter>,
    ) -> Result<ConflictResolutionResult, ReplicationError> {
        let winner_idx = match strategy {
            ConflictStrategy::LastWriteWins => last_write_wins(conflict)?,
            ConflictStrategy::PriorityWeightedMerge => priority_weighted(conflict)?,
            ConflictStrategy::RollbackToVersion(v) => rollback_to(conflict, v)?,
            ConflictStrategy::Consensus => {
                let arbiter = arbiter.ok_or(ConflictError::NoArbiter)?;
                arbiter.arbitrate(conflict).await?
            }
        };
        let candidate = conflict
            .candidates
            .get(winner_idx)
            .ok_or_else(|| ConflictError::NoValidCandidate(conflict.item_id.clone()))?;
        if !candidate.is_valid() {
            return Err(ConflictError::NoValidCandidate(conflict.item_id.clone()).into());
        }
        let registered = self.current_version(&conflict.item_id).unwrap_or(0);
        let resolved_version = conflict.max_version().max(registered) + 1;
        let winner = candidate.item.restamped(resolved_version);

        let existing = self.record(&conflict.item_id);
        let mut placements: Vec<(NodeId, ReplicaRole)> = existing
            .as_ref()
            .map(|r| r.replicas.iter().map(|rep| (rep.node_id.clone(), rep.role)).collect())
            .unwrap_or_default();
        for node in conflict.nodes() {
            if !placements.iter().any(|(n, _)| n == &node) {
                let role = if placements.is_empty() {
                    ReplicaRole::Primary
                } else {
                    ReplicaRole::Secondary
                };
                placements.push((node, role));
            }
        }
        {
            let mut registry = self.inner.registry.write();
            let strategy_used = existing
                .as_ref()
                .map(|r| r.strategy)
                .unwrap_or(ReplicationStrategy::Synchronous);
            registry.insert(
                conflict.item_id.clone(),
                ItemRecord {
                    metadata: winner.metadata.clone(),
                    strategy: strategy_used,
                    replicas: placements
                        .iter()
                        .map(|(node, role)| Replica {
                            item_id: conflict.item_id.clone(),
                            node_id: node.clone(),
                            role: *role,
                            sync_status: SyncStatus::Synchronizing,
                            version: 0,
                            last_sync: None,
                        })
                        .collect(),
                },
            );
        }
        let pushes: Vec<_> = placements
            .into_iter()
            .map(|(node, role)| {
                let write = self.write_for(&winner, role, WriteMode::Repair, None);
                self.send_write(node, role, write)
            })
            .collect();
        let mut repaired = Vec::new();
        let mut failed = Vec::new();
        for reply in futures::future::join_all(pushes).await {
            match self.absorb(&conflict.item_id, resolved_version, reply) {
                (node, ReplyClass::Acked) => repaired.push(node),
                (node, _) => failed.push(node),
            }
        }
        tracing::info!(
            item = %conflict.item_id,
            kind = ?conflict.conflict_type,
            ?strategy,
            source = %candidate.node,
            version = resolved_version,
            repaired = repaired.len(),
            failed = failed.len(),
            "conflict resolved"
        );
        Ok(ConflictResolutionResult {
            item_id: conflict.item_id.clone(),
            strategy,
            conflict_type: conflict.conflict_type,
            source: candidate.node.clone(),
            resolved_version,
            resolved_checksum: winner.metadata.checksum,
            repaired,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::store::ReplicaStore;
    use crate::time::SystemClock;
    use crate::transport::{MemoryNetwork, MessageHandler};

    struct StoreHandler(ReplicaStore<SystemClock>);

    impl MessageHandler for StoreHandler {
        fn handle(&self, _from: &NodeId, message: Message) -> Message {
            match message {
                Message::ReplicaWrite(write) => Message::ReplicaWriteAck(self.0.handle_write(write)),
                Message::ReplicaRead(read) => Message::ReplicaReadResponse(self.0.handle_read(&read)),
                other => Message::Unsupported(other.kind().to_string()),
            }
        }
    }

    fn cluster(n: usize) -> (MemoryNetwork, Vec<NodeId>, Vec<Arc<StoreHandler>>, ReplicationEngine<SystemClock>) {
        let net = MemoryNetwork::new();
        let mut ids = Vec::new();
        let mut stores = Vec::new();
        for i in 0..n {
            let id = NodeId::new(format!("n{i}"));
            let handler = Arc::new(StoreHandler(ReplicaStore::new(id.clone(), SystemClock)));
            net.register(id.clone(), handler.clone());
            ids.push(id);
            stores.push(handler);
        }
        let config = ReplicationConfig {
            ack_timeout_ms: 20,
            strategy_timeout_ms: 200,
            ..ReplicationConfig::default()
        };
        let engine = ReplicationEngine::new("coord".into(), SystemClock, Arc::new(net.clone()), config);
        (net, ids, stores, engine)
    }

    fn item(content: &[u8], level: ConsistencyLevel) -> ReplicableItem {
        ReplicableItem::new("x", content.to_vec(), "coord".into(), 3, level)
    }

    #[test]
    fn roles_beyond_rf_are_witnesses() {
        let ids: Vec<NodeId> = ["a", "b", "c", "d", "b"].iter().map(|s| NodeId::from(*s)).collect();
        let roles = assign_roles(&ids, 3);
        assert_eq!(roles.len(), 4);
        assert_eq!(roles[0].1, ReplicaRole::Primary);
        assert_eq!(roles[2].1, ReplicaRole::Secondary);
        assert_eq!(roles[3].1, ReplicaRole::Witness);
    }

    #[tokio::test]
    async fn synchronous_write_reaches_all_targets() {
        let (_net, ids, stores, engine) = cluster(3);
        let result = engine
            .replicate(item(b"v1", ConsistencyLevel::Strong), &ids, ReplicationStrategy::Synchronous)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.strategy_satisfied);
        assert_eq!(result.synchronized_data_replicas, 3);
        assert!(stores.iter().all(|s| s.0.version_of(&"x".into()) == Some(1)));
    }

    #[tokio::test]
    async fn strong_write_fails_without_majority() {
        let (net, ids, _stores, engine) = cluster(3);
        net.crash(&ids[1]);
        net.crash(&ids[2]);
        let result = engine
            .replicate(item(b"v1", ConsistencyLevel::Strong), &ids, ReplicationStrategy::Synchronous)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.unreachable.len(), 2);
        let record = engine.record(&"x".into()).unwrap();
        assert_eq!(record.synchronized_data_replicas(), 1);
    }

    #[tokio::test]
    async fn quorum_write_short_of_rf_is_partial() {
        let (net, ids, _stores, engine) = cluster(3);
        net.crash(&ids[2]);
        let result = engine
            .replicate(item(b"v1", ConsistencyLevel::Weak), &ids, ReplicationStrategy::Quorum(2))
            .await
            .unwrap();
        assert_eq!(result.replicas_achieved, 2);
        assert!(result.strategy_satisfied);
        assert!(!result.success);
        assert!(result.unreachable.contains(&ids[2]) || result.pending.contains(&ids[2]));
    }

    #[tokio::test]
    async fn async_write_waits_past_a_dead_primary() {
        let (net, ids, stores, engine) = cluster(3);
        net.crash(&ids[0]);
        let result = engine
            .replicate(item(b"v1", ConsistencyLevel::Eventual), &ids, ReplicationStrategy::Asynchronous)
            .await
            .unwrap();
        assert_eq!(result.unreachable, vec![ids[0].clone()]);
        assert_eq!(result.replicas_achieved, 2);
        assert!(result.strategy_satisfied);
        assert!(!result.success);
        assert_eq!(stores[1].0.version_of(&"x".into()), Some(1));
    }

    #[tokio::test]
    async fn chain_skips_dead_link() {
        let (net, ids, stores, engine) = cluster(3);
        net.crash(&ids[1]);
        let result = engine
            .replicate(item(b"v1", ConsistencyLevel::Weak), &ids, ReplicationStrategy::Chain)
            .await
            .unwrap();
        assert_eq!(result.replicas_achieved, 2);
        assert!(!result.success);
        assert_eq!(stores[2].0.version_of(&"x".into()), Some(1));
    }

    #[tokio::test]
    async fn stale_version_rejected() {
        let (_net, ids, _stores, engine) = cluster(3);
        let v1 = item(b"v1", ConsistencyLevel::Weak);
        engine.replicate(v1.clone(), &ids, ReplicationStrategy::Quorum(2)).await.unwrap();
        let v2 = engine.next_version(&"x".into(), b"v2".to_vec()).unwrap();
        engine.replicate(v2, &ids, ReplicationStrategy::Synchronous).await.unwrap();
        let err = engine.replicate(v1, &ids, ReplicationStrategy::Synchronous).await.unwrap_err();
        assert!(matches!(err, ReplicationError::StaleVersion { offered: 1, current: 2, .. }));
    }

    #[tokio::test]
    async fn sync_pass_repairs_restarted_replica() {
        let (net, ids, stores, engine) = cluster(3);
        net.crash(&ids[2]);
        engine
            .replicate(item(b"v1", ConsistencyLevel::Causal), &ids, ReplicationStrategy::Synchronous)
            .await
            .unwrap();
        net.restart(&ids[2]);
        let report = engine.sync_pass().await;
        assert_eq!(report.repaired, 1);
        assert_eq!(stores[2].0.version_of(&"x".into()), Some(1));
        assert_eq!(engine.record(&"x".into()).unwrap().synchronized_data_replicas(), 3);
    }

    #[tokio::test]
    async fn read_skips_corrupt_replica_and_flags_it() {
        let (_net, ids, stores, engine) = cluster(3);
        engine
            .replicate(item(b"v1", ConsistencyLevel::Strong), &ids, ReplicationStrategy::Synchronous)
            .await
            .unwrap();
        stores[0].0.inject_corruption(&"x".into(), b"garbage".to_vec());
        let read = engine.read(&"x".into(), ConsistencyLevel::Strong).await.unwrap();
        assert_eq!(read.item.content, b"v1".to_vec());
        assert_eq!(read.corrupt, vec![ids[0].clone()]);
        let conflict = engine.detect_conflict(&"x".into()).await.unwrap().unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Corruption);
        let resolved = engine
            .resolve_conflict(&conflict, ConflictStrategy::LastWriteWins, None)
            .await
            .unwrap();
        assert_eq!(resolved.resolved_version, 2);
        assert_eq!(stores[0].0.get(&"x".into()).unwrap().content, b"v1".to_vec());
    }
}
