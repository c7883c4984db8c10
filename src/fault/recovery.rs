use super::detector::FailureType;
use crate::membership::NodeId;
use crate::replication::ItemId;
use crate::transport::MemoryNetwork;
use serde::Serialize;
use std::time::Duration;

/// Something that can try to bring a node process back.
pub trait NodeRestarter: Send + Sync {
    /// Returns whether a restart was issued.
    fn restart(&self, node: &NodeId) -> bool;
}

impl NodeRestarter for MemoryNetwork {
    fn restart(&self, node: &NodeId) -> bool {
        MemoryNetwork::restart(self, node)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The node answered heartbeats again after a restart.
    Restarted,
    /// The node stayed down; its items were copied to other nodes.
    ReReplicated,
    /// Partitions and slow nodes heal on their own; nothing was done.
    Deferred,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub node_id: NodeId,
    pub failure_type: FailureType,
    pub action: RecoveryAction,
    pub restart_attempts: u32,
    pub re_replicated: Vec<(ItemId, NodeId)>,
    /// Items that could not be placed elsewhere.
    pub unrecovered: Vec<ItemId>,
    pub recovered: bool,
    pub duration: Duration,
}
