//! Durable per-node consensus state.
//!
//! - `memory` - `MemoryLog` for simulations and tests
//! - `file` - `FileLog`: append-only JSON-lines file with compaction

pub mod file;
pub mod memory;

pub use file::FileLog;
pub use memory::MemoryLog;

use crate::consensus::LogEntry;
use crate::membership::NodeId;
use anyhow::Result;

/// Everything a node must recover after restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub entries: Vec<LogEntry>,
}

/// Opaque durable log owned by one node. Writes complete before the node answers the RPC
/// that caused them.
pub trait DurableLog: Send + Sync + 'static {
    fn load(&self) -> Result<PersistedState>;
    fn save_hard_state(&self, term: u64, voted_for: Option<&NodeId>) -> Result<()>;
    fn append(&self, entries: &[LogEntry]) -> Result<()>;
    /// Drop `index` and everything after it.
    fn truncate_from(&self, index: u64) -> Result<()>;
}
