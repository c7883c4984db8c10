use super::{DurableLog, PersistedState};
use crate::consensus::LogEntry;
use crate::membership::NodeId;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Volatile log that survives a simulated crash as long as the handle is kept.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<PersistedState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableLog for MemoryLog {
    fn load(&self) -> Result<PersistedState> {
        Ok(self.state.lock().clone())
    }

    fn save_hard_state(&self, term: u64, voted_for: Option<&NodeId>) -> Result<()> {
        let mut state = self.state.lock();
        state.term = term;
        state.voted_for = voted_for.cloned();
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        self.state.lock().entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&self, index: u64) -> Result<()> {
        let keep = index.saturating_sub(1) as usize;
        self.state.lock().entries.truncate(keep);
        Ok(())
    }
}
