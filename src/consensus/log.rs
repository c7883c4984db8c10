use super::ConsensusProposal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub proposal: ConsensusProposal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("missing predecessor at index {index}; log ends at {last_index}")]
    MissingPredecessor { index: u64, last_index: u64 },
    #[error("term mismatch at index {index}: expected {expected}, found {found}")]
    TermMismatch {
        index: u64,
        expected: u64,
        found: u64,
        /// First index holding the conflicting term; the leader backs up to it.
        conflict_index: u64,
    },
    #[error("entry {index} conflicts with committed prefix ending at {commit_index}")]
    CommittedConflict { index: u64, commit_index: u64 },
    #[error("entry index {got} does not follow {last_index}")]
    NonContiguous { got: u64, last_index: u64 },
}

/// Result of applying a leader's append to the local log.
#[derive(Debug, Clone, Default)]
pub struct AppendSummary {
    /// Entries that were not already present, in order.
    pub appended: Vec<LogEntry>,
    /// First index removed because it conflicted with the leader.
    pub truncated_from: Option<u64>,
    pub truncated: u64,
    /// Last index covered by the request.
    pub match_index: u64,
}

/// In-memory Raft log, indexed from 1. Entries are totally ordered by (term, index).
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Entries must be contiguous from index 1.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, LogError> {
        let mut log = Self::new();
        for entry in entries {
            log.push(entry)?;
        }
        Ok(log)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term at `index`; index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let start = index.max(1) as usize - 1;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Leader-side append of a freshly created entry.
    pub fn push(&mut self, entry: LogEntry) -> Result<(), LogError> {
        let last_index = self.last_index();
        if entry.index != last_index + 1 {
            return Err(LogError::NonContiguous {
                got: entry.index,
                last_index,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Whether `(term, index)` is at least as up to date as this log.
    pub fn is_up_to_date(&self, last_term: u64, last_index: u64) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }

    fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Follower-side append. Rejects unless the predecessor `(prev_term, prev_index)` is held,
    /// then truncates any uncommitted suffix that conflicts with `entries`.
    pub fn append_from_leader(
        &mut self,
        prev_index: u64,
        prev_term: u64,
        entries: &[LogEntry],
        commit_index: u64,
    ) -> Result<AppendSummary, LogError> {
        match self.term_at(prev_index) {
            None => {
                return Err(LogError::MissingPredecessor {
                    index: prev_index,
                    last_index: self.last_index(),
                })
            }
            Some(found) if found != prev_term => {
                return Err(LogError::TermMismatch {
                    index: prev_index,
                    expected: prev_term,
                    found,
                    conflict_index: self.first_index_of_term(prev_index),
                })
            }
            Some(_) => {}
        }
        let mut summary = AppendSummary {
            match_index: prev_index + entries.len() as u64,
            ..AppendSummary::default()
        };
        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            if entry.index != index {
                return Err(LogError::NonContiguous {
                    got: entry.index,
                    last_index: index - 1,
                });
            }
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if index <= commit_index {
                        return Err(LogError::CommittedConflict {
                            index,
                            commit_index,
                        });
                    }
                    summary.truncated += self.truncate_from(index).len() as u64;
                    summary.truncated_from.get_or_insert(index);
                }
                None => {}
            }
            self.entries.push(entry.clone());
            summary.appended.push(entry.clone());
        }
        Ok(summary)
    }

    /// Drop `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) -> Vec<LogEntry> {
        let keep = index.saturating_sub(1) as usize;
        if keep >= self.entries.len() {
            return Vec::new();
        }
        self.entries.split_off(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ProposalPriority, ProposalValue};

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            proposal: ConsensusProposal::new(
                "leader".into(),
                ProposalValue::Noop,
                term,
                index,
                ProposalPriority::Normal,
            ),
        }
    }

    fn log_with(terms: &[u64]) -> RaftLog {
        RaftLog::from_entries(
            terms
                .iter()
                .enumerate()
                .map(|(i, t)| entry(*t, i as u64 + 1))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_append_without_predecessor() {
        let mut log = log_with(&[1]);
        let err = log.append_from_leader(3, 1, &[entry(1, 4)], 0).unwrap_err();
        assert_eq!(err, LogError::MissingPredecessor { index: 3, last_index: 1 });
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn rejects_mismatched_predecessor_term() {
        let mut log = log_with(&[1, 2, 2]);
        let err = log.append_from_leader(3, 3, &[entry(3, 4)], 0).unwrap_err();
        match err {
            LogError::TermMismatch { found, conflict_index, .. } => {
                assert_eq!(found, 2);
                assert_eq!(conflict_index, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncates_conflicting_uncommitted_suffix() {
        let mut log = log_with(&[1, 1, 2, 2]);
        let summary = log
            .append_from_leader(2, 1, &[entry(3, 3)], 2)
            .unwrap();
        assert_eq!(summary.truncated_from, Some(3));
        assert_eq!(summary.truncated, 2);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn duplicate_append_is_noop() {
        let mut log = log_with(&[1, 1]);
        let summary = log.append_from_leader(1, 1, &[entry(1, 2)], 0).unwrap();
        assert!(summary.appended.is_empty());
        assert_eq!(summary.match_index, 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn refuses_to_overwrite_committed_entry() {
        let mut log = log_with(&[1, 1]);
        let err = log.append_from_leader(1, 1, &[entry(2, 2)], 2).unwrap_err();
        assert!(matches!(err, LogError::CommittedConflict { index: 2, .. }));
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log_with(&[1, 2]);
        assert!(log.is_up_to_date(3, 1));
        assert!(log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(2, 1));
        assert!(!log.is_up_to_date(1, 9));
    }
}
