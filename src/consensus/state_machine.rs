use super::log::LogEntry;
use super::{MembershipChange, ProposalValue};
use crate::membership::NodeId;
use crate::replication::ItemId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommittedData {
    pub version: u64,
    pub checksum: u64,
    pub index: u64,
}

/// State derived from committed entries. Applying an index at or below `last_applied`
/// changes nothing, so redelivered entries are harmless.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppliedState {
    pub last_applied: u64,
    pub last_applied_term: u64,
    pub data: BTreeMap<ItemId, CommittedData>,
    pub config: BTreeMap<String, String>,
    pub members: BTreeSet<NodeId>,
}

impl AppliedState {
    pub fn with_members(members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            members: members.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Returns whether the entry changed anything.
    pub fn apply(&mut self, entry: &LogEntry) -> bool {
        if entry.index <= self.last_applied {
            return false;
        }
        if entry.index != self.last_applied + 1 {
            tracing::warn!(
                index = entry.index,
                last_applied = self.last_applied,
                "refusing out-of-order apply"
            );
            return false;
        }
        match &entry.proposal.value {
            ProposalValue::DataCommit {
                item_id,
                version,
                checksum,
            } => {
                let newer = self
                    .data
                    .get(item_id)
                    .map_or(true, |held| *version > held.version);
                if newer {
                    self.data.insert(
                        item_id.clone(),
                        CommittedData {
                            version: *version,
                            checksum: *checksum,
                            index: entry.index,
                        },
                    );
                }
            }
            ProposalValue::ConfigChange { key, value } => {
                self.config.insert(key.clone(), value.clone());
            }
            ProposalValue::MembershipChange(MembershipChange::Add(node)) => {
                self.members.insert(node.clone());
            }
            ProposalValue::MembershipChange(MembershipChange::Remove(node)) => {
                self.members.remove(node);
            }
            ProposalValue::Noop => {}
        }
        self.last_applied = entry.index;
        self.last_applied_term = entry.term;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusProposal, ProposalPriority};

    fn entry(index: u64, value: ProposalValue) -> LogEntry {
        LogEntry {
            term: 1,
            index,
            proposal: ConsensusProposal::new("n1".into(), value, 1, index, ProposalPriority::Normal),
        }
    }

    #[test]
    fn reapplying_committed_entry_changes_nothing() {
        let mut state = AppliedState::with_members(["n1".into(), "n2".into()]);
        let e1 = entry(
            1,
            ProposalValue::ConfigChange {
                key: "mode".into(),
                value: "a".into(),
            },
        );
        assert!(state.apply(&e1));
        let snapshot = state.clone();
        assert!(!state.apply(&e1));
        assert_eq!(state, snapshot);
    }

    #[test]
    fn membership_changes_apply_in_order() {
        let mut state = AppliedState::with_members(["n1".into(), "n2".into()]);
        state.apply(&entry(1, ProposalValue::MembershipChange(MembershipChange::Remove("n2".into()))));
        state.apply(&entry(2, ProposalValue::MembershipChange(MembershipChange::Add("n3".into()))));
        let members: Vec<_> = state.members.iter().map(|m| m.as_str().to_string()).collect();
        assert_eq!(members, vec!["n1", "n3"]);
    }

    #[test]
    fn gap_is_not_applied() {
        let mut state = AppliedState::default();
        assert!(!state.apply(&entry(2, ProposalValue::Noop)));
        assert_eq!(state.last_applied, 0);
    }

    #[test]
    fn data_commit_keeps_highest_version() {
        let mut state = AppliedState::default();
        let commit = |v| ProposalValue::DataCommit {
            item_id: "x".into(),
            version: v,
            checksum: v * 10,
        };
        state.apply(&entry(1, commit(3)));
        state.apply(&entry(2, commit(2)));
        assert_eq!(state.data[&ItemId::from("x")].version, 3);
    }
}
