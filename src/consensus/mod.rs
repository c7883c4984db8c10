//! Leader-based consensus (Raft).
//!
//! - `log` - Replicated log with the log-matching check
//! - `rpc` - RequestVote / AppendEntries payloads
//! - `node` - `RaftCore`: one node's term, vote, log, and commit state behind a single mutex
//! - `module` - `ConsensusModule`: elections, replication rounds, proposals, partition recovery
//! - `state_machine` - Applied state built from committed entries

pub mod log;
pub mod module;
pub mod node;
pub mod rpc;
pub mod state_machine;

pub use log::{LogEntry, LogError, RaftLog};
pub use module::{
    ConsensusModule, ElectionOutcome, PartitionRecovery, PeerRecovery, TickOutcome,
};
pub use node::RaftCore;
pub use state_machine::{AppliedState, CommittedData};

use crate::membership::NodeId;
use crate::replication::ItemId;
use crate::time::unix_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftRole::Follower => f.write_str("follower"),
            RaftRole::Candidate => f.write_str("candidate"),
            RaftRole::Leader => f.write_str("leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "node", rename_all = "snake_case")]
pub enum MembershipChange {
    Add(NodeId),
    Remove(NodeId),
}

/// Replicated operation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum ProposalValue {
    /// A replicated item became durable at this version.
    DataCommit {
        item_id: ItemId,
        version: u64,
        checksum: u64,
    },
    ConfigChange {
        key: String,
        value: String,
    },
    MembershipChange(MembershipChange),
    /// Appended by every new leader to commit entries from earlier terms.
    Noop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalPriority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub id: Uuid,
    pub proposer: NodeId,
    pub value: ProposalValue,
    pub term: u64,
    pub index: u64,
    pub timestamp_ms: u64,
    pub priority: ProposalPriority,
}

impl ConsensusProposal {
    pub fn new(
        proposer: NodeId,
        value: ProposalValue,
        term: u64,
        index: u64,
        priority: ProposalPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposer,
            value,
            term,
            index,
            timestamp_ms: unix_millis(),
            priority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Accept,
    Reject,
    Abstain,
}

/// One voter's answer to one proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: NodeId,
    pub proposal_id: Uuid,
    pub decision: VoteDecision,
    pub term: u64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOutcome {
    Committed,
    Timeout,
    /// The leader could not reach a majority before the round deadline.
    Partitioned,
    /// The term moved on, or another leader's entry took the slot.
    TermConflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub proposal_id: Uuid,
    pub outcome: ConsensusOutcome,
    pub agreed_value: Option<ProposalValue>,
    pub term: u64,
    pub index: u64,
    pub rounds: u32,
    pub votes: Vec<Vote>,
}

impl ConsensusResult {
    pub fn is_committed(&self) -> bool {
        self.outcome == ConsensusOutcome::Committed
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("not leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("consensus unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Emitted for every entry applied to the local state machine.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyEvent {
    pub term: u64,
    pub index: u64,
    pub proposal_id: Uuid,
    pub value: ProposalValue,
}

/// Strict majority of `n` voters: ⌊n/2⌋ + 1.
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}
