//! Raft RPC payloads carried inside [`crate::transport::Message`].

use super::log::LogEntry;
use crate::membership::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VoteRejectReason {
    StaleTerm,
    AlreadyVoted { for_node: NodeId },
    LogBehind,
    NotMember,
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub voter: NodeId,
    pub granted: bool,
    #[serde(default)]
    pub reject: Option<VoteRejectReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AppendRejectReason {
    StaleTerm,
    /// Another leader already holds this term.
    ConflictingLeader { leader: NodeId },
    MissingPredecessor { last_index: u64 },
    TermMismatch { conflict_index: u64 },
    /// Would overwrite a committed entry; the sender is not a legitimate leader.
    CommittedConflict { commit_index: u64 },
    /// The follower could not make the entries durable; none were kept.
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub follower: NodeId,
    pub success: bool,
    pub match_index: u64,
    #[serde(default)]
    pub reject: Option<AppendRejectReason>,
    /// Uncommitted entries dropped to follow the leader.
    #[serde(default)]
    pub truncated: u64,
}
