//! One node's Raft state.
//!
//! Term, vote, log, commit index, and applied state share a single mutex: they are mutated by
//! both the election timer and incoming RPC handlers. Nothing here touches the network; the
//! [`super::ConsensusModule`] drives RPCs and feeds responses back in.

use super::log::{LogEntry, LogError, RaftLog};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AppendRejectReason, RequestVoteRequest,
    RequestVoteResponse, VoteRejectReason,
};
use super::state_machine::AppliedState;
use super::{quorum, ApplyEvent, ConsensusError, ConsensusProposal, ProposalPriority, ProposalValue, RaftRole};
use crate::config::ConsensusConfig;
use crate::membership::NodeId;
use crate::storage::DurableLog;
use crate::time::Clock;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hasher;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use twox_hash::XxHash64;

/// What the leader learned from one AppendEntries exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendFeedback {
    Accepted { match_index: u64 },
    Rejected { next_index: u64 },
    SteppedDown { term: u64 },
    /// The response belongs to an older term or this node is no longer leader.
    Ignored,
}

/// An election this node just started.
#[derive(Debug, Clone)]
pub struct Candidacy {
    pub term: u64,
    pub request: RequestVoteRequest,
    pub peers: Vec<NodeId>,
}

#[derive(Debug)]
struct RaftState {
    role: RaftRole,
    term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    applied: AppliedState,
    election_deadline: Instant,
    votes: BTreeSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_ack: HashMap<NodeId, Instant>,
    rng: StdRng,
}

pub struct RaftCore<C: Clock> {
    id: NodeId,
    clock: C,
    config: ConsensusConfig,
    storage: Arc<dyn DurableLog>,
    state: Mutex<RaftState>,
    apply_tx: broadcast::Sender<ApplyEvent>,
}

impl<C: Clock> std::fmt::Debug for RaftCore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RaftCore")
            .field("id", &self.id)
            .field("role", &state.role)
            .field("term", &state.term)
            .field("commit_index", &state.commit_index)
            .field("last_index", &state.log.last_index())
            .finish()
    }
}

fn seeded_rng(seed: Option<u64>, id: &NodeId) -> StdRng {
    match seed {
        Some(seed) => {
            let mut hasher = XxHash64::with_seed(seed);
            hasher.write(id.as_str().as_bytes());
            StdRng::seed_from_u64(hasher.finish())
        }
        None => StdRng::from_entropy(),
    }
}

impl<C: Clock> RaftCore<C> {
    /// Recover from `storage` and start as a follower. `members` is the initial voting set.
    pub fn new(
        id: NodeId,
        members: impl IntoIterator<Item = NodeId>,
        clock: C,
        config: ConsensusConfig,
        storage: Arc<dyn DurableLog>,
    ) -> Result<Self> {
        let persisted = storage.load().context("load consensus state")?;
        let log = RaftLog::from_entries(persisted.entries).context("rebuild raft log")?;
        let mut rng = seeded_rng(config.election_seed, &id);
        let timeout = random_timeout(&mut rng, &config);
        let state = RaftState {
            role: RaftRole::Follower,
            term: persisted.term,
            voted_for: persisted.voted_for,
            leader: None,
            log,
            commit_index: 0,
            applied: AppliedState::with_members(members),
            election_deadline: clock.now() + timeout,
            votes: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            rng,
        };
        let (apply_tx, _) = broadcast::channel(256);
        Ok(Self {
            id,
            clock,
            config,
            storage,
            state: Mutex::new(state),
            apply_tx,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().leader.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    pub fn last_log_index(&self) -> u64 {
        self.state.lock().log.last_index()
    }

    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        self.state.lock().log.entry(index).cloned()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().log.entries().to_vec()
    }

    /// Entries at or below the commit index.
    pub fn committed_entries(&self) -> Vec<LogEntry> {
        let state = self.state.lock();
        state
            .log
            .entries()
            .iter()
            .take(state.commit_index as usize)
            .cloned()
            .collect()
    }

    pub fn applied(&self) -> AppliedState {
        self.state.lock().applied.clone()
    }

    pub fn members(&self) -> BTreeSet<NodeId> {
        self.state.lock().applied.members.clone()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        self.peers_of(&state)
    }

    pub fn progress(&self, peer: &NodeId) -> Option<(u64, u64)> {
        let state = self.state.lock();
        Some((*state.next_index.get(peer)?, state.match_index.get(peer).copied().unwrap_or(0)))
    }

    pub fn subscribe_applied(&self) -> broadcast::Receiver<ApplyEvent> {
        self.apply_tx.subscribe()
    }

    fn peers_of(&self, state: &RaftState) -> Vec<NodeId> {
        state
            .applied
            .members
            .iter()
            .filter(|m| **m != self.id)
            .cloned()
            .collect()
    }

    fn majority(&self, state: &RaftState) -> usize {
        quorum(state.applied.members.len().max(1))
    }

    fn reset_election_timer(&self, state: &mut RaftState) {
        let timeout = random_timeout(&mut state.rng, &self.config);
        state.election_deadline = self.clock.now() + timeout;
    }

    fn persist_hard_state(&self, state: &RaftState) -> bool {
        match self.storage.save_hard_state(state.term, state.voted_for.as_ref()) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(node = %self.id, error = %err, "persist hard state failed");
                false
            }
        }
    }

    fn persist_entries(&self, entries: &[LogEntry]) -> bool {
        match self.storage.append(entries) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(node = %self.id, error = %err, "persist log entries failed");
                false
            }
        }
    }

    /// Adopt `term` as a follower. A newer term clears the vote and the known leader.
    fn step_down(&self, state: &mut RaftState, term: u64) {
        let was = state.role;
        if term > state.term {
            state.term = term;
            state.voted_for = None;
            state.leader = None;
            self.persist_hard_state(state);
        }
        state.role = RaftRole::Follower;
        state.votes.clear();
        if was != RaftRole::Follower {
            tracing::info!(node = %self.id, term = state.term, from = %was, "stepping down to follower");
            self.reset_election_timer(state);
        }
    }

    /// Whether the election timer has fired and this node may campaign.
    pub fn election_due(&self) -> bool {
        let state = self.state.lock();
        state.role != RaftRole::Leader
            && state.applied.members.contains(&self.id)
            && self.clock.now() >= state.election_deadline
    }

    pub fn election_deadline(&self) -> Instant {
        self.state.lock().election_deadline
    }

    /// Become candidate in a new term and vote for self. Returns `None` for non-members.
    pub fn begin_election(&self) -> Option<Candidacy> {
        let mut state = self.state.lock();
        if !state.applied.members.contains(&self.id) {
            return None;
        }
        state.role = RaftRole::Candidate;
        state.term += 1;
        state.voted_for = Some(self.id.clone());
        state.leader = None;
        state.votes = BTreeSet::from([self.id.clone()]);
        if !self.persist_hard_state(&state) {
            state.role = RaftRole::Follower;
            return None;
        }
        self.reset_election_timer(&mut state);
        tracing::info!(node = %self.id, term = state.term, "starting election");
        let request = RequestVoteRequest {
            term: state.term,
            candidate: self.id.clone(),
            last_log_index: state.log.last_index(),
            last_log_term: state.log.last_term(),
        };
        let peers = self.peers_of(&state);
        if state.votes.len() >= self.majority(&state) {
            self.become_leader(&mut state);
        }
        Some(Candidacy {
            term: request.term,
            request,
            peers,
        })
    }

    /// Count a vote. Returns true when this response made the node leader.
    pub fn on_vote_response(&self, election_term: u64, response: &RequestVoteResponse) -> bool {
        let mut state = self.state.lock();
        if response.term > state.term {
            self.step_down(&mut state, response.term);
            return false;
        }
        if state.role != RaftRole::Candidate || state.term != election_term || !response.granted {
            return false;
        }
        if !state.applied.members.contains(&response.voter) {
            return false;
        }
        state.votes.insert(response.voter.clone());
        if state.votes.len() >= self.majority(&state) {
            self.become_leader(&mut state);
            return true;
        }
        false
    }

    fn become_leader(&self, state: &mut RaftState) {
        state.role = RaftRole::Leader;
        state.leader = Some(self.id.clone());
        let next = state.log.last_index() + 1;
        let now = self.clock.now();
        let peers = self.peers_of(state);
        state.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        state.match_index = peers.iter().map(|p| (p.clone(), 0)).collect();
        state.last_ack = peers.iter().map(|p| (p.clone(), now)).collect();
        tracing::info!(node = %self.id, term = state.term, votes = state.votes.len(), "became leader");
        // No-op in the new term lets entries from earlier terms commit.
        let noop = LogEntry {
            term: state.term,
            index: next,
            proposal: ConsensusProposal::new(
                self.id.clone(),
                ProposalValue::Noop,
                state.term,
                next,
                ProposalPriority::Normal,
            ),
        };
        if state.log.push(noop.clone()).is_ok() {
            self.persist_entries(std::slice::from_ref(&noop));
        }
        self.advance_commit(state);
    }

    pub fn handle_request_vote(&self, request: &RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.lock();
        let reject = |state: &RaftState, reason| RequestVoteResponse {
            term: state.term,
            voter: self.id.clone(),
            granted: false,
            reject: Some(reason),
        };
        if request.term < state.term {
            return reject(&*state, VoteRejectReason::StaleTerm);
        }
        if request.term > state.term {
            self.step_down(&mut state, request.term);
        }
        if !state.applied.members.contains(&request.candidate) {
            return reject(&*state, VoteRejectReason::NotMember);
        }
        if let Some(voted) = &state.voted_for {
            if voted != &request.candidate {
                let for_node = voted.clone();
                return reject(&*state, VoteRejectReason::AlreadyVoted { for_node });
            }
        }
        if !state.log.is_up_to_date(request.last_log_term, request.last_log_index) {
            return reject(&*state, VoteRejectReason::LogBehind);
        }
        state.voted_for = Some(request.candidate.clone());
        if !self.persist_hard_state(&state) {
            state.voted_for = None;
            return reject(&*state, VoteRejectReason::Storage);
        }
        self.reset_election_timer(&mut state);
        tracing::debug!(node = %self.id, term = state.term, candidate = %request.candidate, "vote granted");
        RequestVoteResponse {
            term: state.term,
            voter: self.id.clone(),
            granted: true,
            reject: None,
        }
    }

    pub fn handle_append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock();
        let reject = |state: &RaftState, reason| AppendEntriesResponse {
            term: state.term,
            follower: self.id.clone(),
            success: false,
            match_index: 0,
            reject: Some(reason),
            truncated: 0,
        };
        if request.term < state.term {
            return reject(&*state, AppendRejectReason::StaleTerm);
        }
        if request.term > state.term || state.role != RaftRole::Follower {
            self.step_down(&mut state, request.term);
        }
        if let Some(known) = &state.leader {
            if known != &request.leader {
                let leader = known.clone();
                return reject(&*state, AppendRejectReason::ConflictingLeader { leader });
            }
        }
        state.leader = Some(request.leader.clone());
        self.reset_election_timer(&mut state);

        let commit_index = state.commit_index;
        let summary = match state.log.append_from_leader(
            request.prev_log_index,
            request.prev_log_term,
            &request.entries,
            commit_index,
        ) {
            Ok(summary) => summary,
            Err(LogError::MissingPredecessor { last_index, .. }) => {
                return reject(&*state, AppendRejectReason::MissingPredecessor { last_index })
            }
            Err(LogError::TermMismatch { conflict_index, .. }) => {
                return reject(&*state, AppendRejectReason::TermMismatch { conflict_index })
            }
            Err(LogError::CommittedConflict { commit_index, .. }) => {
                tracing::error!(
                    node = %self.id,
                    leader = %request.leader,
                    term = request.term,
                    "append would overwrite committed entries"
                );
                return reject(&*state, AppendRejectReason::CommittedConflict { commit_index });
            }
            Err(LogError::NonContiguous { last_index, .. }) => {
                return reject(&*state, AppendRejectReason::MissingPredecessor { last_index })
            }
        };
        if let Some(from) = summary.truncated_from {
            tracing::info!(
                node = %self.id,
                from,
                dropped = summary.truncated,
                "truncated uncommitted entries conflicting with leader"
            );
            if let Err(err) = self.storage.truncate_from(from) {
                tracing::error!(node = %self.id, error = %err, "persist truncation failed");
                if let Some(first) = summary.appended.first() {
                    state.log.truncate_from(first.index);
                }
                return reject(&*state, AppendRejectReason::Storage);
            }
        }
        if let Some(first) = summary.appended.first() {
            if !self.persist_entries(&summary.appended) {
                state.log.truncate_from(first.index);
                return reject(&*state, AppendRejectReason::Storage);
            }
        }
        if request.leader_commit > state.commit_index {
            state.commit_index = request.leader_commit.min(summary.match_index);
            self.apply_committed(&mut state);
        }
        AppendEntriesResponse {
            term: state.term,
            follower: self.id.clone(),
            success: true,
            match_index: summary.match_index,
            reject: None,
            truncated: summary.truncated,
        }
    }

    /// Leader only: the next AppendEntries for each peer.
    pub fn build_appends(&self) -> Option<(u64, Vec<(NodeId, AppendEntriesRequest)>)> {
        let state = self.state.lock();
        if state.role != RaftRole::Leader {
            return None;
        }
        let requests = self
            .peers_of(&state)
            .into_iter()
            .map(|peer| {
                let request = self.append_for(&state, &peer);
                (peer, request)
            })
            .collect();
        Some((state.term, requests))
    }

    /// Leader only: AppendEntries for one peer starting at its `next_index`.
    pub fn build_append_for(&self, peer: &NodeId) -> Option<AppendEntriesRequest> {
        let state = self.state.lock();
        if state.role != RaftRole::Leader {
            return None;
        }
        Some(self.append_for(&state, peer))
    }

    /// Leader only: AppendEntries carrying exactly the entry at `index`.
    pub fn build_append_at(&self, index: u64) -> Option<AppendEntriesRequest> {
        let state = self.state.lock();
        if state.role != RaftRole::Leader {
            return None;
        }
        let entry = state.log.entry(index)?.clone();
        let prev = index - 1;
        Some(AppendEntriesRequest {
            term: state.term,
            leader: self.id.clone(),
            prev_log_index: prev,
            prev_log_term: state.log.term_at(prev).unwrap_or(0),
            entries: vec![entry],
            leader_commit: state.commit_index,
        })
    }

    fn append_for(&self, state: &RaftState, peer: &NodeId) -> AppendEntriesRequest {
        let last = state.log.last_index();
        let next = state
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev = next - 1;
        AppendEntriesRequest {
            term: state.term,
            leader: self.id.clone(),
            prev_log_index: prev,
            prev_log_term: state.log.term_at(prev).unwrap_or(0),
            entries: state.log.entries_from(next, self.config.max_entries_per_append),
            leader_commit: state.commit_index,
        }
    }

    pub fn on_append_response(
        &self,
        sent_term: u64,
        request: &AppendEntriesRequest,
        response: &AppendEntriesResponse,
    ) -> AppendFeedback {
        let mut state = self.state.lock();
        if response.term > state.term {
            self.step_down(&mut state, response.term);
            return AppendFeedback::SteppedDown {
                term: response.term,
            };
        }
        if state.role != RaftRole::Leader || state.term != sent_term {
            return AppendFeedback::Ignored;
        }
        let peer = response.follower.clone();
        let now = self.clock.now();
        state.last_ack.insert(peer.clone(), now);
        if response.success {
            let matched = state.match_index.entry(peer.clone()).or_insert(0);
            *matched = (*matched).max(response.match_index);
            let matched = *matched;
            state.next_index.insert(peer, matched + 1);
            self.advance_commit(&mut state);
            return AppendFeedback::Accepted {
                match_index: matched,
            };
        }
        let current_next = state
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(request.prev_log_index + 1);
        let backed_off = match &response.reject {
            Some(AppendRejectReason::MissingPredecessor { last_index }) => {
                (last_index + 1).min(request.prev_log_index)
            }
            Some(AppendRejectReason::TermMismatch { conflict_index }) => {
                (*conflict_index).min(request.prev_log_index)
            }
            Some(AppendRejectReason::Storage) => current_next,
            _ => request.prev_log_index,
        };
        let next_index = backed_off.min(current_next).max(1);
        state.next_index.insert(peer, next_index);
        AppendFeedback::Rejected { next_index }
    }

    /// Commit the highest current-term index replicated on a majority.
    fn advance_commit(&self, state: &mut RaftState) {
        if state.role != RaftRole::Leader {
            return;
        }
        let majority = self.majority(state);
        let self_votes = usize::from(state.applied.members.contains(&self.id));
        let mut candidate = state.log.last_index();
        while candidate > state.commit_index {
            if state.log.term_at(candidate) == Some(state.term) {
                let replicated = self_votes
                    + state
                        .match_index
                        .iter()
                        .filter(|(peer, matched)| **matched >= candidate && state.applied.members.contains(*peer))
                        .count();
                if replicated >= majority {
                    state.commit_index = candidate;
                    break;
                }
            } else {
                break;
            }
            candidate -= 1;
        }
        self.apply_committed(state);
    }

    fn apply_committed(&self, state: &mut RaftState) {
        while state.applied.last_applied < state.commit_index {
            let index = state.applied.last_applied + 1;
            let Some(entry) = state.log.entry(index).cloned() else {
                break;
            };
            let membership_before = state.applied.members.clone();
            if !state.applied.apply(&entry) {
                break;
            }
            if state.applied.members != membership_before {
                self.on_membership_applied(state, &membership_before);
            }
            let _ = self.apply_tx.send(ApplyEvent {
                term: entry.term,
                index: entry.index,
                proposal_id: entry.proposal.id,
                value: entry.proposal.value.clone(),
            });
        }
    }

    fn on_membership_applied(&self, state: &mut RaftState, before: &BTreeSet<NodeId>) {
        let now = self.clock.now();
        let next = state.log.last_index() + 1;
        let members = state.applied.members.clone();
        for added in members.difference(before) {
            if added != &self.id {
                state.next_index.entry(added.clone()).or_insert(next);
                state.match_index.entry(added.clone()).or_insert(0);
                state.last_ack.entry(added.clone()).or_insert(now);
            }
        }
        for removed in before.difference(&members) {
            state.next_index.remove(removed);
            state.match_index.remove(removed);
            state.last_ack.remove(removed);
        }
        tracing::info!(node = %self.id, members = members.len(), "membership applied");
        if state.role == RaftRole::Leader && !members.contains(&self.id) {
            tracing::info!(node = %self.id, "removed from membership, relinquishing leadership");
            state.role = RaftRole::Follower;
            state.leader = None;
        }
    }

    /// Append a client proposal. Only the leader accepts.
    pub fn append_proposal(
        &self,
        value: ProposalValue,
        priority: ProposalPriority,
    ) -> Result<ConsensusProposal, ConsensusError> {
        let mut state = self.state.lock();
        if state.role != RaftRole::Leader {
            return Err(ConsensusError::NotLeader {
                leader: state.leader.clone(),
            });
        }
        let index = state.log.last_index() + 1;
        let proposal = ConsensusProposal::new(self.id.clone(), value, state.term, index, priority);
        let entry = LogEntry {
            term: state.term,
            index,
            proposal: proposal.clone(),
        };
        self.storage
            .append(std::slice::from_ref(&entry))
            .map_err(|e| ConsensusError::Storage(e.to_string()))?;
        if let Err(err) = state.log.push(entry) {
            if let Err(undo) = self.storage.truncate_from(index) {
                tracing::error!(node = %self.id, index, error = %undo, "rollback of persisted entry failed");
            }
            return Err(err.into());
        }
        self.advance_commit(&mut state);
        Ok(proposal)
    }

    /// Leader that has not heard from a majority within the maximum election timeout steps down.
    pub fn check_quorum(&self) -> bool {
        let mut state = self.state.lock();
        if state.role != RaftRole::Leader {
            return false;
        }
        let now = self.clock.now();
        let window = self.config.election_timeout_range().1;
        let peers = self.peers_of(&state);
        let recent = peers
            .iter()
            .filter(|p| {
                state
                    .last_ack
                    .get(*p)
                    .map_or(false, |at| now.saturating_duration_since(*at) <= window)
            })
            .count();
        let self_votes = usize::from(state.applied.members.contains(&self.id));
        if recent + self_votes >= self.majority(&state) {
            return false;
        }
        tracing::warn!(
            node = %self.id,
            term = state.term,
            reachable = recent,
            "leader lost contact with majority"
        );
        state.role = RaftRole::Follower;
        state.leader = None;
        self.reset_election_timer(&mut state);
        true
    }
}

fn random_timeout(rng: &mut StdRng, config: &ConsensusConfig) -> Duration {
    let (min, max) = config.election_timeout_range();
    let (min, max) = (min.as_millis() as u64, max.as_millis() as u64);
    if max <= min {
        return Duration::from_millis(min);
    }
    Duration::from_millis(rng.gen_range(min..max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLog;
    use crate::time::ManualClock;

    fn config() -> ConsensusConfig {
        ConsensusConfig {
            election_seed: Some(7),
            ..ConsensusConfig::default()
        }
    }

    fn members() -> Vec<NodeId> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    fn core(id: &str, clock: &ManualClock) -> RaftCore<ManualClock> {
        RaftCore::new(id.into(), members(), clock.clone(), config(), Arc::new(MemoryLog::new())).unwrap()
    }

    fn elect(leader: &RaftCore<ManualClock>, voter: &RaftCore<ManualClock>) {
        let candidacy = leader.begin_election().unwrap();
        let resp = voter.handle_request_vote(&candidacy.request);
        assert!(leader.on_vote_response(candidacy.term, &resp));
    }

    #[test]
    fn one_vote_per_term() {
        let clock = ManualClock::new();
        let (a, b, c) = (core("a", &clock), core("b", &clock), core("c", &clock));
        let ca = a.begin_election().unwrap();
        let cb = b.begin_election().unwrap();
        assert_eq!(ca.term, cb.term);
        assert!(c.handle_request_vote(&ca.request).granted);
        let second = c.handle_request_vote(&cb.request);
        assert!(!second.granted);
        assert!(matches!(second.reject, Some(VoteRejectReason::AlreadyVoted { .. })));
    }

    #[test]
    fn stale_candidate_log_is_refused() {
        let clock = ManualClock::new();
        let (a, b, c) = (core("a", &clock), core("b", &clock), core("c", &clock));
        elect(&a, &b);
        let (term, appends) = a.build_appends().unwrap();
        for (peer, req) in appends {
            if peer.as_str() == "b" {
                let resp = b.handle_append_entries(&req);
                a.on_append_response(term, &req, &resp);
            }
        }
        // c never saw the no-op; b will not vote for it.
        let cc = c.begin_election().unwrap();
        let cc = if cc.term <= b.term() { c.begin_election().unwrap() } else { cc };
        let resp = b.handle_request_vote(&cc.request);
        assert!(!resp.granted);
        assert_eq!(resp.reject, Some(VoteRejectReason::LogBehind));
    }

    #[test]
    fn leader_commits_only_with_majority() {
        let clock = ManualClock::new();
        let (a, b) = (core("a", &clock), core("b", &clock));
        elect(&a, &b);
        let proposal = a
            .append_proposal(
                ProposalValue::ConfigChange {
                    key: "k".into(),
                    value: "v".into(),
                },
                ProposalPriority::Normal,
            )
            .unwrap();
        assert_eq!(a.commit_index(), 0);
        let (term, appends) = a.build_appends().unwrap();
        for (peer, req) in appends {
            if peer.as_str() == "b" {
                let resp = b.handle_append_entries(&req);
                assert!(resp.success);
                a.on_append_response(term, &req, &resp);
            }
        }
        assert_eq!(a.commit_index(), proposal.index);
        assert_eq!(a.applied().config.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn follower_rejects_proposals_with_leader_hint() {
        let clock = ManualClock::new();
        let (a, b) = (core("a", &clock), core("b", &clock));
        elect(&a, &b);
        let (_, appends) = a.build_appends().unwrap();
        for (peer, req) in appends {
            if peer.as_str() == "b" {
                b.handle_append_entries(&req);
            }
        }
        let err = b.append_proposal(ProposalValue::Noop, ProposalPriority::Low).unwrap_err();
        assert_eq!(err, ConsensusError::NotLeader { leader: Some("a".into()) });
    }

    #[test]
    fn higher_term_response_forces_step_down() {
        let clock = ManualClock::new();
        let (a, b) = (core("a", &clock), core("b", &clock));
        elect(&a, &b);
        let (term, appends) = a.build_appends().unwrap();
        let (_, req) = appends.into_iter().next().unwrap();
        let resp = AppendEntriesResponse {
            term: term + 3,
            follower: "c".into(),
            success: false,
            match_index: 0,
            reject: Some(AppendRejectReason::StaleTerm),
            truncated: 0,
        };
        assert_eq!(a.on_append_response(term, &req, &resp), AppendFeedback::SteppedDown { term: term + 3 });
        assert_eq!(a.role(), RaftRole::Follower);
        assert_eq!(a.term(), term + 3);
    }

    #[test]
    fn check_quorum_steps_down_isolated_leader() {
        let clock = ManualClock::new();
        let (a, b) = (core("a", &clock), core("b", &clock));
        elect(&a, &b);
        assert!(!a.check_quorum());
        clock.advance(Duration::from_secs(5));
        assert!(a.check_quorum());
        assert_eq!(a.role(), RaftRole::Follower);
    }

    #[test]
    fn restart_recovers_term_and_vote() {
        let clock = ManualClock::new();
        let storage = Arc::new(MemoryLog::new());
        let a = RaftCore::new("a".into(), members(), clock.clone(), config(), storage.clone()).unwrap();
        a.begin_election().unwrap();
        drop(a);
        let again = RaftCore::new("a".into(), members(), clock, config(), storage).unwrap();
        assert_eq!(again.term(), 1);
        assert_eq!(again.role(), RaftRole::Follower);
    }

    #[test]
    fn election_timer_is_randomized_within_band() {
        let clock = ManualClock::new();
        let a = core("a", &clock);
        let start = clock.now();
        let (min, max) = config().election_timeout_range();
        let deadline = a.election_deadline();
        assert!(deadline >= start + min && deadline < start + max);
        assert!(!a.election_due());
        clock.advance(max);
        assert!(a.election_due());
    }

    /// Wraps a `MemoryLog`; appends fail while `full` is set.
    #[derive(Default)]
    struct FullDisk {
        inner: MemoryLog,
        full: std::sync::atomic::AtomicBool,
    }

    impl FullDisk {
        fn fill(&self) {
            self.full.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl DurableLog for FullDisk {
        fn load(&self) -> Result<crate::storage::PersistedState> {
            self.inner.load()
        }

        fn save_hard_state(&self, term: u64, voted_for: Option<&NodeId>) -> Result<()> {
            self.inner.save_hard_state(term, voted_for)
        }

        fn append(&self, entries: &[LogEntry]) -> Result<()> {
            if self.full.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.append(entries)
        }

        fn truncate_from(&self, index: u64) -> Result<()> {
            self.inner.truncate_from(index)
        }
    }

    #[test]
    fn leader_keeps_no_entry_it_could_not_persist() {
        let clock = ManualClock::new();
        let disk = Arc::new(FullDisk::default());
        let a = RaftCore::new("a".into(), members(), clock.clone(), config(), disk.clone()).unwrap();
        let b = core("b", &clock);
        elect(&a, &b);
        let before = a.log_entries();
        disk.fill();
        let err = a
            .append_proposal(ProposalValue::Noop, ProposalPriority::Normal)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::Storage(_)));
        assert_eq!(a.log_entries(), before);
        assert_eq!(disk.load().unwrap().entries.len(), before.len());
    }

    #[test]
    fn follower_rejects_entries_it_could_not_persist() {
        let clock = ManualClock::new();
        let a = core("a", &clock);
        let disk = Arc::new(FullDisk::default());
        let b = RaftCore::new("b".into(), members(), clock.clone(), config(), disk.clone()).unwrap();
        elect(&a, &b);
        let proposal = a
            .append_proposal(
                ProposalValue::ConfigChange {
                    key: "k".into(),
                    value: "v".into(),
                },
                ProposalPriority::Normal,
            )
            .unwrap();
        disk.fill();
        let (term, appends) = a.build_appends().unwrap();
        let (_, req) = appends
            .into_iter()
            .find(|(peer, _)| peer.as_str() == "b")
            .unwrap();
        let before = b.log_entries();
        let resp = b.handle_append_entries(&req);
        assert!(!resp.success);
        assert_eq!(resp.reject, Some(AppendRejectReason::Storage));
        assert_eq!(b.log_entries(), before);
        assert!(matches!(a.on_append_response(term, &req, &resp), AppendFeedback::Rejected { .. }));
        assert!(a.commit_index() < proposal.index);
    }
}
