//! Network driver around [`RaftCore`]: elections, replication rounds, proposals, voting,
//! and partition recovery.

use super::node::{AppendFeedback, RaftCore};
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use super::{
    quorum, ConsensusError, ConsensusOutcome, ConsensusProposal, ConsensusResult, MembershipChange,
    ProposalPriority, ProposalValue, RaftRole, Vote, VoteDecision,
};
use crate::fault::Partition;
use crate::membership::NodeId;
use crate::replication::{Conflict, ConflictArbiter, ConflictError};
use crate::time::{unix_millis, Clock};
use crate::transport::{unexpected, Message, Transport, TransportError};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ElectionOutcome {
    pub term: u64,
    pub won: bool,
    pub votes_granted: usize,
    pub votes_needed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub enum TickOutcome {
    Idle,
    SteppedDown,
    Election(ElectionOutcome),
}

/// Outcome of one AppendEntries exchange within a round.
#[derive(Debug, Clone)]
pub enum PeerReply {
    Feedback { feedback: AppendFeedback, truncated: u64 },
    Unreachable(TransportError),
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub term: u64,
    pub replies: Vec<(NodeId, PeerReply)>,
}

impl RoundReport {
    /// Peers that answered, whatever they said.
    pub fn reached(&self) -> usize {
        self.replies
            .iter()
            .filter(|(_, r)| matches!(r, PeerReply::Feedback { .. }))
            .count()
    }

    pub fn stepped_down(&self) -> bool {
        self.replies.iter().any(|(_, r)| {
            matches!(
                r,
                PeerReply::Feedback {
                    feedback: AppendFeedback::SteppedDown { .. },
                    ..
                }
            )
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerRecovery {
    pub node: NodeId,
    pub converged: bool,
    pub match_index: u64,
    /// Uncommitted entries the peer dropped.
    pub truncated: u64,
    /// Entries shipped to bring it up to date.
    pub replayed: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionRecovery {
    pub term: u64,
    pub leader: Option<NodeId>,
    pub peers: Vec<PeerRecovery>,
}

impl PartitionRecovery {
    pub fn converged(&self) -> bool {
        self.peers.iter().all(|p| p.converged)
    }
}

pub struct ConsensusModule<C: Clock> {
    core: Arc<RaftCore<C>>,
    transport: Arc<dyn Transport>,
}

impl<C: Clock> Clone for ConsensusModule<C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl<C: Clock> std::fmt::Debug for ConsensusModule<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusModule")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> ConsensusModule<C> {
    pub fn new(core: Arc<RaftCore<C>>, transport: Arc<dyn Transport>) -> Self {
        Self { core, transport }
    }

    pub fn core(&self) -> &Arc<RaftCore<C>> {
        &self.core
    }

    pub fn id(&self) -> &NodeId {
        self.core.id()
    }

    pub fn role(&self) -> RaftRole {
        self.core.role()
    }

    pub fn term(&self) -> u64 {
        self.core.term()
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.core.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    pub async fn start_election(&self) -> ElectionOutcome {
        let votes_needed = quorum(self.core.members().len().max(1));
        let Some(candidacy) = self.core.begin_election() else {
            return ElectionOutcome {
                term: self.core.term(),
                won: false,
                votes_granted: 0,
                votes_needed,
            };
        };
        let timeout = self.core.config().rpc_timeout();
        let calls = candidacy.peers.iter().map(|peer| {
            self.transport.call(
                self.id(),
                peer,
                Message::RequestVote(candidacy.request.clone()),
                timeout,
            )
        });
        let mut votes_granted = 1;
        for reply in join_all(calls).await {
            match reply {
                Ok(Message::RequestVoteResponse(response)) => {
                    if response.granted && response.term == candidacy.term {
                        votes_granted += 1;
                    }
                    self.core.on_vote_response(candidacy.term, &response);
                }
                Ok(other) => {
                    tracing::debug!(error = %unexpected("request_vote_response", &other), "vote reply dropped");
                }
                Err(err) => tracing::debug!(node = %self.id(), error = %err, "vote request failed"),
            }
        }
        let won = self.core.is_leader() && self.core.term() == candidacy.term;
        if won {
            // Announce leadership and replicate the no-op straight away.
            self.replicate_round().await;
        }
        ElectionOutcome {
            term: candidacy.term,
            won,
            votes_granted,
            votes_needed,
        }
    }

    async fn exchange(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> (NodeId, AppendEntriesRequest, Result<AppendEntriesResponse, TransportError>) {
        let reply = self
            .transport
            .call(
                self.id(),
                &peer,
                Message::AppendEntries(request.clone()),
                self.core.config().rpc_timeout(),
            )
            .await;
        let reply = match reply {
            Ok(Message::AppendEntriesResponse(response)) => Ok(response),
            Ok(other) => Err(unexpected("append_entries_response", &other)),
            Err(err) => Err(err),
        };
        (peer, request, reply)
    }

    /// One AppendEntries to every peer. `None` unless this node leads.
    pub async fn replicate_round(&self) -> Option<RoundReport> {
        let (term, requests) = self.core.build_appends()?;
        let exchanges = requests
            .into_iter()
            .map(|(peer, request)| self.exchange(peer, request));
        let mut replies = Vec::new();
        for (peer, request, reply) in join_all(exchanges).await {
            let reply = match reply {
                Ok(response) => PeerReply::Feedback {
                    feedback: self.core.on_append_response(term, &request, &response),
                    truncated: response.truncated,
                },
                Err(err) => PeerReply::Unreachable(err),
            };
            replies.push((peer, reply));
        }
        Some(RoundReport { term, replies })
    }

    /// Leader heartbeat; doubles as a replication round.
    pub async fn send_heartbeats(&self) -> Option<RoundReport> {
        self.replicate_round().await
    }

    /// Timer step: check-quorum for leaders, election timeout for everyone else.
    pub async fn tick(&self) -> TickOutcome {
        if self.core.check_quorum() {
            return TickOutcome::SteppedDown;
        }
        if self.core.election_due() {
            return TickOutcome::Election(self.start_election().await);
        }
        TickOutcome::Idle
    }

    pub fn propose(
        &self,
        value: ProposalValue,
        priority: ProposalPriority,
    ) -> Result<ConsensusProposal, ConsensusError> {
        let proposal = self.core.append_proposal(value, priority)?;
        tracing::debug!(
            node = %self.id(),
            term = proposal.term,
            index = proposal.index,
            "proposal appended"
        );
        Ok(proposal)
    }

    /// Ask `voter` to accept `proposal`. A voter accepts when the proposal's term is current
    /// for it, it recognises no other leader in that term, and it holds the entry's predecessor.
    pub async fn vote(&self, proposal: &ConsensusProposal, voter: &NodeId) -> Vote {
        let decided = |decision, term| Vote {
            voter: voter.clone(),
            proposal_id: proposal.id,
            decision,
            term,
            timestamp_ms: unix_millis(),
        };
        let holds_entry = self
            .core
            .entry(proposal.index)
            .map_or(false, |e| e.proposal.id == proposal.id && e.term == proposal.term);
        if voter == self.id() {
            let accept = holds_entry && self.core.term() == proposal.term;
            let decision = if accept { VoteDecision::Accept } else { VoteDecision::Reject };
            return decided(decision, self.core.term());
        }
        let request = match self.core.build_append_at(proposal.index) {
            Some(request) if holds_entry && request.term == proposal.term => request,
            _ => return decided(VoteDecision::Reject, self.core.term()),
        };
        let (_, request, reply) = self.exchange(voter.clone(), request).await;
        match reply {
            Ok(response) => {
                let term = response.term;
                let decision = match self.core.on_append_response(request.term, &request, &response) {
                    AppendFeedback::Accepted { match_index } if match_index >= proposal.index => {
                        VoteDecision::Accept
                    }
                    AppendFeedback::Accepted { .. } | AppendFeedback::Ignored => VoteDecision::Abstain,
                    AppendFeedback::Rejected { .. } | AppendFeedback::SteppedDown { .. } => {
                        VoteDecision::Reject
                    }
                };
                decided(decision, term)
            }
            Err(_) => decided(VoteDecision::Abstain, self.core.term()),
        }
    }

    fn commit_status(&self, proposal: &ConsensusProposal) -> Option<ConsensusOutcome> {
        if self.core.commit_index() >= proposal.index {
            return match self.core.entry(proposal.index) {
                Some(entry) if entry.proposal.id == proposal.id => Some(ConsensusOutcome::Committed),
                _ => Some(ConsensusOutcome::TermConflict),
            };
        }
        if self.core.term() != proposal.term || !self.core.is_leader() {
            return Some(ConsensusOutcome::TermConflict);
        }
        None
    }

    fn votes_from(&self, proposal: &ConsensusProposal, report: &RoundReport) -> Vec<Vote> {
        let now = unix_millis();
        let mut votes = vec![Vote {
            voter: self.id().clone(),
            proposal_id: proposal.id,
            decision: VoteDecision::Accept,
            term: report.term,
            timestamp_ms: now,
        }];
        for (peer, reply) in &report.replies {
            let decision = match reply {
                PeerReply::Feedback {
                    feedback: AppendFeedback::Accepted { match_index },
                    ..
                } if *match_index >= proposal.index => VoteDecision::Accept,
                PeerReply::Feedback {
                    feedback: AppendFeedback::Rejected { .. } | AppendFeedback::SteppedDown { .. },
                    ..
                } => VoteDecision::Reject,
                _ => VoteDecision::Abstain,
            };
            votes.push(Vote {
                voter: peer.clone(),
                proposal_id: proposal.id,
                decision,
                term: report.term,
                timestamp_ms: now,
            });
        }
        votes
    }

    /// Drive replication rounds until `proposal` commits, the term moves on, or the round
    /// deadline passes. Needs a strict majority of members.
    pub async fn achieve_consensus(&self, proposal: &ConsensusProposal) -> ConsensusResult {
        let config = self.core.config();
        let deadline = tokio::time::Instant::now() + config.round_timeout();
        let mut rounds = 0u32;
        let mut votes = Vec::new();
        let mut last_reached = 0usize;
        let outcome = loop {
            rounds += 1;
            if let Some(report) = self.replicate_round().await {
                last_reached = report.reached();
                votes = self.votes_from(proposal, &report);
            }
            if let Some(outcome) = self.commit_status(proposal) {
                break outcome;
            }
            if tokio::time::Instant::now() >= deadline {
                let members = self.core.members().len().max(1);
                break if last_reached + 1 < quorum(members) {
                    ConsensusOutcome::Partitioned
                } else {
                    ConsensusOutcome::Timeout
                };
            }
            tokio::time::sleep(config.round_backoff()).await;
        };
        let committed = outcome == ConsensusOutcome::Committed;
        if committed {
            tracing::debug!(index = proposal.index, term = proposal.term, rounds, "proposal committed");
        } else {
            tracing::warn!(
                index = proposal.index,
                term = proposal.term,
                rounds,
                ?outcome,
                "proposal not committed"
            );
        }
        ConsensusResult {
            proposal_id: proposal.id,
            outcome,
            agreed_value: committed.then(|| proposal.value.clone()),
            term: proposal.term,
            index: proposal.index,
            rounds,
            votes,
        }
    }

    /// Propose adding `node` to the voting set and wait for it to commit.
    pub async fn add_member(&self, node: &NodeId) -> Result<ConsensusResult, ConsensusError> {
        let proposal = self.propose(
            ProposalValue::MembershipChange(MembershipChange::Add(node.clone())),
            ProposalPriority::High,
        )?;
        Ok(self.achieve_consensus(&proposal).await)
    }

    /// Propose removing `node` from the voting set and wait for it to commit.
    pub async fn remove_member(&self, node: &NodeId) -> Result<ConsensusResult, ConsensusError> {
        let proposal = self.propose(
            ProposalValue::MembershipChange(MembershipChange::Remove(node.clone())),
            ProposalPriority::High,
        )?;
        Ok(self.achieve_consensus(&proposal).await)
    }

    /// Bring rejoining nodes back in line with the leader's log: back up `next_index` until
    /// the logs match, let the follower drop its conflicting uncommitted suffix, then replay.
    pub async fn handle_partition(&self, partitions: &[Partition]) -> PartitionRecovery {
        let term = self.core.term();
        if !self.core.is_leader() {
            return PartitionRecovery {
                term,
                leader: self.core.leader(),
                peers: Vec::new(),
            };
        }
        let members = self.core.members();
        let rejoining: BTreeSet<NodeId> = partitions
            .iter()
            .flat_map(|p| p.unreachable.iter().cloned())
            .filter(|n| n != self.id() && members.contains(n))
            .collect();
        let mut peers = Vec::new();
        'peers: for node in rejoining {
            let mut recovery = PeerRecovery {
                node: node.clone(),
                converged: false,
                match_index: 0,
                truncated: 0,
                replayed: 0,
                attempts: 0,
            };
            let max_attempts = self.core.last_log_index() as u32 + 2;
            while recovery.attempts < max_attempts {
                let Some(request) = self.core.build_append_for(&node) else {
                    peers.push(recovery);
                    break 'peers;
                };
                recovery.attempts += 1;
                let shipped = request.entries.len() as u64;
                let (_, request, reply) = self.exchange(node.clone(), request).await;
                let Ok(response) = reply else {
                    break;
                };
                recovery.truncated += response.truncated;
                match self.core.on_append_response(request.term, &request, &response) {
                    AppendFeedback::Accepted { match_index } => {
                        recovery.replayed += shipped;
                        recovery.match_index = match_index;
                        if match_index >= self.core.last_log_index() {
                            recovery.converged = true;
                            break;
                        }
                    }
                    AppendFeedback::Rejected { .. } => {}
                    AppendFeedback::SteppedDown { .. } | AppendFeedback::Ignored => {
                        peers.push(recovery);
                        break 'peers;
                    }
                }
            }
            tracing::info!(
                node = %recovery.node,
                converged = recovery.converged,
                truncated = recovery.truncated,
                replayed = recovery.replayed,
                "partition recovery"
            );
            peers.push(recovery);
        }
        // Spread the commit index to the nodes that just caught up.
        self.replicate_round().await;
        PartitionRecovery {
            term: self.core.term(),
            leader: self.core.leader(),
            peers,
        }
    }
}

impl<C: Clock> ConflictArbiter for ConsensusModule<C> {
    /// The copy held by the most replicas wins (newest on a tie), and only once the cluster
    /// has committed the choice.
    fn arbitrate<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, Result<usize, ConflictError>> {
        Box::pin(async move {
            let mut holders: HashMap<u64, usize> = HashMap::new();
            for candidate in conflict.candidates.iter().filter(|c| c.is_valid()) {
                *holders.entry(candidate.item.metadata.checksum).or_default() += 1;
            }
            let (idx, chosen) = conflict
                .candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_valid())
                .max_by_key(|(_, c)| {
                    let m = &c.item.metadata;
                    (holders.get(&m.checksum).copied().unwrap_or(0), m.version, m.checksum)
                })
                .ok_or_else(|| ConflictError::NoValidCandidate(conflict.item_id.clone()))?;
            let value = ProposalValue::DataCommit {
                item_id: conflict.item_id.clone(),
                version: conflict.max_version() + 1,
                checksum: chosen.item.metadata.checksum,
            };
            let proposal = self
                .propose(value, ProposalPriority::High)
                .map_err(|e| ConflictError::Arbiter(e.to_string()))?;
            let result = self.achieve_consensus(&proposal).await;
            if result.is_committed() {
                Ok(idx)
            } else {
                Err(ConflictError::Arbiter(format!(
                    "resolution for {} not committed: {:?}",
                    conflict.item_id, result.outcome
                )))
            }
        })
    }
}
