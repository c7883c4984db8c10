//! Node-to-node messaging.
//!
//! The coordination core only talks to peers through [`Transport`]; each node answers
//! through a [`MessageHandler`]. `memory` provides an in-process network with fault
//! injection used by the simulator and tests.

pub mod memory;

pub use memory::MemoryNetwork;

use crate::consensus::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::membership::NodeId;
use crate::replication::store::{
    ReplicaRead, ReplicaReadResponse, ReplicaWrite, ReplicaWriteAck,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub type PinFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Liveness probe sent by the fault-tolerance loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub sequence: u64,
    pub load_factor: f64,
}

/// Wire envelope for every node-to-node exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    ReplicaWrite(ReplicaWrite),
    ReplicaWriteAck(ReplicaWriteAck),
    ReplicaRead(ReplicaRead),
    ReplicaReadResponse(ReplicaReadResponse),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    /// Receiver could not interpret the request.
    Unsupported(String),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "request_vote",
            Message::RequestVoteResponse(_) => "request_vote_response",
            Message::AppendEntries(_) => "append_entries",
            Message::AppendEntriesResponse(_) => "append_entries_response",
            Message::ReplicaWrite(_) => "replica_write",
            Message::ReplicaWriteAck(_) => "replica_write_ack",
            Message::ReplicaRead(_) => "replica_read",
            Message::ReplicaReadResponse(_) => "replica_read_response",
            Message::Heartbeat(_) => "heartbeat",
            Message::HeartbeatAck(_) => "heartbeat_ack",
            Message::Unsupported(_) => "unsupported",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Codec(format!("encode {}: {e}", self.kind())))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(format!("decode message: {e}")))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {to} unreachable from {from}")]
    Unreachable { from: NodeId, to: NodeId },
    #[error("request to {to} timed out after {after_ms}ms")]
    Timeout { to: NodeId, after_ms: u64 },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
}

impl TransportError {
    /// Timeouts may clear on their own; refusals point at a dead process.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Receiving side of a node. Handlers mutate only the receiving node's own state.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, from: &NodeId, message: Message) -> Message;
}

/// Request/response messaging between nodes.
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        from: &NodeId,
        to: &NodeId,
        message: Message,
        timeout: Duration,
    ) -> PinFuture<Result<Message, TransportError>>;
}

pub(crate) fn unexpected(expected: &'static str, got: &Message) -> TransportError {
    TransportError::UnexpectedResponse {
        expected,
        got: got.kind(),
    }
}
