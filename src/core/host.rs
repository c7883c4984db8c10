use crate::consensus::RaftCore;
use crate::membership::NodeId;
use crate::replication::ReplicaStore;
use crate::time::Clock;
use crate::transport::{HeartbeatAck, Message, MessageHandler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receiving side of one node: routes consensus RPCs to its Raft state, replica traffic to
/// its store, and answers heartbeats with its current load.
pub struct NodeHost<C: Clock> {
    id: NodeId,
    raft: Arc<RaftCore<C>>,
    store: Arc<ReplicaStore<C>>,
    load_bits: AtomicU64,
}

impl<C: Clock> std::fmt::Debug for NodeHost<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHost")
            .field("id", &self.id)
            .field("items", &self.store.len())
            .field("load", &self.load_factor())
            .finish()
    }
}

impl<C: Clock> NodeHost<C> {
    pub fn new(raft: Arc<RaftCore<C>>, store: Arc<ReplicaStore<C>>) -> Self {
        Self {
            id: raft.id().clone(),
            raft,
            store,
            load_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn raft(&self) -> &Arc<RaftCore<C>> {
        &self.raft
    }

    pub fn store(&self) -> &Arc<ReplicaStore<C>> {
        &self.store
    }

    pub fn load_factor(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    /// Load reported in heartbeat acks; non-finite or negative values read as zero.
    pub fn set_load_factor(&self, load: f64) {
        let load = if load.is_finite() { load.max(0.0) } else { 0.0 };
        self.load_bits.store(load.to_bits(), Ordering::Relaxed);
    }
}

impl<C: Clock> MessageHandler for NodeHost<C> {
    fn handle(&self, from: &NodeId, message: Message) -> Message {
        match message {
            Message::RequestVote(request) => {
                Message::RequestVoteResponse(self.raft.handle_request_vote(&request))
            }
            Message::AppendEntries(request) => {
                Message::AppendEntriesResponse(self.raft.handle_append_entries(&request))
            }
            Message::ReplicaWrite(write) => Message::ReplicaWriteAck(self.store.handle_write(write)),
            Message::ReplicaRead(read) => Message::ReplicaReadResponse(self.store.handle_read(&read)),
            Message::Heartbeat(heartbeat) => Message::HeartbeatAck(HeartbeatAck {
                sequence: heartbeat.sequence,
                load_factor: self.load_factor(),
            }),
            other => {
                tracing::debug!(node = %self.id, from = %from, kind = other.kind(), "unsupported message");
                Message::Unsupported(other.kind().to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::storage::MemoryLog;
    use crate::time::SystemClock;
    use crate::transport::Heartbeat;

    fn host() -> NodeHost<SystemClock> {
        let raft = RaftCore::new(
            "a".into(),
            vec!["a".into(), "b".into()],
            SystemClock,
            ConsensusConfig::default(),
            Arc::new(MemoryLog::new()),
        )
        .unwrap();
        NodeHost::new(Arc::new(raft), Arc::new(ReplicaStore::new("a".into(), SystemClock)))
    }

    #[test]
    fn heartbeat_ack_carries_load() {
        let host = host();
        host.set_load_factor(0.75);
        match host.handle(&"b".into(), Message::Heartbeat(Heartbeat { sequence: 9 })) {
            Message::HeartbeatAck(ack) => {
                assert_eq!(ack.sequence, 9);
                assert!((ack.load_factor - 0.75).abs() < f64::EPSILON);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn responses_are_not_handled_as_requests() {
        let host = host();
        host.set_load_factor(f64::NAN);
        assert_eq!(host.load_factor(), 0.0);
        let reply = host.handle(
            &"b".into(),
            Message::HeartbeatAck(HeartbeatAck {
                sequence: 1,
                load_factor: 0.0,
            }),
        );
        assert!(matches!(reply, Message::Unsupported(kind) if kind == "heartbeat_ack"));
    }
}
