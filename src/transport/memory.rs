use super::{Message, MessageHandler, PinFuture, Transport, TransportError};
use crate::membership::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-process network. Every exchange is round-tripped through the wire codec so
/// nodes never share state except through delivered messages.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    handlers: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    crashed: RwLock<HashMap<NodeId, Arc<dyn MessageHandler>>>,
    groups: RwLock<Option<Vec<HashSet<NodeId>>>>,
    cut_links: RwLock<HashSet<(NodeId, NodeId)>>,
    latency: RwLock<HashMap<NodeId, Duration>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.inner.handlers.read().len())
            .field("crashed", &self.inner.crashed.read().len())
            .field("delivered", &self.delivered())
            .finish_non_exhaustive()
    }
}

/// How a request fails to get through.
enum Blocked {
    Refused,
    Silent,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: NodeId, handler: Arc<dyn MessageHandler>) {
        self.inner.crashed.write().remove(&id);
        self.inner.handlers.write().insert(id, handler);
    }

    pub fn unregister(&self, id: &NodeId) {
        self.inner.handlers.write().remove(id);
        self.inner.crashed.write().remove(id);
    }

    /// Stop delivering to `id`; its handler is kept so `restart` can bring it back.
    pub fn crash(&self, id: &NodeId) -> bool {
        let handler = self.inner.handlers.write().remove(id);
        match handler {
            Some(handler) => {
                tracing::info!(node = %id, "memory network: node crashed");
                self.inner.crashed.write().insert(id.clone(), handler);
                true
            }
            None => false,
        }
    }

    pub fn restart(&self, id: &NodeId) -> bool {
        let handler = self.inner.crashed.write().remove(id);
        match handler {
            Some(handler) => {
                tracing::info!(node = %id, "memory network: node restarted");
                self.inner.handlers.write().insert(id.clone(), handler);
                true
            }
            None => false,
        }
    }

    pub fn is_crashed(&self, id: &NodeId) -> bool {
        self.inner.crashed.read().contains_key(id)
    }

    /// Split the network; nodes only reach peers inside their own group.
    /// Nodes not named in any group are isolated.
    pub fn partition(&self, groups: &[Vec<NodeId>]) {
        let sets = groups
            .iter()
            .map(|g| g.iter().cloned().collect::<HashSet<_>>())
            .collect();
        *self.inner.groups.write() = Some(sets);
    }

    pub fn heal(&self) {
        *self.inner.groups.write() = None;
        self.inner.cut_links.write().clear();
    }

    pub fn cut_link(&self, a: &NodeId, b: &NodeId) {
        let mut links = self.inner.cut_links.write();
        links.insert((a.clone(), b.clone()));
        links.insert((b.clone(), a.clone()));
    }

    pub fn set_latency(&self, id: &NodeId, latency: Duration) {
        self.inner.latency.write().insert(id.clone(), latency);
    }

    pub fn clear_latency(&self, id: &NodeId) {
        self.inner.latency.write().remove(id);
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        self.blocked(from, to).is_none()
    }

    fn blocked(&self, from: &NodeId, to: &NodeId) -> Option<Blocked> {
        if self.inner.crashed.read().contains_key(from) || !self.inner.handlers.read().contains_key(to) {
            return Some(Blocked::Refused);
        }
        if from == to {
            return None;
        }
        if self
            .inner
            .cut_links
            .read()
            .contains(&(from.clone(), to.clone()))
        {
            return Some(Blocked::Silent);
        }
        if let Some(groups) = self.inner.groups.read().as_ref() {
            let together = groups.iter().any(|g| g.contains(from) && g.contains(to));
            if !together {
                return Some(Blocked::Silent);
            }
        }
        None
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        message: Message,
    ) -> Result<Message, TransportError> {
        let latency = self.inner.latency.read().get(&to).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        // Re-check after the delay: the receiver may have crashed mid-flight.
        let handler = self
            .inner
            .handlers
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable {
                from: from.clone(),
                to: to.clone(),
            })?;
        let request = Message::decode(&message.encode()?)?;
        let response = handler.handle(&from, request);
        let response = Message::decode(&response.encode()?)?;
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }
}

impl Transport for MemoryNetwork {
    fn call(
        &self,
        from: &NodeId,
        to: &NodeId,
        message: Message,
        timeout: Duration,
    ) -> PinFuture<Result<Message, TransportError>> {
        let net = self.clone();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move {
            match net.blocked(&from, &to) {
                Some(Blocked::Refused) => {
                    net.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(TransportError::Unreachable { from, to });
                }
                Some(Blocked::Silent) => {
                    net.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(timeout).await;
                    return Err(TransportError::Timeout {
                        to,
                        after_ms: timeout.as_millis() as u64,
                    });
                }
                None => {}
            }
            let after_ms = timeout.as_millis() as u64;
            let target = to.clone();
            match tokio::time::timeout(timeout, net.deliver(from, to, message)).await {
                Ok(result) => result,
                Err(_) => {
                    net.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(TransportError::Timeout {
                        to: target,
                        after_ms,
                    })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Heartbeat, HeartbeatAck};

    struct Echo;

    impl MessageHandler for Echo {
        fn handle(&self, _from: &NodeId, message: Message) -> Message {
            match message {
                Message::Heartbeat(hb) => Message::HeartbeatAck(HeartbeatAck {
                    sequence: hb.sequence,
                    load_factor: 0.25,
                }),
                other => Message::Unsupported(other.kind().to_string()),
            }
        }
    }

    fn ping(seq: u64) -> Message {
        Message::Heartbeat(Heartbeat { sequence: seq })
    }

    #[tokio::test]
    async fn delivers_and_round_trips_codec() {
        let net = MemoryNetwork::new();
        net.register("b".into(), Arc::new(Echo));
        let resp = net
            .call(&"a".into(), &"b".into(), ping(7), Duration::from_millis(50))
            .await
            .unwrap();
        match resp {
            Message::HeartbeatAck(ack) => assert_eq!(ack.sequence, 7),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(net.delivered(), 1);
    }

    #[tokio::test]
    async fn crashed_node_refuses_until_restart() {
        let net = MemoryNetwork::new();
        net.register("b".into(), Arc::new(Echo));
        assert!(net.crash(&"b".into()));
        let err = net
            .call(&"a".into(), &"b".into(), ping(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
        assert!(!err.is_transient());
        assert!(net.restart(&"b".into()));
        assert!(net
            .call(&"a".into(), &"b".into(), ping(2), Duration::from_millis(20))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn partition_times_out_across_groups_only() {
        let net = MemoryNetwork::new();
        for id in ["a", "b", "c"] {
            net.register(id.into(), Arc::new(Echo));
        }
        net.partition(&[vec!["a".into(), "b".into()], vec!["c".into()]]);
        assert!(net.reachable(&"a".into(), &"b".into()));
        let err = net
            .call(&"a".into(), &"c".into(), ping(1), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        net.heal();
        assert!(net.reachable(&"a".into(), &"c".into()));
    }

    #[tokio::test]
    async fn latency_beyond_deadline_times_out() {
        let net = MemoryNetwork::new();
        net.register("b".into(), Arc::new(Echo));
        net.set_latency(&"b".into(), Duration::from_millis(40));
        let err = net
            .call(&"a".into(), &"b".into(), ping(1), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        net.clear_latency(&"b".into());
        assert!(net
            .call(&"a".into(), &"b".into(), ping(2), Duration::from_millis(10))
            .await
            .is_ok());
    }
}
