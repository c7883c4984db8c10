use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Cluster-unique node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Hardware capability descriptor advertised at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub processing_power: f64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub bandwidth_mbps: f64,
    /// Sharding dimensions this node can host.
    #[serde(default)]
    pub dimensions: Vec<String>,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            processing_power: 1.0,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            storage_bytes: 100 * 1024 * 1024 * 1024,
            bandwidth_mbps: 1_000.0,
            dimensions: Vec::new(),
        }
    }
}

impl NodeCapabilities {
    /// Returns the first reason these capabilities are unusable, if any.
    pub fn invalid_reason(&self) -> Option<String> {
        if !self.processing_power.is_finite() || self.processing_power <= 0.0 {
            return Some(format!(
                "processing_power must be positive (got {})",
                self.processing_power
            ));
        }
        if !self.bandwidth_mbps.is_finite() || self.bandwidth_mbps <= 0.0 {
            return Some(format!(
                "bandwidth_mbps must be positive (got {})",
                self.bandwidth_mbps
            ));
        }
        if self.memory_bytes == 0 {
            return Some("memory_bytes must be non-zero".into());
        }
        if self.storage_bytes == 0 {
            return Some("storage_bytes must be non-zero".into());
        }
        if self.dimensions.iter().any(|d| d.trim().is_empty()) {
            return Some("dimension names must be non-empty".into());
        }
        None
    }
}

/// Registration request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            capabilities: NodeCapabilities::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Degraded,
    Failed,
    Quarantined,
}

impl NodeStatus {
    /// Live nodes take replication traffic and count toward discovery.
    pub fn is_live(self) -> bool {
        matches!(self, NodeStatus::Active | NodeStatus::Degraded)
    }
}

/// Membership record owned by `NodeManager`.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    pub last_heartbeat: Instant,
    pub load_factor: f64,
}

impl Node {
    pub(crate) fn from_descriptor(descriptor: NodeDescriptor, now: Instant) -> Self {
        Self {
            id: descriptor.id,
            capabilities: descriptor.capabilities,
            status: NodeStatus::Active,
            last_heartbeat: now,
            load_factor: 0.0,
        }
    }
}
