use crate::membership::{NodeCapabilities, NodeDescriptor, NodeId};
use crate::replication::ConsistencyLevel;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/quorum-mesh.toml";

/// Top-level configuration, read once at startup and immutable for the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub fault: FaultConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-0".to_string(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub default_consistency: ConsistencyLevel,
    /// Per-replica acknowledgement deadline.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Upper bound a blocking strategy may hold the caller.
    #[serde(default = "default_strategy_timeout_ms")]
    pub strategy_timeout_ms: u64,
    /// Retries against a recomputed target set before surfacing partial success.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Ack count for the weak tier's quorum strategy.
    #[serde(default = "default_weak_quorum")]
    pub weak_quorum: usize,
    #[serde(default = "default_min_reliability")]
    pub min_edge_reliability: f64,
}

impl ReplicationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            default_consistency: ConsistencyLevel::default(),
            ack_timeout_ms: default_ack_timeout_ms(),
            strategy_timeout_ms: default_strategy_timeout_ms(),
            max_retries: default_max_retries(),
            weak_quorum: default_weak_quorum(),
            min_edge_reliability: default_min_reliability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_election_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_leader_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Deadline for a single RequestVote/AppendEntries exchange.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Deadline for one `achieve_consensus` call across all of its rounds.
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,
    #[serde(default = "default_round_backoff_ms")]
    pub round_backoff_ms: u64,
    #[serde(default = "default_max_proposal_attempts")]
    pub max_proposal_attempts: u32,
    #[serde(default = "default_max_entries_per_append")]
    pub max_entries_per_append: usize,
    /// Fixed seed for election jitter; random when unset.
    #[serde(default)]
    pub election_seed: Option<u64>,
}

impl ConsensusConfig {
    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn round_backoff(&self) -> Duration {
        Duration::from_millis(self.round_backoff_ms)
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_min_ms(),
            election_timeout_max_ms: default_election_max_ms(),
            heartbeat_interval_ms: default_leader_heartbeat_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            round_timeout_ms: default_round_timeout_ms(),
            round_backoff_ms: default_round_backoff_ms(),
            max_proposal_attempts: default_max_proposal_attempts(),
            max_entries_per_append: default_max_entries_per_append(),
            election_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a node is declared failed.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    /// Response-time SLA; slower heartbeats count toward a performance failure.
    #[serde(default = "default_performance_sla_ms")]
    pub performance_sla_ms: u64,
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold: u32,
    #[serde(default = "default_redundancy_interval_ms")]
    pub redundancy_interval_ms: u64,
    #[serde(default = "default_restart_attempts")]
    pub restart_attempts: u32,
}

impl FaultConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn performance_sla(&self) -> Duration {
        Duration::from_millis(self.performance_sla_ms)
    }

    pub fn redundancy_interval(&self) -> Duration {
        Duration::from_millis(self.redundancy_interval_ms)
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_probe_interval_ms(),
            miss_threshold: default_miss_threshold(),
            performance_sla_ms: default_performance_sla_ms(),
            slow_threshold: default_slow_threshold(),
            redundancy_interval_ms: default_redundancy_interval_ms(),
            restart_attempts: default_restart_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_load_variance_threshold")]
    pub load_variance_threshold: f64,
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: f64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            load_variance_threshold: default_load_variance_threshold(),
            overload_threshold: default_overload_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub http_bind: Option<String>,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            http_bind: None,
            health_interval_ms: default_health_interval_ms(),
        }
    }
}

/// Static cluster seed list used by `start` and the simulator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<ClusterNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeConfig {
    pub id: String,
    #[serde(default = "default_processing_power")]
    pub processing_power: f64,
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    #[serde(default = "default_storage_bytes")]
    pub storage_bytes: u64,
    #[serde(default = "default_bandwidth_mbps")]
    pub bandwidth_mbps: f64,
    #[serde(default)]
    pub dimensions: Vec<String>,
}

impl ClusterNodeConfig {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            processing_power: default_processing_power(),
            memory_bytes: default_memory_bytes(),
            storage_bytes: default_storage_bytes(),
            bandwidth_mbps: default_bandwidth_mbps(),
            dimensions: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: NodeId::from(self.id.as_str()),
            capabilities: NodeCapabilities {
                processing_power: self.processing_power,
                memory_bytes: self.memory_bytes,
                storage_bytes: self.storage_bytes,
                bandwidth_mbps: self.bandwidth_mbps,
                dimensions: self.dimensions.clone(),
            },
        }
    }
}

impl Config {
    /// Load configuration from `QUORUM_MESH_CONFIG` or `config/quorum-mesh.toml`, then apply env overrides.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Config for node `id` with defaults everywhere else.
    pub fn for_node(id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                data_dir: None,
            },
            ..Self::default()
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from(self.node.id.as_str())
    }

    pub fn cluster_descriptors(&self) -> Vec<NodeDescriptor> {
        self.cluster.nodes.iter().map(|n| n.descriptor()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            bail!("node.id must be non-empty");
        }
        if self.replication.replication_factor == 0 {
            bail!("replication.replication_factor must be > 0");
        }
        if self.replication.weak_quorum == 0
            || self.replication.weak_quorum > self.replication.replication_factor
        {
            bail!(
                "replication.weak_quorum must be within 1..={}",
                self.replication.replication_factor
            );
        }
        if self.replication.ack_timeout_ms == 0 || self.replication.strategy_timeout_ms == 0 {
            bail!("replication timeouts must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.replication.min_edge_reliability) {
            bail!("replication.min_edge_reliability must be within [0, 1]");
        }
        let c = &self.consensus;
        if c.election_timeout_min_ms == 0 || c.election_timeout_min_ms >= c.election_timeout_max_ms
        {
            bail!(
                "consensus election timeout range invalid ({}..{})",
                c.election_timeout_min_ms,
                c.election_timeout_max_ms
            );
        }
        if c.heartbeat_interval_ms == 0 || c.heartbeat_interval_ms >= c.election_timeout_min_ms {
            bail!("consensus.heartbeat_interval_ms must be > 0 and below election_timeout_min_ms");
        }
        if c.round_timeout_ms == 0 || c.rpc_timeout_ms == 0 {
            bail!("consensus timeouts must be non-zero");
        }
        if c.max_proposal_attempts == 0 {
            bail!("consensus.max_proposal_attempts must be > 0");
        }
        if c.max_entries_per_append == 0 {
            bail!("consensus.max_entries_per_append must be > 0");
        }
        if self.fault.miss_threshold == 0 || self.fault.slow_threshold == 0 {
            bail!("fault thresholds must be > 0");
        }
        if self.fault.heartbeat_interval_ms == 0 {
            bail!("fault.heartbeat_interval_ms must be > 0");
        }
        if self.membership.load_variance_threshold < 0.0 {
            bail!("membership.load_variance_threshold must be >= 0");
        }
        let mut seen = HashSet::new();
        for node in &self.cluster.nodes {
            if !seen.insert(node.id.as_str()) {
                bail!("duplicate cluster node id {}", node.id);
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("QUORUM_MESH_NODE_ID") {
            self.node.id = id;
        }
        if let Ok(level) = std::env::var("QUORUM_MESH_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("QUORUM_MESH_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn default_replication_factor() -> usize {
    3
}

fn default_ack_timeout_ms() -> u64 {
    500
}

fn default_strategy_timeout_ms() -> u64 {
    2_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_weak_quorum() -> usize {
    2
}

fn default_min_reliability() -> f64 {
    0.5
}

fn default_election_min_ms() -> u64 {
    150
}

fn default_election_max_ms() -> u64 {
    300
}

fn default_leader_heartbeat_ms() -> u64 {
    50
}

fn default_rpc_timeout_ms() -> u64 {
    100
}

fn default_round_timeout_ms() -> u64 {
    1_000
}

fn default_round_backoff_ms() -> u64 {
    10
}

fn default_max_proposal_attempts() -> u32 {
    3
}

fn default_max_entries_per_append() -> usize {
    64
}

fn default_probe_interval_ms() -> u64 {
    100
}

fn default_miss_threshold() -> u32 {
    3
}

fn default_performance_sla_ms() -> u64 {
    50
}

fn default_slow_threshold() -> u32 {
    3
}

fn default_redundancy_interval_ms() -> u64 {
    5_000
}

fn default_restart_attempts() -> u32 {
    1
}

fn default_load_variance_threshold() -> f64 {
    0.04
}

fn default_overload_threshold() -> f64 {
    0.85
}

fn default_health_interval_ms() -> u64 {
    10_000
}

fn default_processing_power() -> f64 {
    1.0
}

fn default_memory_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_storage_bytes() -> u64 {
    100 * 1024 * 1024 * 1024
}

fn default_bandwidth_mbps() -> f64 {
    1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[node]
id = "node-a"

[replication]
replication_factor = 3
default_consistency = "eventual"

[consensus]
election_timeout_min_ms = 200
election_timeout_max_ms = 400
heartbeat_interval_ms = 40

[fault]
miss_threshold = 4

[[cluster.nodes]]
id = "node-a"

[[cluster.nodes]]
id = "node-b"
processing_power = 2.5
"#;

    #[test]
    fn loads_toml_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mesh.toml");
        fs::write(&path, SAMPLE).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.node.id, "node-a");
        assert_eq!(cfg.replication.default_consistency, ConsistencyLevel::Eventual);
        assert_eq!(cfg.fault.miss_threshold, 4);
        assert_eq!(cfg.fault.heartbeat_interval_ms, 100);
        assert_eq!(cfg.cluster.nodes.len(), 2);
        assert!((cfg.cluster.nodes[1].processing_power - 2.5).abs() < f64::EPSILON);
        cfg.validate().unwrap();
    }

    #[test]
    fn loads_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        fs::write(&path, r#"{"node":{"id":"json-node"}}"#).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.node.id, "json-node");
        assert_eq!(cfg.replication.replication_factor, 3);
    }

    #[test]
    fn rejects_inverted_election_range() {
        let mut cfg = Config::for_node("n1");
        cfg.consensus.election_timeout_min_ms = 300;
        cfg.consensus.election_timeout_max_ms = 300;
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("election timeout range"));
    }

    #[test]
    fn rejects_heartbeat_slower_than_election() {
        let mut cfg = Config::for_node("n1");
        cfg.consensus.heartbeat_interval_ms = cfg.consensus.election_timeout_min_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_cluster_nodes() {
        let mut cfg = Config::for_node("n1");
        cfg.cluster.nodes = vec![ClusterNodeConfig::named("a"), ClusterNodeConfig::named("a")];
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("duplicate cluster node id"));
    }

    #[test]
    fn env_override_replaces_node_id() {
        let mut cfg = Config::for_node("n1");
        std::env::set_var("QUORUM_MESH_NODE_ID", "from-env");
        cfg.apply_env_overrides();
        std::env::remove_var("QUORUM_MESH_NODE_ID");
        assert_eq!(cfg.node.id, "from-env");
    }
}
