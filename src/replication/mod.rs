//! Data replication.
//!
//! - `item` - Replicable items, metadata, replica records
//! - `store` - Per-node replica storage and its wire messages
//! - `strategy` - Replication strategies and consistency mapping
//! - `engine` - `ReplicationEngine`: fan-out, registry, anti-entropy
//! - `conflict` - Conflict model and resolution strategies
//! - `topology` - Replication topology and optimization

pub mod conflict;
pub mod engine;
pub mod item;
pub mod store;
pub mod strategy;
pub mod topology;

pub use conflict::{
    Conflict, ConflictArbiter, ConflictCandidate, ConflictError, ConflictResolutionResult,
    ConflictStrategy, ConflictType,
};
pub use engine::{
    assign_roles, ItemRecord, ReadOutcome, ReplicaConflict, ReplicationEngine, ReplicationError,
    ReplicationResult, SyncReport,
};
pub use item::*;
pub use store::{ReplicaStore, ReplicaWrite, WriteMode, WriteOutcome};
pub use strategy::{strategy_for, ReplicationStrategy};
pub use topology::{
    optimize_topology, LinkProfile, OptimizedTopology, ReplicationTopology, TopologyEdge,
    TopologyError, TopologyShape,
};
