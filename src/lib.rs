#![warn(unused, dead_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
// Millisecond, load, and reliability arithmetic mixes u64, usize, and f64.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_self)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::large_futures)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::unused_async)]

//! quorum-mesh - distributed coordination core: node membership, item replication with
//! tunable consistency, Raft consensus, and failure detection with automatic recovery.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::engine` - `CoordinationEngine`, the per-node facade
//! - `core::host` - Inbound message dispatch
//! - `core::runtime` - Background loops and shutdown
//! - `core::time` - Deterministic time utilities
//!
//! ## Cluster
//! - `membership` - Node registry, load balancing, health snapshots
//! - `transport` - Message types and the in-process network
//! - `replication` - Replicated items, strategies, conflicts, topology
//! - `consensus` - Raft log, elections, and proposals
//! - `storage` - Durable Raft state (memory and file-backed)
//! - `fault` - Failure detection, partitions, recovery, redundancy
//!
//! ## Operations
//! - `ops::health` - Alerts and health reports
//! - `ops::telemetry` - Tracing setup and the HTTP health endpoint
//!
//! ## Tools
//! - `toolkit` - Cluster simulator and chaos scenarios

// Core infrastructure
pub mod core;

// Cluster
pub mod consensus;
pub mod fault;
pub mod membership;
pub mod replication;
pub mod storage;
pub mod transport;

// Operations
pub mod ops;

// Tools
pub mod toolkit;

// CLI
pub mod cli;

pub use self::core::{config, runtime, time};
pub use self::core::engine::{CoordinationEngine, CoordinationError};
pub use ops::{health, telemetry};
