//! Core runtime infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `engine` - `CoordinationEngine`, the per-node facade over every subsystem
//! - `host` - Inbound message dispatch for one node
//! - `runtime` - Background loops, telemetry, and shutdown
//! - `time` - Deterministic time utilities

pub mod config;
pub mod engine;
pub mod host;
pub mod runtime;
pub mod time;

pub use config::*;
pub use engine::*;
pub use host::NodeHost;
pub use runtime::*;
pub use time::*;
