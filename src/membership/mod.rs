//! Node membership management.
//!
//! - `node` - Node identity, capabilities, and status
//! - `manager` - `NodeManager` registry, load balancing, health snapshots

pub mod manager;
pub mod node;

pub use manager::*;
pub use node::*;
