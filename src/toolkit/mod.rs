//! Development tooling.
//!
//! - `simulator` - In-process cluster over a simulated network
//! - `chaos` - Scripted failure scenarios and their reports

pub mod chaos;
pub mod simulator;
