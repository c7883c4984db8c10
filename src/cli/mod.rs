//! quorum-mesh CLI - unified command-line interface.
//!
//! - `quorum-mesh start` - Run the configured cluster
//! - `quorum-mesh simulate` - Run chaos scenarios
//! - `quorum-mesh check-config` - Validate a configuration file

mod args;
pub mod commands;

pub use args::{CheckConfigArgs, Cli, Commands, SimulateArgs, StartArgs};
