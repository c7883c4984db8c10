//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// quorum-mesh - replicated coordination core with Raft consensus and fault tolerance.
#[derive(Parser)]
#[command(name = "quorum-mesh")]
#[command(version)]
#[command(about = "Run, simulate, and validate a quorum-mesh cluster")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the configured cluster in-process until Ctrl-C
    Start(StartArgs),

    /// Run chaos scenarios against a fresh simulated cluster
    Simulate(SimulateArgs),

    /// Load and validate a configuration file
    CheckConfig(CheckConfigArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/quorum-mesh.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// JSON file holding one scenario or a list of scenarios
    #[arg(short, long)]
    pub scenario: PathBuf,

    /// Base configuration; defaults apply when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level for the simulation run
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Pretty-print the JSON report
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/quorum-mesh.toml")]
    pub config: PathBuf,
}
