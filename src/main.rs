//! quorum-mesh - unified CLI entrypoint.
//!
//! Usage:
//!   quorum-mesh start --config config/quorum-mesh.toml
//!   quorum-mesh simulate --scenario scenarios/leader-loss.json
//!   quorum-mesh check-config --config config/quorum-mesh.toml

use anyhow::Result;
use clap::Parser;
use quorum_mesh::cli::commands::{run_check_config, run_simulate, run_start};
use quorum_mesh::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Simulate(args) => run_simulate(args).await,
        Commands::CheckConfig(args) => run_check_config(args),
    }
}
