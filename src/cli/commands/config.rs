use crate::cli::args::CheckConfigArgs;
use crate::config::Config;
use anyhow::{Context, Result};

pub fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", args.config.display()))?;
    println!(
        "config ok: node {} | {} cluster nodes | rf {} | default consistency {:?}",
        config.node.id,
        config.cluster.nodes.len(),
        config.replication.replication_factor,
        config.replication.default_consistency
    );
    Ok(())
}
