//! Simulate command - chaos scenarios against an in-process cluster.

use crate::cli::args::SimulateArgs;
use crate::config::Config;
use crate::fault::simulate_failure_scenarios;
use crate::telemetry;
use crate::toolkit::chaos;
use anyhow::{bail, Result};

pub async fn run_simulate(args: SimulateArgs) -> Result<()> {
    telemetry::init_tracing(Some(&args.log_level))?;
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let scenarios = chaos::load_scenarios(&args.scenario)?;
    let reports = simulate_failure_scenarios(&config, &scenarios).await?;
    let out = if args.pretty {
        serde_json::to_string_pretty(&reports)?
    } else {
        serde_json::to_string(&reports)?
    };
    println!("{out}");
    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.name.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("scenarios failed: {}", failed.join(", "));
    }
    Ok(())
}
