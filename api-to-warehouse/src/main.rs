mod batch;
mod config;
mod entity;
mod extract;
mod ledger;
mod load;
mod orchestrator;
mod reports;
mod snapshot;
mod source;
mod sql;
#[cfg(test)]
mod test_support;
mod transform;
mod warehouse;
mod watermark;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::{run_daemon, run_once};

#[derive(Parser, Debug)]
#[command(name = "api-to-warehouse")]
#[command(about = "Incrementally load users, products and carts from JSON APIs into a warehouse.")]
struct Cli {
    /// Path to JSON/YAML config file.
    #[arg(long)]
    config: PathBuf,

    /// Run continuously, performing pipeline runs at a fixed interval.
    #[arg(long)]
    daemon: bool,

    /// Interval in seconds between runs in daemon mode; overrides scheduler.interval_secs.
    #[arg(long, value_name = "SECS")]
    interval_secs: Option<u64>,

    /// Write the run report as JSON to this path after a one-shot run.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let cfg = Config::from_file(&cli.config)?;

    if cli.daemon {
        let interval = cli.interval_secs.unwrap_or(cfg.scheduler.interval_secs);
        return run_daemon(&cfg, interval).await;
    }

    let report = run_once(&cfg).await?;
    if let Some(path) = &cli.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run report {}", path.display()))?;
        tracing::info!(path = %path.display(), "Wrote run report");
    }
    Ok(())
}

fn init_tracing() -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to build log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
    Ok(())
}
