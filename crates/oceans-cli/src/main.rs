//! Oceans CLI
//!
//! Command-line interface for running the epoch incentive pipeline.

mod sources;

use anyhow::Context;
use clap::{Parser, Subcommand};
use oceans_core::{BlockHeight, EpochId};
use oceans_node::config::LoggingSettings;
use oceans_node::{verify, NodeConfig, OceansNode};
use oceans_storage::{AuditExport, EpochRecord, EpochStore};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "oceans")]
#[command(version)]
#[command(about = "Oceans - stake-weighted liquidity incentive validator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, env = "OCEANS_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run epochs continuously, following the chain head
    Run,

    /// Run a single epoch and exit
    Once {
        /// Any block inside the epoch to run; defaults to the current head
        #[arg(short, long)]
        block: Option<BlockHeight>,

        /// Print the full epoch record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay an exported epoch and compare it with what was recorded
    Verify {
        /// Audit export file
        file: PathBuf,
    },

    /// Export the audit record of an epoch
    Export {
        /// Epoch number
        epoch: u64,

        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_logging(verbose: bool, settings: &LoggingSettings) {
    let default_level = if verbose { "debug" } else { settings.level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if settings.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false),
            )
            .init();
    }
}

fn expand_path(path: &PathBuf) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(rest) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
    }
    path.clone()
}

fn print_summary(record: &EpochRecord) {
    println!("Epoch {} @ block {}", record.epoch, record.reference.block);
    println!("Status:   {}", record.status);
    println!("Stale:    {}", record.stale);
    println!("Degraded: {}", record.degraded);
    if let Some(accounting) = &record.accounting {
        println!(
            "Budget:   {} (distributed {}, unrealized {}, dust {})",
            record.emission_budget,
            accounting.distributed,
            accounting.unrealized,
            accounting.rounding_dust
        );
    }
    if let Some(rewards) = &record.rewards {
        for (key, amount) in &rewards.rewards {
            println!("  {:<50} {}", key.as_str(), amount);
        }
    }
    if let Some(digest) = &record.reward_digest {
        println!("Digest:   {}", digest);
    }
    for flag in &record.flags {
        println!("Flag:     {} {:?}: {}", flag.source, flag.severity, flag.detail);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_ref().map(expand_path);
    let config = NodeConfig::load(config_path.as_deref()).context("loading configuration")?;
    init_logging(cli.verbose, &config.logging);

    match cli.command {
        Commands::Run => {
            tracing::info!("Oceans validator v{}", env!("CARGO_PKG_VERSION"));
            tracing::info!("Config: {:?}", config_path);
            tracing::info!("Data: {}", config.node.data_dir);

            let (sources, head) = sources::build(&config)?;
            let node = OceansNode::new(config, sources, head)?;
            node.run().await?;
        }

        Commands::Once { block, json } => {
            let (sources, head) = sources::build(&config)?;
            let node = OceansNode::new(config, sources, head)?;
            let record = node.run_once(block).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_summary(&record);
            }
            if record.status.is_failed() {
                anyhow::bail!("epoch {} failed", record.epoch);
            }
        }

        Commands::Verify { file } => {
            let content = std::fs::read_to_string(expand_path(&file))
                .with_context(|| format!("reading {}", file.display()))?;
            let export = AuditExport::from_json(&content)?;
            let report = verify(&export.record)?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_consistent() {
                anyhow::bail!("epoch {} does not reproduce", report.epoch);
            }
        }

        Commands::Export { epoch, output } => {
            let dir = config
                .storage_dir()
                .context("storage.persist is disabled; no records to export")?;
            let store = EpochStore::open(&dir)?;
            let json = store.export(EpochId(epoch))?.to_json()?;

            match output {
                Some(path) => {
                    let path = expand_path(&path);
                    std::fs::write(&path, json)?;
                    println!("Exported epoch {} to {:?}", epoch, path);
                }
                None => println!("{}", json),
            }
        }

        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_once() {
        let cli = Cli::parse_from(["oceans", "once", "--block", "1080", "--json"]);
        match cli.command {
            Commands::Once { block, json } => {
                assert_eq!(block, Some(1080));
                assert!(json);
            }
            _ => panic!("expected once"),
        }
    }

    #[test]
    fn test_expand_plain_path() {
        let path = PathBuf::from("oceans.toml");
        assert_eq!(expand_path(&path), path);
    }
}
