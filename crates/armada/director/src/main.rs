//! Armada Director - Deployment orchestration daemon
//!
//! `armadad` turns a deployment manifest into running instances:
//! - `validate` checks a manifest and builds its plan
//! - `deploy` rehearses the full deploy against the simulated fleet

use anyhow::Context;
use armada_director::{rehearsal, Deployer, DirectorConfig};
use armada_infra::RecordingTicker;
use armada_plan::DeploymentManifest;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Armada Director CLI
#[derive(Parser)]
#[command(name = "armadad")]
#[command(about = "Armada Director - Deployment orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ARMADA_CONFIG", global = true)]
    config: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "ARMADA_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "ARMADA_LOG_JSON", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a manifest and build its deployment plan
    Validate {
        /// Deployment manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,
    },
    /// Deploy a manifest against the simulated fleet
    Deploy {
        /// Deployment manifest (JSON)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Recreate every VM
        #[arg(long)]
        recreate: bool,
    },
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn read_manifest(path: &Path) -> anyhow::Result<DeploymentManifest> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    DeploymentManifest::from_json(&json)
        .with_context(|| format!("Invalid manifest {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = DirectorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_tracing(level, cli.json || config.logging.json);

    match cli.command {
        Command::Validate { manifest } => {
            let manifest = read_manifest(&manifest)?;
            let plan = Deployer::validate(&manifest)?;
            println!(
                "Manifest for `{}' is valid: {} jobs, {} resource pools",
                plan.name,
                plan.jobs.len(),
                plan.resource_pools.len()
            );
        }
        Command::Deploy { manifest, recreate } => {
            let manifest = read_manifest(&manifest)?;
            let ticker = Arc::new(RecordingTicker::new());
            let (ctx, cloud) = rehearsal::simulated_context(config);
            let ctx = ctx.with_ticker(ticker.clone());
            rehearsal::seed_store(&ctx.store, &manifest).await?;

            let summary = Deployer::new(ctx).deploy(&manifest, recreate).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!(
                "Deployed `{}': {} VMs running, {:.1} steps of progress",
                summary.deployment,
                cloud.vm_count(),
                ticker.total()
            );
        }
    }
    Ok(())
}
