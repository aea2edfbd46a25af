//! verigate - operational front end for the platform control plane.
//!
//! Runs the control plane standalone: `run` starts the orchestrator and
//! holds it up until a termination signal, `check` performs a one-shot
//! diagnostics pass, `validate` checks a configuration file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use verigate_core::config::PlatformConfig;
use verigate_core::orchestrator::{Orchestrator, ShutdownTrigger};

/// verigate - compliance platform control plane
#[derive(Parser, Debug)]
#[command(name = "verigate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to platform configuration file
    #[arg(short, long, default_value = "platform.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the control plane and run until SIGINT/SIGTERM
    Run,

    /// Start, run one diagnostics pass, print it and shut down
    Check {
        /// Emit JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file and report problems
    Validate,
}

/// Shutdown on SIGINT or SIGTERM.
struct SignalTrigger;

#[async_trait]
impl ShutdownTrigger for SignalTrigger {
    async fn wait(&self) {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        return;
                    },
                };
            tokio::select! {
                _ = ctrl_c => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
    }
}

fn load_config(path: &PathBuf) -> Result<PlatformConfig> {
    PlatformConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run => {
            let config = load_config(&cli.config)?;
            let orchestrator = Orchestrator::from_config(config);
            let state = orchestrator
                .startup()
                .await
                .context("platform startup failed")?;
            tracing::info!(state = ?state, "control plane up, waiting for termination signal");
            orchestrator
                .run_until_triggered(&SignalTrigger)
                .await
                .context("shutdown failed")?;
            Ok(())
        },
        Commands::Check { json } => {
            let config = load_config(&cli.config)?;
            let orchestrator = Orchestrator::from_config(config);
            orchestrator
                .startup()
                .await
                .context("platform startup failed")?;
            let report = orchestrator.run_diagnostics().await;
            orchestrator.shutdown().await.context("shutdown failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("state: {:?}", report.state);
                println!("overall health: {:?}", report.health.status);
                for check in &report.health.checks {
                    println!(
                        "  {:<20} {:<10} {}",
                        check.name,
                        format!("{:?}", check.status),
                        check.message
                    );
                }
                if report.config_issues.is_empty() {
                    println!("configuration: ok");
                } else {
                    println!("configuration problems:");
                    for issue in &report.config_issues {
                        println!("  - {issue}");
                    }
                }
                println!("errors recorded: {}", report.errors.total);
            }
            Ok(())
        },
        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let issues = config.validate();
            if issues.is_empty() {
                println!("{}: ok", cli.config.display());
                Ok(())
            } else {
                for issue in &issues {
                    eprintln!("{}: {issue}", cli.config.display());
                }
                anyhow::bail!("configuration invalid ({} problems)", issues.len());
            }
        },
    }
}
