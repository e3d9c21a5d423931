//! defendd - autonomic web-server defence daemon
//!
//! Watches server health and traffic and, on an incident, asks an external
//! planner for a mitigation plan and applies it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use defend_common::encode;
use defendd::config::{DefendConfig, CONFIG_PATH};
use defendd::{ControlLoop, CycleOutcome, HttpStatusSource, SystemCommandRunner};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "defendd")]
#[command(about = "Plan-driven web server defence daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Log mitigations instead of applying them
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop until interrupted
    Run,
    /// Run a single cycle and print the outcome
    Once,
    /// Print the current snapshot as JSON
    Snapshot,
    /// Print the problem the solver would receive for the current snapshot
    Encode,
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = DefendConfig::load(&cli.config)?;
    if cli.dry_run {
        config.actions.dry_run = true;
    }

    let status = HttpStatusSource::new(&config.monitor.server_url, config.status_timeout())
        .context("Failed to set up status client")?;
    let runner = Arc::new(SystemCommandRunner::new());
    let controller = ControlLoop::from_config(&config, Arc::new(status), runner).await?;

    match cli.command {
        Commands::Run => {
            info!(
                "defendd v{} starting (dry_run={})",
                env!("CARGO_PKG_VERSION"),
                config.actions.dry_run
            );
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutting down gracefully");
                let _ = shutdown_tx.send(true);
            });
            let cycles = controller.run(shutdown_rx).await?;
            info!("Completed {} cycles", cycles);
        }
        Commands::Once => match controller.run_cycle().await? {
            CycleOutcome::Idle => println!("idle: no incident"),
            CycleOutcome::Mitigated { cause, report, .. } => {
                println!("incident: {}", cause);
                if report.steps.is_empty() {
                    println!("  no plan found");
                }
                for step in &report.steps {
                    println!("  {} -> {}", step.action, step.outcome);
                }
            }
        },
        Commands::Snapshot => {
            let snapshot = controller.collector().collect().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Encode => {
            let snapshot = controller.collector().collect().await?;
            let instance = encode(&snapshot, controller.encoder_settings());
            print!("{}", controller.gateway().render(&instance));
        }
    }

    Ok(())
}
