//! Kestrel Operator - Kafka assembly reconciliation for Kubernetes

use clap::{Parser, Subcommand};
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kestrel_operator::config::OsEnv;
use kestrel_operator::{startup, watch};

/// Kestrel - reconciles Kafka clusters declared in labelled ConfigMaps
#[derive(Parser, Debug)]
#[command(name = "kestrel-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches configuration ConfigMaps in every configured namespace and
    /// re-syncs all assemblies on a timer until interrupted.
    Controller,

    /// Reconcile every assembly once and exit
    ///
    /// Exits non-zero if any assembly failed.
    ReconcileOnce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let (config, operators) = startup::build(client.clone(), &OsEnv)
        .map_err(|e| anyhow::anyhow!("Invalid operator configuration: {}", e))?;

    match cli.command {
        Some(Commands::ReconcileOnce) => {
            let mut failed = 0;
            for operator in &operators {
                for namespace in &config.namespaces {
                    let report = watch::run_timer_pass(operator, namespace)
                        .await
                        .map_err(|e| anyhow::anyhow!("Failed to list assemblies: {}", e))?;
                    failed += report.failed().len();
                }
            }
            if failed > 0 {
                anyhow::bail!("{} assemblies failed to reconcile", failed);
            }
            tracing::info!("All assemblies reconciled");
            Ok(())
        }
        Some(Commands::Controller) | None => {
            let mut tasks = Vec::new();
            for operator in &operators {
                for namespace in &config.namespaces {
                    tasks.push(tokio::spawn(watch::run_triggers(
                        client.clone(),
                        operator.clone(),
                        namespace.clone(),
                        config.full_reconciliation_interval,
                    )));
                }
            }
            tracing::info!(
                namespaces = ?config.namespaces,
                loops = tasks.len(),
                "Kestrel operator started"
            );

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            for task in tasks {
                task.abort();
            }
            Ok(())
        }
    }
}
