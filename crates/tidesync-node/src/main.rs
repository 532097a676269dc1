//! tidesync-node - runs the synchronization tasks assigned to this node
//!
//! # Usage
//!
//! ```bash
//! # Run the node
//! tidesync-node -c node.yaml
//!
//! # Validate configuration
//! tidesync-node -c node.yaml validate
//!
//! # List built-in connectors
//! tidesync-node connectors
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tidesync_common::{publish_state_change, ClusterCommandChannel, InProcessChannel, TaskState};
use tidesync_node::{
    health, telemetry::Notifier, ConnectorRegistry, LifecycleController, NodeConfig, NodeContext,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tidesync-node")]
#[command(version, about = "Pipeline node for tidesync change data capture tasks")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "node.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node and its configured tasks (default)
    Run,
    /// Validate configuration file
    Validate,
    /// List available connector types
    Connectors,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let registry = ConnectorRegistry::with_builtins();
    if let Some(Commands::Connectors) = cli.command {
        println!("Sources: {}", registry.source_names().join(", "));
        println!("Targets: {}", registry.loader_names().join(", "));
        return Ok(());
    }

    let config = NodeConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    config
        .validate_connectors(&registry)
        .context("Configuration references unknown connectors")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, registry).await,
        Commands::Validate => {
            println!(
                "Configuration is valid: {} task(s), health endpoint {}",
                config.tasks.len(),
                if config.health.enabled { "enabled" } else { "disabled" }
            );
            Ok(())
        }
        Commands::Connectors => Ok(()),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: NodeConfig, registry: ConnectorRegistry) -> Result<()> {
    let node_id = config.node_id();
    info!(node = %node_id, tasks = config.tasks.len(), "Starting tidesync-node");

    let notifier = Arc::new(Notifier::default());
    let ctx = NodeContext::with_defaults(node_id, notifier, config.pipeline.clone());
    let (controller, alarms) = LifecycleController::new(Arc::clone(&ctx), registry);
    let shutdown = CancellationToken::new();

    if config.health.enabled {
        let health_config = config.health.clone();
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::start_health_server(health_config, controller, shutdown).await {
                error!("Health server failed: {}", e);
            }
        });
    }

    let alarm_task = tokio::spawn({
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        async move { controller.run_alarms(alarms, shutdown).await }
    });

    // Subscribe before publishing so boot commands are not missed
    let channel = InProcessChannel::default();
    let commands = channel.subscribe();
    let command_task = tokio::spawn({
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        async move { controller.serve(commands, shutdown).await }
    });

    for task in &config.tasks {
        let ack = publish_state_change(&channel, TaskState::Working, task.clone()).await;
        if ack.is_soft_failure() {
            warn!(task = %task.task_id, propagation = ?ack.propagation, "Boot command was not delivered");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping tasks");

    shutdown.cancel();
    let _ = command_task.await;
    let _ = alarm_task.await;

    let reports = controller.shutdown().await;
    for report in reports.iter().filter(|r| !r.is_clean()) {
        warn!(task = %report.task_id, discarded = report.discarded().count(), "Task stopped with undrained data");
    }
    ctx.teardown();

    info!("tidesync-node stopped");
    Ok(())
}
