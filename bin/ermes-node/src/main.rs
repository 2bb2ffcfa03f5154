//! Ermes Node
//!
//! Runs one node of the tree: opens its session store, loads the
//! infrastructure description and keeps usage propagation, offload
//! planning and garbage collection going until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use ermes_common::Config;
use ermes_node::{BackgroundTasks, GarbageCollector, NodeService, Offloader, ResourcesAggregator};
use ermes_topology::unmarshal_infrastructure;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ermes-node")]
#[command(about = "Ermes session mobility node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "ERMES_CONFIG")]
    config: Option<PathBuf>,

    /// Node id (area name in the infrastructure)
    #[arg(long)]
    node_id: Option<String>,

    /// Data directory for the session store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Infrastructure description (JSON) to load at startup
    #[arg(long)]
    infrastructure: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(node_id) = args.node_id {
        config.node.id = node_id;
    }
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(infrastructure) = args.infrastructure {
        config.node.infrastructure = Some(infrastructure);
    }

    info!("Starting Ermes node {}", config.node.id);
    let service = Arc::new(NodeService::open(&config)?);

    if let Some(path) = &config.node.infrastructure {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading infrastructure {}", path.display()))?;
        let infrastructure = unmarshal_infrastructure(&bytes)?;
        let nodes = service.load_infrastructure(&infrastructure)?;
        info!("Loaded {} nodes from {}", nodes, path.display());
    }
    match service.get_parent_node() {
        Ok(Some(parent)) => info!("Parent node: {} ({})", parent.id, parent.host),
        Ok(None) => info!("Running as a root node"),
        Err(e) => warn!("Node {} is not in the loaded topology: {e}", config.node.id),
    }

    let mut tasks = BackgroundTasks::new();

    // Parent links are in-process only, so a standalone node aggregates as a root
    let aggregator = ResourcesAggregator::new(service.clone(), None);
    tasks.spawn(
        "aggregator",
        aggregator.run(config.aggregator.interval(), tasks.shutdown_token()),
    );

    let gc = Arc::new(GarbageCollector::new(service.clone(), config.gc.options()));
    tasks.spawn("gc", gc.run(config.gc.interval(), tasks.shutdown_token()));

    // Without a link to other nodes, offload rounds plan and log only
    let offloader = Offloader::new(service.clone(), None);
    tasks.spawn(
        "offloader",
        offloader.run(config.offload.interval(), tasks.shutdown_token()),
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    let failed = tasks.shutdown().await;
    if !failed.is_empty() {
        warn!("Background tasks failed before shutdown: {}", failed.join(", "));
    }

    let pending = service.take_unblocked_offloads();
    if !pending.is_empty() {
        warn!("{} unblocked offloads still queued at shutdown", pending.len());
    }
    Ok(())
}
