mod config;
mod demo;
mod server;

use baton_core::{Cluster, DistDatum, Result};
use clap::{Parser, Subcommand};
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "baton")]
#[command(about = "Cluster member that hands datum ownership over on membership changes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node, join the cluster and serve the demo inventory
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "config.toml")]
        conf: String,

        /// Override cluster.node_name from config
        #[arg(long)]
        node: Option<String>,

        /// Seed member host:port, repeatable; replaces cluster.seeds
        #[arg(long = "seed")]
        seeds: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "baton=info,baton_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { conf, node, seeds } => {
            tracing::info!("Starting baton with config: {}", conf);

            let mut cfg = match Config::from_file(&conf) {
                Ok(c) => c,
                Err(error) => {
                    tracing::error!("Failed to load config: {}", error);
                    std::process::exit(1);
                }
            };

            if let Some(node) = node {
                tracing::info!("Using node override '{}' via CLI", node);
                cfg.cluster.node_name = node;
            }
            if !seeds.is_empty() {
                cfg.cluster.seeds = seeds;
            }

            if let Err(error) = run_node(cfg).await {
                tracing::error!("Node stopped with error: {}", error);
                std::process::exit(1);
            }
        }
    }
}

async fn run_node(cfg: Config) -> Result<()> {
    let timeout = Duration::from_secs(cfg.demo.transition_timeout_secs);

    let cluster = Cluster::start(cfg.cluster.clone()).await?;
    let mut changes = cluster.subscribe_to_changes();
    cluster.join(&cfg.cluster.seeds).await?;

    let data: Vec<Arc<dyn DistDatum>> = demo::inventory(cfg.demo.datums)
        .into_iter()
        .map(|counter| counter as Arc<dyn DistDatum>)
        .collect();
    cluster.load_dist_data(|| async move { Ok(data) }).await?;
    cluster.set_ready(true).await?;
    cluster.transition(timeout).await;

    let status = tokio::spawn(server::run_status_server(
        cfg.status_addr.clone(),
        Arc::clone(&cluster),
    ));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = changes.recv() => {
                if changed.is_none() {
                    break;
                }
                cluster.transition(timeout).await;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, handing off owned datums");
                break;
            }
        }
    }

    cluster.set_ready(false).await?;
    cluster.transition(timeout).await;
    status.abort();
    cluster.shutdown().await
}
