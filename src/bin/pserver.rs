use anyhow::Result;
use clap::Parser;
use pserver::optimizer::OptimizerConfig;
use pserver::{EtcdCoordinator, PserverConfig, PserverServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pserver")]
#[command(about = "Parameter server shard - serves gradient updates for distributed training")]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 8001)]
    port: u16,

    /// Shard identifier this instance claims
    #[arg(short, long, default_value_t = 0)]
    shard: u32,

    /// Comma-separated etcd endpoints
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    etcd_endpoint: String,

    /// Timeout for etcd calls, in seconds
    #[arg(long, default_value_t = 5)]
    etcd_timeout: u64,

    /// Directory for snapshot files
    #[arg(long, default_value = "./data/pserver")]
    checkpoint_dir: PathBuf,

    /// Scheduled snapshot interval, in seconds
    #[arg(long, default_value_t = 600)]
    checkpoint_interval: u64,

    /// Update rule (sgd or momentum)
    #[arg(long, default_value = "sgd")]
    optimizer: String,

    /// Learning rate for the update rule
    #[arg(long, default_value_t = 0.01)]
    learning_rate: f64,

    /// Momentum coefficient (momentum rule only)
    #[arg(long, default_value_t = 0.9)]
    momentum: f64,

    /// Serve from an empty store when the recorded checkpoint is unreadable
    #[arg(long)]
    allow_cold_start: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let optimizer = match args.optimizer.as_str() {
        "sgd" => OptimizerConfig::Sgd {
            learning_rate: args.learning_rate,
        },
        "momentum" => OptimizerConfig::Momentum {
            learning_rate: args.learning_rate,
            momentum: args.momentum,
        },
        other => anyhow::bail!("unknown optimizer rule: {other}"),
    };

    let config = PserverConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        shard: args.shard,
        etcd_endpoints: args
            .etcd_endpoint
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        coordination_timeout_ms: args.etcd_timeout * 1000,
        checkpoint_dir: args.checkpoint_dir,
        checkpoint_interval_secs: args.checkpoint_interval,
        allow_cold_start: args.allow_cold_start,
        optimizer,
        log_level: args.log_level,
        ..Default::default()
    };

    tracing::info!("Starting pserver v{}", pserver::VERSION);
    tracing::info!("Shard: {}", config.shard);
    tracing::info!("Listening on: {}", config.bind_addr);
    tracing::info!("etcd endpoints: {:?}", config.etcd_endpoints);
    tracing::info!("Checkpoint dir: {}", config.checkpoint_dir.display());

    let coordinator =
        EtcdCoordinator::connect(&config.etcd_endpoints, config.coordination_timeout()).await?;
    let server = PserverServer::new(config, Arc::new(coordinator))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        }
    });

    server.serve(shutdown_rx).await?;
    Ok(())
}
