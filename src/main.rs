use anyhow::Context;
use clap::Parser;
use qakka::appconfig::AppConfig;
use qakka::cli::{Cli, ConfigSource};
use qakka::error::AppResult;
use qakka::metrics_server::run_metrics_server;
use qakka::queue::{QueueMetrics, QueueService};
use qakka::region::{NoPeersTransport, RegionTransport};
use qakka::store::{MemoryStore, QueueStore};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.workers.max(1))
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = load_config(&cli).context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone())),
        )
        .init();

    info!(
        node = %cfg.node.id,
        region = %cfg.node.local_region,
        backend = %cfg.store.backend,
        "qakka starting"
    );

    let store = build_store(&cfg).await?;
    let metrics = QueueMetrics::new()?;

    // Peer endpoints name where each region lives; the wire transport that
    // speaks to them is deployment-specific and plugged in by embedders.
    let transport: Arc<dyn RegionTransport> = Arc::new(NoPeersTransport);
    if !cfg.regions.peers.is_empty() {
        warn!(
            peers = cfg.regions.peers.len(),
            "peer regions configured but no wire transport is built in; cross-region sends will fail"
        );
    }

    let service = Arc::new(QueueService::new(
        cfg.clone(),
        store,
        transport,
        metrics.clone(),
    ));
    service.start().await?;

    if cfg.metrics.enabled {
        let metrics_cfg = cfg.metrics.clone();
        let gather_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_metrics_server(metrics_cfg, move || gather_metrics.encode_text()).await
            {
                warn!(error = %e, "metrics server exited");
            }
        });
    }

    info!("qakka ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown signal received");
    service.shutdown().await;
    Ok(())
}

fn load_config(cli: &Cli) -> AppResult<AppConfig> {
    match cli.config {
        ConfigSource::File => match (&cli.config_path, std::env::var("QAKKA_CONFIG").ok()) {
            (Some(path), None) => {
                let raw = std::fs::read_to_string(path)?;
                AppConfig::from_toml(&raw)
            }
            _ => AppConfig::load(),
        },
        ConfigSource::Env => {
            let raw = std::env::var("QAKKA_CONFIG_TOML").map_err(|_| {
                qakka::error::AppError::MissingConfig("QAKKA_CONFIG_TOML environment variable")
            })?;
            AppConfig::from_toml(&raw)
        }
    }
}

async fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn QueueStore>> {
    match cfg.store.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "scylladb")]
        "scylla" => {
            let store = qakka::store::ScyllaStore::connect(&cfg.store.scylla)
                .await
                .context("failed to connect to scylla")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "scylladb"))]
        "scylla" => {
            anyhow::bail!("store.backend = 'scylla' requires building with the 'scylladb' feature")
        }
        other => anyhow::bail!("unknown store backend '{other}'"),
    }
}
