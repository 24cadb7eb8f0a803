//! Generation worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use i2m_fal_client::FalClient;
use i2m_storage::FileStorage;
use i2m_store::{JobStore, ProgressStore, TaskQueue};
use i2m_worker::{BatchProcessor, JobExecutor, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("i2m=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting i2m-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = std::env::var("WORKER_METRICS_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics listening on {}", addr);
    }

    let queue = TaskQueue::from_env().context("Failed to create task queue")?;
    let redis_url = queue.config().redis_url.clone();
    let jobs = JobStore::new(&redis_url).context("Failed to create job store")?;
    let progress = ProgressStore::new(&redis_url).context("Failed to create progress store")?;

    let storage = FileStorage::from_env();
    storage
        .init()
        .await
        .context("Failed to create storage directories")?;

    let generator = FalClient::from_env().context("Failed to create FAL client")?;

    let processor = Arc::new(BatchProcessor::new(
        config.clone(),
        jobs,
        progress,
        storage,
        Arc::new(generator),
    ));
    let executor = Arc::new(JobExecutor::new(config, queue, processor));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    executor.run().await.context("Executor failed")?;

    info!("Worker shutdown complete");
    Ok(())
}
