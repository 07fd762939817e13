use anyhow::Context;
use dotenvy::dotenv;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;
mod common;
mod config;
mod docs;
mod infrastructure;
mod modules;
mod routes;
mod state;
mod workers;

use config::settings::AppConfig;
use infrastructure::db::pool;
use infrastructure::queue::{BrokerClient, RabbitMqChannel, Topology};
use infrastructure::storage::{CloudFrontInvalidator, StorageService};
use modules::transcoding::repository::JobRepository;
use state::AppState;
use workers::encoder::FfmpegEncoder;
use workers::transcoder::{TranscodingWorker, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting transcoding service...");

    let config = AppConfig::new().context("Missing required environment variable")?;

    let db = pool::connect_to_db(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    pool::run_migrations(&db).await.context("Failed to run migrations")?;
    let jobs = Arc::new(JobRepository::new(db));

    let storage = StorageService::new(&config.storage_settings());
    let cdn = Arc::new(CloudFrontInvalidator::new(
        &config.cloudfront_distribution_id,
        &config.aws_access_key,
        &config.aws_secret_key,
    ));

    let broker = Arc::new(BrokerClient::new(
        RabbitMqChannel::new(&config.rabbitmq_url),
        Topology::default(),
        config.broker_config(),
    ));
    broker.initialize_with_retry().await;

    let shutdown = CancellationToken::new();
    let supervisor = {
        let broker = broker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { broker.supervise(shutdown).await })
    };

    let worker = Arc::new(TranscodingWorker::new(
        broker.clone(),
        jobs.clone(),
        Arc::new(storage.clone()),
        cdn,
        Arc::new(FfmpegEncoder::default()),
        WorkerSettings::new(&config.work_dir, broker.topology()),
    ));
    let worker_task = tokio::spawn(worker.clone().run());

    let port = config.server_port;
    let state = AppState::new(config, jobs, storage, broker.clone());
    let app = app::create_app(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down...");
    worker.stop();
    shutdown.cancel();
    if let Err(e) = worker_task.await {
        error!("Worker task failed: {}", e);
    }
    if let Err(e) = supervisor.await {
        error!("Broker supervisor failed: {}", e);
    }
    if let Err(e) = broker.close().await {
        error!("Failed to close RabbitMQ connection: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
