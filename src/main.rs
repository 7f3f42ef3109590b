//! Preview Worker Service
//!
//! Accepts preview jobs over HTTP, queues them in Redis and processes them
//! one at a time, each inside its own child process.
//!
//! ## Architecture
//!
//! - **API**: `POST /process`, signed bearer tokens
//! - **Queue**: Redis list with a per-worker in-flight list
//! - **Runner**: `preview-worker run-job` child per job, killed at the deadline
//! - **Storage**: S3 with signed retrieval URLs
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! Environment variables (a `.env` file is honoured):
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `APP_SECRET`: shared signing secret (required)
//! - `S3_BUCKET`: artifact bucket (required)
//! - `ISOLATION`: `process` (default) or `task`
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use preview_worker::api::{self, AppState};
use preview_worker::callback::CallbackNotifier;
use preview_worker::config::{Config, Isolation, PipelineConfig};
use preview_worker::pipeline::PreviewPipeline;
use preview_worker::queue::{MessageQueue, RedisQueue};
use preview_worker::runner::{self, JobRunner, ProcessRunner, TaskRunner};
use preview_worker::storage::{ResultStore, S3Store};
use preview_worker::telemetry;
use preview_worker::worker::Worker;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "preview-worker", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST API and the queue worker (default)
    Serve,
    /// Process a single job read from stdin and print its result
    #[command(name = runner::CHILD_COMMAND, hide = true)]
    RunJob,
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::RunJob => run_job().await,
    }
}

async fn serve() -> Result<()> {
    let config = Config::from_env()?;

    telemetry::init_tracing(config.json_logs);
    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!(
        queue = %config.queue_name,
        worker_id = %config.worker_id,
        isolation = ?config.isolation,
        "Starting preview worker service"
    );
    warn!(
        signed_url_ttl_days = config.signed_url_ttl.as_secs() / 86_400,
        "Signed artifact URLs expire after at most 7 days, not the 2 years callers may expect"
    );

    let client = redis::Client::open(config.redis_url.as_str())
        .context("Failed to create Redis client")?;
    // BLMOVE blocks its whole connection, so the worker's long-poll and the
    // API's pushes each get their own.
    let worker_conn = ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;
    let api_conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis");

    let queue: Arc<dyn MessageQueue> =
        Arc::new(RedisQueue::new(worker_conn, &config.queue_name, &config.worker_id));
    let api_queue: Arc<dyn MessageQueue> =
        Arc::new(RedisQueue::new(api_conn, &config.queue_name, &config.worker_id));

    let runner: Arc<dyn JobRunner> = match config.isolation {
        Isolation::Process => Arc::new(
            ProcessRunner::current_exe(config.job_timeout)
                .context("Failed to locate the worker executable")?,
        ),
        Isolation::Task => Arc::new(TaskRunner::new(
            Arc::new(PreviewPipeline::new(&config.pipeline)),
            config.job_timeout,
        )),
    };

    let store = S3Store::connect(
        config.s3_bucket.clone(),
        config.s3_endpoint.as_deref(),
        config.signed_url_ttl,
    )
    .await;
    let notifier = CallbackNotifier::new(config.app_secret.clone())?;

    let shutdown = CancellationToken::new();

    let state = AppState::new(api_queue, &config.app_secret);
    let host = config.host.clone();
    let port = config.port;
    let api_shutdown = shutdown.clone();
    let mut api_task =
        tokio::spawn(async move { api::serve(&host, port, state, api_shutdown).await });

    let mut worker = Worker::new(
        queue,
        runner,
        ResultStore::new(Arc::new(store)),
        notifier,
        config.queue_wait,
        config.queue_retry_delay,
    );
    let worker_shutdown = shutdown.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });

    info!("Worker service ready, press Ctrl+C to shutdown");
    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received shutdown signal, finishing the current job...");
        }
        result = &mut api_task => {
            shutdown.cancel();
            let _ = worker_task.await;
            result.context("REST API task panicked")?.context("REST API stopped")?;
            return Ok(());
        }
    }

    shutdown.cancel();
    let _ = api_task.await;
    let _ = worker_task.await;
    telemetry::shutdown_telemetry();

    info!("Worker service shutdown complete");
    Ok(())
}

/// Child side of process isolation. stdout carries the result, so all
/// logging goes to stderr and OTLP export stays off.
async fn run_job() -> Result<()> {
    let _ = dotenvy::dotenv();
    let json_logs = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    telemetry::init_tracing(json_logs);

    let config = PipelineConfig::from_env()?;
    let pipeline = PreviewPipeline::new(&config);
    runner::run_child(&pipeline)
        .await
        .context("Unable to process job")
}
