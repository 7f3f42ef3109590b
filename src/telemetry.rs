//! Structured logging and OpenTelemetry export for the preview worker.

use crate::job::{Job, Status};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TRACER_NAME: &str = "preview-worker";

/// Jobs slower than this are logged as a warning.
const SLOW_JOB_THRESHOLD: Duration = Duration::from_secs(120);

/// Installs the global `tracing` subscriber.
///
/// Output always goes to stderr: the job child process reserves stdout for
/// its result. `RUST_LOG` controls the filter (default `info`).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Records the outcome of one processed job.
pub fn record_job_telemetry(job: &Job, status: Status, elapsed: Duration) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("preview_job");
    let duration_ms = elapsed.as_millis() as i64;

    span.set_attribute(KeyValue::new("job_id", job.id.clone()));
    span.set_attribute(KeyValue::new("url", job.url.clone()));
    span.set_attribute(KeyValue::new("status", status.to_string()));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));

    info!(
        job_id = %job.id,
        status = %status,
        duration_ms,
        "Preview job finished"
    );

    if elapsed > SLOW_JOB_THRESHOLD {
        warn!(
            job_id = %job.id,
            duration_ms,
            "Preview job exceeded the slow job threshold"
        );
    }

    span.end();
}

/// Signals that the worker loop is alive.
pub fn record_worker_heartbeat(processed: u64) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");
    span.set_attribute(KeyValue::new("processed_jobs", processed as i64));
    span.end();

    info!(processed, "Worker heartbeat");
}

/// Initializes the OTLP trace exporter.
///
/// Reads `OTEL_EXPORTER_OTLP_ENDPOINT` (default `http://localhost:4317`) and
/// `OTEL_SERVICE_NAME` (default `preview-worker`). Must run inside a tokio
/// runtime.
pub fn init_telemetry() -> Result<(), opentelemetry::trace::TraceError> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    // install_batch registers itself as the global tracer provider
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}

/// Flushes pending spans before exit.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
