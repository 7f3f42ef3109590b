//! Preview Worker Library
//!
//! Core functionality for the preview worker service: jobs arrive through a
//! signed REST endpoint, wait on a Redis queue and are turned into a
//! thumbnail, a large image and (for documents) a PDF, which are uploaded to
//! S3 and posted back to the caller.
//!
//! ## Module Overview
//!
//! - `api`: `POST /process` submission endpoint
//! - `callback`: request signing and result delivery
//! - `config`: environment configuration
//! - `converter`: office-to-PDF conversion and SVG rasterisation
//! - `dispatch`: mime type to handler mapping
//! - `geometry`: thumbnail crop and resize arithmetic
//! - `imaging`: GraphicsMagick rendering
//! - `job`: job, context and result models
//! - `link`: redirect resolution and embeddability checks for web links
//! - `pipeline`: download and per-type processing of one job
//! - `queue`: Redis-backed reliable queue
//! - `runner`: per-job isolation with a hard deadline
//! - `storage`: artifact upload and signed URLs
//! - `telemetry`: structured logging and OpenTelemetry
//! - `worker`: the queue consumer loop
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use preview_worker::config::PipelineConfig;
//! use preview_worker::job::{Context, Job};
//! use preview_worker::pipeline::{Pipeline, PreviewPipeline};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = PreviewPipeline::new(&PipelineConfig::default());
//!     let job = Job::new("doc-123", "https://example.com/report.pdf", "https://caller/cb");
//!     let dir = tempfile::TempDir::new().unwrap();
//!
//!     let result = pipeline.process(Context::new(job, dir.path())).await;
//!     println!("{:?}", result);
//! }
//! ```

pub mod api;
pub mod callback;
pub mod config;
pub mod converter;
pub mod dispatch;
pub mod error;
pub mod geometry;
pub mod imaging;
pub mod job;
pub mod link;
pub mod pipeline;
pub mod queue;
pub mod runner;
pub mod storage;
pub mod telemetry;
pub mod worker;
