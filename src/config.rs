//! Environment-driven configuration.

use crate::storage::MAX_PRESIGNED_TTL;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How each job's pipeline is isolated from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Re-executes this binary as a child process per job.
    Process,
    /// Runs the pipeline as a tokio task inside the worker.
    Task,
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(Isolation::Process),
            "task" => Ok(Isolation::Task),
            other => bail!("unknown isolation mode `{}` (expected `process` or `task`)", other),
        }
    }
}

/// Settings for the external tools used inside the pipeline.
///
/// Loaded separately because the isolated child process only needs these.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub gm_path: PathBuf,
    pub soffice_path: PathBuf,
    pub office_timeout: Duration,
    pub screenshot_command: Option<PathBuf>,
    /// Host serving YouTube video stills.
    pub youtube_thumbnail_base: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gm_path: PathBuf::from("gm"),
            soffice_path: PathBuf::from("soffice"),
            office_timeout: Duration::from_secs(200),
            screenshot_command: None,
            youtube_thumbnail_base: "http://img.youtube.com".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            gm_path: env::var("GM_PATH").map(PathBuf::from).unwrap_or(defaults.gm_path),
            soffice_path: env::var("SOFFICE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.soffice_path),
            office_timeout: secs_or("OFFICE_TIMEOUT_SECS", defaults.office_timeout)?,
            screenshot_command: env::var("SCREENSHOT_COMMAND")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            youtube_thumbnail_base: env::var("YOUTUBE_THUMBNAIL_BASE")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.youtube_thumbnail_base),
        })
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub queue_name: String,
    pub worker_id: String,
    pub queue_wait: Duration,
    pub queue_retry_delay: Duration,
    pub job_timeout: Duration,
    pub isolation: Isolation,
    pub app_secret: String,
    pub host: String,
    pub port: u16,
    pub s3_bucket: String,
    pub s3_endpoint: Option<String>,
    pub signed_url_ttl: Duration,
    pub json_logs: bool,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        Ok(Self {
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string()),
            queue_name: env::var("QUEUE_NAME").unwrap_or_else(|_| "preview:jobs".to_string()),
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| "worker-0".to_string()),
            queue_wait: secs_or("QUEUE_WAIT_SECS", Duration::from_secs(20))?,
            queue_retry_delay: secs_or("QUEUE_RETRY_SECS", Duration::from_secs(20))?,
            job_timeout: secs_or("JOB_TIMEOUT_SECS", Duration::from_secs(200 * 60))?,
            isolation: env::var("ISOLATION")
                .unwrap_or_else(|_| "process".to_string())
                .parse()?,
            app_secret: env::var("APP_SECRET").context("APP_SECRET must be set")?,
            host: env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("APP_PORT")
                .unwrap_or_else(|_| "2001".to_string())
                .parse()
                .context("APP_PORT must be a valid number")?,
            s3_bucket: env::var("S3_BUCKET").context("S3_BUCKET must be set")?,
            s3_endpoint: env::var("S3_ENDPOINT").ok().filter(|v| !v.is_empty()),
            signed_url_ttl: signed_url_ttl(env::var("SIGNED_URL_TTL_SECS").ok())?,
            json_logs: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),
            pipeline: PipelineConfig::from_env()?,
        })
    }
}

/// Presigned URLs live as long as S3 allows unless configured shorter.
fn signed_url_ttl(value: Option<String>) -> Result<Duration> {
    let Some(value) = value else {
        return Ok(MAX_PRESIGNED_TTL);
    };
    let ttl = value
        .parse::<u64>()
        .map(Duration::from_secs)
        .context("SIGNED_URL_TTL_SECS must be a whole number of seconds")?;
    if ttl.is_zero() || ttl > MAX_PRESIGNED_TTL {
        bail!(
            "SIGNED_URL_TTL_SECS must be between 1 and {} (presigned URLs cannot outlive 7 days)",
            MAX_PRESIGNED_TTL.as_secs()
        );
    }
    Ok(ttl)
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    match env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .with_context(|| format!("{} must be a whole number of seconds", key)),
        Err(_) => Ok(default),
    }
}
