//! The per-job preview pipeline: download, dispatch, render.
//!
//! Runs inside the isolation boundary (see [`crate::runner`]). Everything is
//! sequential: one download, one dispatch decision, one handler.

use crate::config::PipelineConfig;
use crate::converter::{self, run_tool, OfficeConverter};
use crate::dispatch::{ContentKind, SVG_MIME_TYPE};
use crate::error::{PreviewError, Result};
use crate::imaging::ImageTool;
use crate::job::{Artifacts, Context, PreviewResult};
use crate::link::{self, LinkResolver};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

/// Mime type assumed when a server sends no `Content-Type`.
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

const SCREENSHOT_SIZE: u32 = 1280;
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(60);
/// Time given to scripts and web fonts before the screenshot is taken.
const SCREENSHOT_RENDER_BUDGET_MS: u32 = 7500;

/// Turns a job context into a terminal result.
#[async_trait]
pub trait Pipeline: Send + Sync + 'static {
    async fn process(&self, ctx: Context) -> Result<PreviewResult>;
}

pub struct PreviewPipeline {
    images: ImageTool,
    office: OfficeConverter,
    links: LinkResolver,
    screenshot_command: Option<PathBuf>,
    youtube_thumbnail_base: String,
}

#[async_trait]
impl Pipeline for PreviewPipeline {
    async fn process(&self, ctx: Context) -> Result<PreviewResult> {
        let source_path = ctx.path("source");
        let mime_type = download(&ctx.job.url, &source_path).await?;
        info!(job_id = %ctx.job.id, mime_type = %mime_type, "Downloaded source");

        let ctx = ctx.with_source(source_path, mime_type);
        self.process_source(&ctx).await
    }
}

impl PreviewPipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            images: ImageTool::new(&config.gm_path),
            office: OfficeConverter::new(&config.soffice_path, config.office_timeout),
            links: LinkResolver::new(),
            screenshot_command: config.screenshot_command.clone(),
            youtube_thumbnail_base: config.youtube_thumbnail_base.clone(),
        }
    }

    async fn process_source(&self, ctx: &Context) -> Result<PreviewResult> {
        let (Some(source), Some(mime_type)) = (&ctx.source_path, &ctx.mime_type) else {
            return Err(PreviewError::Download("source was not downloaded".to_string()));
        };

        let kind = ContentKind::from_mime(mime_type);
        debug!(job_id = %ctx.job.id, %kind, "Dispatching source");

        match kind {
            ContentKind::Image => {
                let artifacts = self.render_image(ctx, source, mime_type).await?;
                PreviewResult::done(artifacts)
            }
            ContentKind::Office => {
                let pdf = self.office.to_pdf(source, &ctx.directory).await?;
                self.process_pdf(ctx, pdf).await
            }
            ContentKind::Pdf => {
                let pdf = ctx.path("source.pdf");
                tokio::fs::rename(source, &pdf).await?;
                self.process_pdf(ctx, pdf).await
            }
            ContentKind::Link => self.process_link(ctx).await,
            ContentKind::Unsupported => Ok(PreviewResult::Unsupported),
        }
    }

    /// Large image first, then the thumbnail, both from the same source.
    async fn render_image(&self, ctx: &Context, source: &Path, mime_type: &str) -> Result<Artifacts> {
        let source = if mime_type == SVG_MIME_TYPE {
            let svg = source.to_path_buf();
            let png = ctx.path("source.png");
            let target = png.clone();
            tokio::task::spawn_blocking(move || converter::rasterize_svg(&svg, &target))
                .await
                .map_err(PreviewError::conversion)??;
            png
        } else {
            source.to_path_buf()
        };

        let image = ctx.path("image.jpg");
        self.images.large_image(&source, &image).await?;
        let thumbnail = ctx.path("thumbnail.jpg");
        self.images.thumbnail(&source, &thumbnail).await?;

        Ok(Artifacts {
            thumbnail: Some(thumbnail),
            image: Some(image),
            ..Default::default()
        })
    }

    /// Renders the first page and ships the PDF itself alongside.
    async fn process_pdf(&self, ctx: &Context, pdf: PathBuf) -> Result<PreviewResult> {
        let mut artifacts = self.render_image(ctx, &pdf, "application/pdf").await?;
        artifacts.pdf = Some(pdf);
        PreviewResult::done(artifacts)
    }

    async fn process_link(&self, ctx: &Context) -> Result<PreviewResult> {
        let url = Url::parse(&ctx.job.url).map_err(PreviewError::download)?;

        match link::youtube_id(&url) {
            Some(id) => self.process_youtube(ctx, &id).await,
            None => self.process_webpage(ctx, url).await,
        }
    }

    async fn process_youtube(&self, ctx: &Context, id: &str) -> Result<PreviewResult> {
        let thumbnail = ctx.path("thumbnail.jpg");
        let mime_type = download(
            &link::youtube_thumbnail_url(&self.youtube_thumbnail_base, id),
            &thumbnail,
        ).await?;
        if mime_type != "image/jpeg" {
            return Err(PreviewError::Conversion(format!(
                "unexpected mime type {} for a youtube thumbnail",
                mime_type
            )));
        }

        let mut artifacts = Artifacts {
            thumbnail: Some(thumbnail),
            ..Default::default()
        };
        artifacts.metadata.insert("youtubeId".to_string(), id.into());
        PreviewResult::done(artifacts)
    }

    async fn process_webpage(&self, ctx: &Context, url: Url) -> Result<PreviewResult> {
        let Some(browser) = &self.screenshot_command else {
            return Err(PreviewError::Conversion(
                "link screenshots are disabled".to_string(),
            ));
        };

        let screenshot = ctx.path("screenshot.png");
        let mut command = Command::new(browser);
        command
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg("--ignore-certificate-errors")
            .arg(format!("--window-size={},{}", SCREENSHOT_SIZE, SCREENSHOT_SIZE))
            .arg(format!("--virtual-time-budget={}", SCREENSHOT_RENDER_BUDGET_MS))
            .arg(format!("--screenshot={}", screenshot.display()))
            .arg(url.as_str());
        run_tool(command, SCREENSHOT_TIMEOUT, "screenshot").await?;

        let thumbnail = ctx.path("thumbnail.jpg");
        self.images.thumbnail(&screenshot, &thumbnail).await?;

        let embeddable = self.links.embeddability(&url).await;
        let mut artifacts = Artifacts {
            thumbnail: Some(thumbnail),
            image: Some(screenshot),
            ..Default::default()
        };
        artifacts
            .metadata
            .insert("httpEmbeddable".to_string(), embeddable.http.into());
        artifacts
            .metadata
            .insert("httpsEmbeddable".to_string(), embeddable.https.into());
        artifacts
            .metadata
            .insert("image_width".to_string(), SCREENSHOT_SIZE.into());
        PreviewResult::done(artifacts)
    }
}

/// Streams `url` into `destination` and returns the response's mime type.
///
/// Each download gets its own cookie jar. Certificate errors are tolerated;
/// the content is only ever rendered, never trusted.
pub async fn download(url: &str, destination: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(PreviewError::download)?;

    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(PreviewError::download)?;

    let mime_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(essence)
        .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string());

    let mut file = tokio::fs::File::create(destination).await?;
    while let Some(chunk) = response.chunk().await.map_err(PreviewError::download)? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(mime_type)
}

/// `text/html; charset=utf-8` -> `text/html`
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use axum::http::{header, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        addr
    }

    fn fixtures() -> Router {
        Router::new()
            .route(
                "/logo.png",
                get(|| async { ([(header::CONTENT_TYPE, "image/png; charset=binary")], b"fake-png".to_vec()) }),
            )
            .route(
                "/archive.zip",
                get(|| async { ([(header::CONTENT_TYPE, "application/zip")], b"PK".to_vec()) }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
    }

    #[test]
    fn test_essence_strips_parameters() {
        assert_eq!(essence("text/html; charset=utf-8"), "text/html");
        assert_eq!(essence(" application/pdf "), "application/pdf");
        assert_eq!(essence(""), "");
    }

    #[tokio::test]
    async fn test_download_streams_body_and_reports_mime() {
        let addr = serve(fixtures()).await;
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("source");

        let mime = download(&format!("http://{}/logo.png", addr), &destination)
            .await
            .unwrap();

        assert_eq!(mime, "image/png");
        assert_eq!(std::fs::read(&destination).unwrap(), b"fake-png");
    }

    #[tokio::test]
    async fn test_download_error_status_fails() {
        let addr = serve(fixtures()).await;
        let dir = TempDir::new().unwrap();

        let result = download(&format!("http://{}/missing", addr), &dir.path().join("source")).await;

        assert!(matches!(result, Err(PreviewError::Download(_))));
    }

    #[tokio::test]
    async fn test_unsupported_source_finishes_without_artifacts() {
        let addr = serve(fixtures()).await;
        let dir = TempDir::new().unwrap();
        let job = Job::new("zip", format!("http://{}/archive.zip", addr), "http://caller/cb");
        let pipeline = PreviewPipeline::new(&PipelineConfig::default());

        let result = pipeline.process(Context::new(job, dir.path())).await.unwrap();

        assert_eq!(result, PreviewResult::Unsupported);
    }

    #[tokio::test]
    async fn test_webpage_without_screenshot_command_fails() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::write(&source, "<html></html>").unwrap();
        let ctx = Context::new(Job::new("1", "https://example.com/", "http://caller/cb"), dir.path())
            .with_source(source, "text/html".to_string());
        let pipeline = PreviewPipeline::new(&PipelineConfig::default());

        let result = pipeline.process_source(&ctx).await;

        assert!(matches!(result, Err(PreviewError::Conversion(_))));
    }

    fn video_link(dir: &Path) -> Context {
        let source = dir.join("source");
        std::fs::write(&source, "<html></html>").unwrap();
        Context::new(
            Job::new("video", "https://www.youtube.com/watch?v=abc", "http://caller/cb"),
            dir,
        )
        .with_source(source, "text/html".to_string())
    }

    fn video_pipeline(addr: SocketAddr) -> PreviewPipeline {
        PreviewPipeline::new(&PipelineConfig {
            youtube_thumbnail_base: format!("http://{}", addr),
            ..PipelineConfig::default()
        })
    }

    #[tokio::test]
    async fn test_youtube_link_uses_video_still() {
        let router = Router::new().route(
            "/vi/abc/hqdefault.jpg",
            get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], b"\xFF\xD8still".to_vec()) }),
        );
        let addr = serve(router).await;
        let dir = TempDir::new().unwrap();
        let ctx = video_link(dir.path());

        let result = video_pipeline(addr).process_source(&ctx).await.unwrap();

        let PreviewResult::Done(artifacts) = result else {
            panic!("expected a finished preview, got {:?}", result);
        };
        assert_eq!(artifacts.thumbnail, Some(dir.path().join("thumbnail.jpg")));
        assert_eq!(artifacts.image, None);
        assert_eq!(artifacts.pdf, None);
        assert_eq!(
            serde_json::to_value(&artifacts.metadata).unwrap(),
            serde_json::json!({ "youtubeId": "abc" })
        );
        assert_eq!(std::fs::read(dir.path().join("thumbnail.jpg")).unwrap(), b"\xFF\xD8still");
    }

    #[tokio::test]
    async fn test_youtube_still_must_be_jpeg() {
        let router = Router::new().route(
            "/vi/abc/hqdefault.jpg",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], b"fake-png".to_vec()) }),
        );
        let addr = serve(router).await;
        let dir = TempDir::new().unwrap();

        let result = video_pipeline(addr).process_source(&video_link(dir.path())).await;

        assert!(matches!(result, Err(PreviewError::Conversion(_))));
    }

    #[tokio::test]
    async fn test_context_without_source_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new(Job::new("1", "https://example.com/", "http://caller/cb"), dir.path());
        let pipeline = PreviewPipeline::new(&PipelineConfig::default());

        assert!(pipeline.process_source(&ctx).await.is_err());
    }
}
