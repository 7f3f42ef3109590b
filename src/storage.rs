//! Durable storage of generated artifacts.

use crate::error::{PreviewError, Result};
use crate::job::{Artifacts, PreviewResult};
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::Client;
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Artifacts never change once written.
const CACHE_CONTROL: &str = "max-age=232000000";

/// Stored objects expire ten years after upload.
const OBJECT_LIFETIME_DAYS: i64 = 10 * 365;

/// SigV4 presigned URLs cannot outlive one week.
pub const MAX_PRESIGNED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, file: &Path, content_type: &str) -> Result<()>;

    /// Time-limited retrieval URL for a stored object.
    async fn signed_url(&self, key: &str) -> Result<String>;
}

/// S3 (or S3-compatible) [`ObjectStore`].
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    url_ttl: Duration,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, url_ttl: Duration) -> Self {
        if url_ttl > MAX_PRESIGNED_TTL {
            warn!(
                requested_secs = url_ttl.as_secs(),
                max_secs = MAX_PRESIGNED_TTL.as_secs(),
                "Signed URL lifetime exceeds what S3 presigning allows, capping it"
            );
        }
        Self {
            client,
            bucket: bucket.into(),
            url_ttl: url_ttl.min(MAX_PRESIGNED_TTL),
        }
    }

    /// Builds a client from the default AWS credential chain. A custom
    /// `endpoint` (MinIO, localstack) switches to path-style addressing.
    pub async fn connect(bucket: impl Into<String>, endpoint: Option<&str>, url_ttl: Duration) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(endpoint.is_some())
            .build();
        Self::new(Client::from_conf(s3_config), bucket, url_ttl)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, file: &Path, content_type: &str) -> Result<()> {
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| PreviewError::Storage(format!("failed to read {}: {}", file.display(), e)))?;
        let expires = Utc::now() + chrono::Duration::days(OBJECT_LIFETIME_DAYS);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .cache_control(CACHE_CONTROL)
            .expires(S3DateTime::from_secs(expires.timestamp()))
            .send()
            .await
            .map_err(|e| {
                error!(key, error = %e, "Unable to store a file in S3");
                PreviewError::storage(e)
            })?;
        Ok(())
    }

    async fn signed_url(&self, key: &str) -> Result<String> {
        let presigning = PresigningConfig::expires_in(self.url_ttl).map_err(PreviewError::storage)?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| {
                error!(key, error = %e, "Unable to generate a signed URL for a stored file");
                PreviewError::storage(e)
            })?;
        Ok(request.uri().to_string())
    }
}

/// `{year}/{month}/{day}/{hour}/{minute}/{random_id}/{filename}`
pub fn storage_key(now: DateTime<Utc>, random_id: &str, filename: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}/{}/{}",
        now.year(),
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        random_id,
        filename
    )
}

/// Uploads the artifacts of finished jobs and swaps paths for URLs.
#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn ObjectStore>,
}

impl ResultStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Non-`Done` results pass through without touching storage.
    pub async fn store(&self, result: PreviewResult) -> Result<PreviewResult<String>> {
        let artifacts = match result {
            PreviewResult::Done(artifacts) => artifacts,
            PreviewResult::Error => return Ok(PreviewResult::Error),
            PreviewResult::Unsupported => return Ok(PreviewResult::Unsupported),
        };

        Ok(PreviewResult::Done(Artifacts {
            thumbnail: self.store_file_if_any(artifacts.thumbnail).await?,
            image: self.store_file_if_any(artifacts.image).await?,
            pdf: self.store_file_if_any(artifacts.pdf).await?,
            metadata: artifacts.metadata,
        }))
    }

    async fn store_file_if_any(&self, file: Option<PathBuf>) -> Result<Option<String>> {
        let Some(file) = file else {
            return Ok(None);
        };
        if !file.exists() {
            warn!(file = %file.display(), "A file was specified, but did not exist on disk");
            return Ok(None);
        }

        let filename = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let key = storage_key(Utc::now(), &Uuid::new_v4().simple().to_string(), &filename);
        let content_type = mime_guess::from_path(&file).first_or_octet_stream();

        self.store.put(&key, &file, content_type.essence_str()).await?;
        let url = self.store.signed_url(&key).await?;
        debug!(key = %key, "Stored artifact");
        Ok(Some(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_storage_key_layout() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 7, 9, 30).unwrap();

        assert_eq!(
            storage_key(now, "k3x9", "thumbnail.jpg"),
            "2024/3/5/7/9/k3x9/thumbnail.jpg"
        );
    }

    #[tokio::test]
    async fn test_non_done_results_upload_nothing() {
        // No expectations: any call on the mock panics.
        let store = ResultStore::new(Arc::new(MockObjectStore::new()));

        assert_eq!(store.store(PreviewResult::Error).await.unwrap(), PreviewResult::Error);
        assert_eq!(
            store.store(PreviewResult::Unsupported).await.unwrap(),
            PreviewResult::Unsupported
        );
    }

    #[tokio::test]
    async fn test_done_uploads_present_artifacts_and_returns_signed_urls() {
        let dir = TempDir::new().unwrap();
        let thumbnail = dir.path().join("thumbnail.jpg");
        std::fs::write(&thumbnail, b"jpeg").unwrap();

        let mut mock = MockObjectStore::new();
        mock.expect_put()
            .withf(|key, file, content_type| {
                key.ends_with("/thumbnail.jpg")
                    && key.split('/').count() == 7
                    && file.ends_with("thumbnail.jpg")
                    && content_type.to_string() == "image/jpeg"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_signed_url()
            .times(1)
            .returning(|key| Ok(format!("https://signed.example/{}?sig=1", key)));
        let store = ResultStore::new(Arc::new(mock));

        let mut artifacts = Artifacts {
            thumbnail: Some(thumbnail),
            // referenced but never written: skipped
            image: Some(dir.path().join("image.jpg")),
            ..Default::default()
        };
        artifacts.metadata.insert("youtubeId".to_string(), "abc".into());

        let PreviewResult::Done(stored) = store.store(PreviewResult::Done(artifacts)).await.unwrap() else {
            panic!("expected a done result");
        };

        let url = stored.thumbnail.unwrap();
        assert!(url.starts_with("https://signed.example/"));
        assert!(url.contains("/thumbnail.jpg"));
        assert_eq!(stored.image, None);
        assert_eq!(stored.pdf, None);
        assert_eq!(stored.metadata.get("youtubeId"), Some(&"abc".into()));
    }

    #[tokio::test]
    async fn test_upload_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("source.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        let mut mock = MockObjectStore::new();
        mock.expect_put()
            .returning(|_, _, _| Err(PreviewError::Storage("bucket gone".to_string())));
        let store = ResultStore::new(Arc::new(mock));

        let result = store
            .store(PreviewResult::Done(Artifacts {
                pdf: Some(pdf),
                ..Default::default()
            }))
            .await;

        assert!(matches!(result, Err(PreviewError::Storage(_))));
    }

    #[test]
    fn test_presigned_lifetime_is_capped() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        let store = S3Store::new(Client::from_conf(config), "bucket", Duration::from_secs(2 * 365 * 86400));

        assert_eq!(store.url_ttl, MAX_PRESIGNED_TTL);
    }
}
