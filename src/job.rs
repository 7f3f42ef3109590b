//! Job, context and result models for the preview pipeline.

use crate::error::{PreviewError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Preview request as submitted by a caller and carried on the queue.
///
/// `id` is opaque to this service; it is echoed back in the callback so the
/// caller can correlate results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub url: String,
    pub post_back_url: String,
}

impl Job {
    pub fn new(id: impl Into<String>, url: impl Into<String>, post_back_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            post_back_url: post_back_url.into(),
        }
    }
}

/// Per-job working state.
///
/// Owned by exactly one pipeline execution. `directory` is created by the
/// worker right before processing and removed right after, whatever the
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub job: Job,
    pub directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Context {
    pub fn new(job: Job, directory: impl Into<PathBuf>) -> Self {
        Self {
            job,
            directory: directory.into(),
            source_path: None,
            mime_type: None,
        }
    }

    /// Returns a copy of this context that knows where the downloaded source
    /// lives and what it is.
    pub fn with_source(&self, source_path: PathBuf, mime_type: String) -> Self {
        Self {
            job: self.job.clone(),
            directory: self.directory.clone(),
            source_path: Some(source_path),
            mime_type: Some(mime_type),
        }
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }
}

/// Free-form metadata attached to a finished preview (`youtubeId`,
/// `httpEmbeddable`, ...).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Generated artifacts of a finished preview.
///
/// `L` is a local path while the result travels out of the pipeline and a
/// retrieval URL once the files have been uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "L: Deserialize<'de>"))]
pub struct Artifacts<L = PathBuf> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<L>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<L>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<L>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl<L> Default for Artifacts<L> {
    fn default() -> Self {
        Self {
            thumbnail: None,
            image: None,
            pdf: None,
            metadata: Metadata::new(),
        }
    }
}

impl Artifacts<PathBuf> {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        [&self.thumbnail, &self.image, &self.pdf]
            .into_iter()
            .filter_map(|p| p.as_deref())
    }

    /// Fails if any referenced file is not on disk.
    pub fn ensure_exist(&self) -> Result<()> {
        match self.paths().find(|p| !p.exists()) {
            Some(missing) => Err(PreviewError::Conversion(format!(
                "expected artifact {} was not generated",
                missing.display()
            ))),
            None => Ok(()),
        }
    }
}

/// Terminal outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PreviewResult<L = PathBuf> {
    Done(Artifacts<L>),
    Error,
    Unsupported,
}

impl<L> PreviewResult<L> {
    pub fn status(&self) -> Status {
        match self {
            PreviewResult::Done(_) => Status::Done,
            PreviewResult::Error => Status::Error,
            PreviewResult::Unsupported => Status::Unsupported,
        }
    }
}

impl PreviewResult<PathBuf> {
    /// Builds a `Done` result, checking that every artifact it names exists.
    pub fn done(artifacts: Artifacts) -> Result<Self> {
        artifacts.ensure_exist()?;
        Ok(PreviewResult::Done(artifacts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Done,
    Error,
    Unsupported,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Done => write!(f, "done"),
            Status::Error => write!(f, "error"),
            Status::Unsupported => write!(f, "unsupported"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_job_wire_format() {
        let job = Job::new("abc", "http://example.com/a.png", "http://caller/postback");
        let json = serde_json::to_value(&job).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "id": "abc",
                "url": "http://example.com/a.png",
                "postBackUrl": "http://caller/postback"
            })
        );
    }

    #[test]
    fn test_result_is_tagged_by_status() {
        let json = serde_json::to_value(PreviewResult::<PathBuf>::Unsupported).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "unsupported" }));

        let mut artifacts = Artifacts::<String>::default();
        artifacts.thumbnail = Some("https://bucket/t.jpg".to_string());
        artifacts
            .metadata
            .insert("youtubeId".to_string(), "dQw4w9WgXcQ".into());
        let json = serde_json::to_value(PreviewResult::Done(artifacts)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "done",
                "thumbnail": "https://bucket/t.jpg",
                "metadata": { "youtubeId": "dQw4w9WgXcQ" }
            })
        );
    }

    #[test]
    fn test_done_requires_artifacts_on_disk() {
        let dir = TempDir::new().unwrap();
        let thumbnail = dir.path().join("thumbnail.jpg");

        let artifacts = Artifacts {
            thumbnail: Some(thumbnail.clone()),
            ..Default::default()
        };
        assert!(PreviewResult::done(artifacts.clone()).is_err());

        std::fs::write(&thumbnail, b"jpeg").unwrap();
        let result = PreviewResult::done(artifacts).unwrap();
        assert_eq!(result.status(), Status::Done);
    }

    #[test]
    fn test_context_with_source_keeps_job() {
        let ctx = Context::new(Job::new("1", "http://a", "http://b"), "/tmp/work");
        let ctx = ctx.with_source("/tmp/work/source".into(), "image/png".into());

        assert_eq!(ctx.job.id, "1");
        assert_eq!(ctx.mime_type.as_deref(), Some("image/png"));
        assert_eq!(ctx.path("thumbnail.jpg"), PathBuf::from("/tmp/work/thumbnail.jpg"));
    }
}
