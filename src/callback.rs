//! Request signing and result delivery to callers.
//!
//! Every request crossing the service boundary carries
//! `Authorization: Bearer <nonce>:<signature>` where the signature is
//! `base64(HMAC-SHA1(secret, nonce))`. The same scheme authenticates
//! inbound submissions and outbound callbacks.

use crate::error::{PreviewError, Result};
use crate::job::{Job, PreviewResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use sha1::Sha1;
use std::time::Duration;
use tracing::{error, info};

type HmacSha1 = Hmac<Sha1>;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

pub fn sign(secret: &str, nonce: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|_| PreviewError::Auth("invalid signing key"))?;
    mac.update(nonce.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Builds the `Authorization` header value for `nonce`.
pub fn bearer_header(secret: &str, nonce: &str) -> Result<String> {
    Ok(format!("Bearer {}:{}", nonce, sign(secret, nonce)?))
}

/// Checks an `Authorization` header value against `secret`.
pub fn verify(secret: &str, authorization: Option<&str>) -> Result<()> {
    let header = authorization.ok_or(PreviewError::Auth("missing authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(PreviewError::Auth("unsupported authorization scheme"))?;

    let mut parts = token.split(':');
    let (Some(nonce), Some(signature), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(PreviewError::Auth("malformed authorization token"));
    };

    if sign(secret, nonce)? != signature {
        return Err(PreviewError::Auth("incorrect signature"));
    }
    Ok(())
}

/// Form body posted to a job's callback URL.
#[derive(Debug, PartialEq, Serialize)]
pub struct CallbackForm<'a> {
    pub id: &'a str,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdf: Option<&'a str>,
    /// JSON object, `{}` when there is nothing to report.
    pub metadata: String,
}

impl<'a> CallbackForm<'a> {
    pub fn new(job: &'a Job, result: &'a PreviewResult<String>) -> Result<Self> {
        let mut form = CallbackForm {
            id: &job.id,
            status: result.status().to_string(),
            thumbnail: None,
            image: None,
            pdf: None,
            metadata: "{}".to_string(),
        };
        if let PreviewResult::Done(artifacts) = result {
            form.thumbnail = artifacts.thumbnail.as_deref();
            form.image = artifacts.image.as_deref();
            form.pdf = artifacts.pdf.as_deref();
            form.metadata = serde_json::to_string(&artifacts.metadata)?;
        }
        Ok(form)
    }
}

/// Posts terminal results back to the caller. One attempt, no retries.
#[derive(Clone)]
pub struct CallbackNotifier {
    client: Client,
    secret: String,
}

impl CallbackNotifier {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .map_err(|e| PreviewError::Callback(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            secret: secret.into(),
        })
    }

    pub async fn notify(&self, job: &Job, result: &PreviewResult<String>) -> Result<()> {
        let form = CallbackForm::new(job, result)?;
        let nonce = Utc::now().timestamp_millis().to_string();

        let response = self
            .client
            .post(&job.post_back_url)
            .header(AUTHORIZATION, bearer_header(&self.secret, &nonce)?)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(job_id = %job.id, error = %e, "Unable to post the result back to the caller");
                PreviewError::Callback(e.to_string())
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(job_id = %job.id, code = status.as_u16(), body = %body, "The caller rejected the post back request");
            return Err(PreviewError::Callback(format!("caller answered {}", status)));
        }

        info!(job_id = %job.id, status = %form.status, "Posted the result back to the caller");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Artifacts;
    use axum::extract::Form;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::Router;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    const SECRET: &str = "The only secret";

    #[test]
    fn test_signature_is_deterministic() {
        let first = sign(SECRET, "1400000000000").unwrap();

        assert_eq!(first, sign(SECRET, "1400000000000").unwrap());
        assert_ne!(first, sign(SECRET, "1400000000001").unwrap());
        assert_ne!(first, sign("another secret", "1400000000000").unwrap());
        // 20 byte digest
        assert_eq!(BASE64.decode(&first).unwrap().len(), 20);
    }

    #[test]
    fn test_verify_accepts_own_headers() {
        let header = bearer_header(SECRET, "1400000000000").unwrap();

        assert!(verify(SECRET, Some(&header)).is_ok());
    }

    #[test]
    fn test_verify_rejects_bad_headers() {
        let signature = sign(SECRET, "12345").unwrap();
        let cases = [
            None,
            Some("12345:abc".to_string()),
            Some(format!("Basic 12345:{}", signature)),
            Some(format!("Bearer 12346:{}", signature)),
            Some("Bearer 12345:bm90IGl0".to_string()),
            Some(format!("Bearer 12345:{}:extra", signature)),
            Some("Bearer 12345".to_string()),
        ];

        for header in cases {
            let result = verify(SECRET, header.as_deref());
            assert!(matches!(result, Err(PreviewError::Auth(_))), "{:?}", header);
        }
        assert!(verify("wrong", Some(&format!("Bearer 12345:{}", signature))).is_err());
    }

    #[test]
    fn test_form_for_done_result() {
        let job = Job::new("42", "http://a/b.png", "http://caller/cb");
        let mut artifacts = Artifacts {
            thumbnail: Some("https://s3/thumbnail.jpg".to_string()),
            image: Some("https://s3/image.jpg".to_string()),
            ..Default::default()
        };
        artifacts.metadata.insert("youtubeId".to_string(), "abc".into());
        let result = PreviewResult::Done(artifacts);

        let form = CallbackForm::new(&job, &result).unwrap();

        assert_eq!(form.status, "done");
        assert_eq!(form.thumbnail, Some("https://s3/thumbnail.jpg"));
        assert_eq!(form.pdf, None);
        assert_eq!(form.metadata, r#"{"youtubeId":"abc"}"#);
    }

    #[test]
    fn test_form_for_failed_result_has_no_urls() {
        let job = Job::new("42", "http://a/b.png", "http://caller/cb");
        let result = PreviewResult::<String>::Error;

        let form = CallbackForm::new(&job, &result).unwrap();

        assert_eq!(
            form,
            CallbackForm {
                id: "42",
                status: "error".to_string(),
                thumbnail: None,
                image: None,
                pdf: None,
                metadata: "{}".to_string(),
            }
        );
    }

    async fn caller(status: StatusCode) -> (String, mpsc::UnboundedReceiver<(Option<String>, HashMap<String, String>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new().route(
            "/cb",
            post(move |headers: HeaderMap, Form(form): Form<HashMap<String, String>>| {
                let tx = tx.clone();
                async move {
                    let auth = headers
                        .get(AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let _ = tx.send((auth, form));
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        (format!("http://{}/cb", addr), rx)
    }

    #[tokio::test]
    async fn test_notify_posts_signed_form() {
        let (url, mut received) = caller(StatusCode::OK).await;
        let job = Job::new("doc-1", "http://a/b.pdf", url);
        let result = PreviewResult::Done(Artifacts {
            pdf: Some("https://s3/source.pdf".to_string()),
            ..Default::default()
        });

        CallbackNotifier::new(SECRET).unwrap().notify(&job, &result).await.unwrap();

        let (auth, form) = received.recv().await.unwrap();
        assert!(verify(SECRET, auth.as_deref()).is_ok());
        assert_eq!(form.get("id").map(String::as_str), Some("doc-1"));
        assert_eq!(form.get("status").map(String::as_str), Some("done"));
        assert_eq!(form.get("pdf").map(String::as_str), Some("https://s3/source.pdf"));
        assert_eq!(form.get("metadata").map(String::as_str), Some("{}"));
        assert!(!form.contains_key("thumbnail"));
    }

    #[tokio::test]
    async fn test_notify_reports_rejection() {
        let (url, _received) = caller(StatusCode::INTERNAL_SERVER_ERROR).await;
        let job = Job::new("doc-2", "http://a/b.pdf", url);

        let result = CallbackNotifier::new(SECRET)
            .unwrap()
            .notify(&job, &PreviewResult::Unsupported)
            .await;

        assert!(matches!(result, Err(PreviewError::Callback(_))));
    }
}
