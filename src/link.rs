//! Link reachability and iframe embeddability.
//!
//! A link is resolved by walking its redirect chain by hand, one GET per hop,
//! so every intermediate response can be inspected. A link is embeddable on a
//! protocol when the chain resolves and no hop either forbids framing or
//! silently moves to another protocol.

use crate::error::{PreviewError, Result};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::LOCATION;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Redirect chains longer than this are treated as unreachable.
pub const MAX_REDIRECTS: usize = 10;

pub const HOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Some servers only send `X-Frame-Options` to browsers.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_9_1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/32.0.1700.77 Safari/537.36";

/// One response in a redirect chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// URL the request was sent to.
    pub url: Url,
    pub status: u16,
    pub location: Option<String>,
    pub frame_options: bool,
}

/// Outcome of walking a redirect chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub reachable: bool,
    pub trace: Vec<Hop>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Embeddability {
    pub http: bool,
    pub https: bool,
}

/// Issues a single GET without following redirects.
///
/// `cookies` is shared by all hops of one resolution.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn fetch(&self, url: &Url, cookies: &Arc<Jar>) -> Result<Hop>;
}

/// [`HttpProbe`] backed by reqwest.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestProbe;

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn fetch(&self, url: &Url, cookies: &Arc<Jar>) -> Result<Hop> {
        // No connection reuse between hops; only the cookie jar carries over.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(HOP_TIMEOUT)
            .user_agent(BROWSER_USER_AGENT)
            .cookie_provider(Arc::clone(cookies))
            .build()
            .map_err(PreviewError::download)?;

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(PreviewError::download)?;

        let headers = response.headers();
        Ok(Hop {
            url: response.url().clone(),
            status: response.status().as_u16(),
            location: headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned),
            frame_options: headers.contains_key("x-frame-options"),
        })
    }
}

pub struct LinkResolver<P = ReqwestProbe> {
    probe: P,
}

impl LinkResolver<ReqwestProbe> {
    pub fn new() -> Self {
        Self {
            probe: ReqwestProbe,
        }
    }
}

impl Default for LinkResolver<ReqwestProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: HttpProbe> LinkResolver<P> {
    pub fn with_probe(probe: P) -> Self {
        Self { probe }
    }

    /// Follows the redirect chain starting at `url`.
    ///
    /// Never fails: loops, overly long chains, error statuses and transport
    /// failures all come back as an unreachable resolution carrying the hops
    /// recorded so far.
    pub async fn resolve(&self, url: Url) -> Resolution {
        let cookies = Arc::new(Jar::default());
        let mut trace: Vec<Hop> = Vec::new();
        let mut next = url;

        loop {
            if trace.iter().any(|hop| hop.url == next) {
                debug!(url = %next, hops = trace.len(), "Redirect loop detected");
                return Resolution::unreachable(trace);
            }
            if trace.len() >= MAX_REDIRECTS {
                debug!(url = %next, "Too many redirects");
                return Resolution::unreachable(trace);
            }

            let hop = match self.probe.fetch(&next, &cookies).await {
                Ok(hop) => hop,
                Err(e) => {
                    debug!(url = %next, error = %e, "Link is not reachable");
                    return Resolution::unreachable(trace);
                }
            };
            let status = hop.status;
            let redirect = hop.location.as_deref().map(|location| hop.url.join(location));
            trace.push(hop);

            if status >= 400 {
                return Resolution::unreachable(trace);
            }
            next = match redirect {
                None => return Resolution { reachable: true, trace },
                Some(Ok(url)) => url,
                Some(Err(e)) => {
                    debug!(error = %e, "Unparseable Location header");
                    return Resolution::unreachable(trace);
                }
            };
        }
    }

    /// Whether `url` can be framed by a page served over `protocol`.
    pub async fn is_embeddable_on(&self, url: &Url, protocol: Protocol) -> bool {
        let mut url = url.clone();
        if url.set_scheme(protocol.scheme()).is_err() {
            return false;
        }

        let resolution = self.resolve(url).await;
        resolution.reachable
            && resolution
                .trace
                .iter()
                .all(|hop| !hop.frame_options && hop.url.scheme() == protocol.scheme())
    }

    pub async fn embeddability(&self, url: &Url) -> Embeddability {
        Embeddability {
            http: self.is_embeddable_on(url, Protocol::Http).await,
            https: self.is_embeddable_on(url, Protocol::Https).await,
        }
    }
}

impl Resolution {
    fn unreachable(trace: Vec<Hop>) -> Self {
        Self {
            reachable: false,
            trace,
        }
    }
}

/// Extracts the video id from a YouTube watch link (`youtube.com/watch?v=<id>`)
/// or short link (`youtu.be/<id>`).
pub fn youtube_id(url: &Url) -> Option<String> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let id = match url.host_str()? {
        "youtube.com" | "www.youtube.com" | "m.youtube.com" if url.path().starts_with("/watch") => url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned()),
        "youtu.be" => Some(url.path().trim_start_matches('/').to_string()),
        _ => None,
    };
    id.filter(|id| !id.is_empty())
}

/// Fixed-path still for a YouTube video, served from `base`
/// (normally `http://img.youtube.com`).
pub fn youtube_thumbnail_url(base: &str, id: &str) -> String {
    format!("{}/vi/{}/hqdefault.jpg", base.trim_end_matches('/'), id)
}
