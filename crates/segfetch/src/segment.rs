//! Segment descriptors, downloads and routes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use url::Url;

use crate::decryption::DecryptionKey;
use crate::error::DownloadError;

/// Connection-pooling domain of a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Route {
    pub fn from_url(url: &Url) -> Result<Self, DownloadError> {
        let host = url
            .host_str()
            .ok_or_else(|| DownloadError::invalid_url(url.as_str(), "URL has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| DownloadError::invalid_url(url.as_str(), "URL has no known port"))?;
        Ok(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Per-request settings attached to a segment.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Whole-transfer retries; falls back to the manager default when `None`
    pub retry_count: Option<u32>,
    /// Retry interval attached to the request context, preferred over `Retry-After`
    pub retry_interval: Option<Duration>,
    /// Extra headers, applied on top of the engine defaults
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// One segment to fetch: where from, where to, and how to decrypt it.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub uri: Url,
    pub dest: PathBuf,
    pub key: Option<Arc<DecryptionKey>>,
    pub request: Arc<RequestConfig>,
}

impl SegmentDescriptor {
    pub fn new(uri: Url, dest: impl Into<PathBuf>) -> Self {
        Self {
            uri,
            dest: dest.into(),
            key: None,
            request: Arc::new(RequestConfig::default()),
        }
    }

    pub fn with_key(mut self, key: Arc<DecryptionKey>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_request(mut self, request: Arc<RequestConfig>) -> Self {
        self.request = request;
        self
    }

    pub fn route(&self) -> Result<Route, DownloadError> {
        Route::from_url(&self.uri)
    }
}

/// A logical download: all segments of one playlist.
#[derive(Debug, Clone)]
pub struct MediaDownload {
    pub id: String,
    pub source: Url,
    pub segments: Vec<SegmentDescriptor>,
}

impl MediaDownload {
    pub fn new(id: impl Into<String>, source: Url, segments: Vec<SegmentDescriptor>) -> Self {
        Self {
            id: id.into(),
            source,
            segments,
        }
    }

    /// Route used for grouping; the playlist source decides where segments live.
    pub fn route(&self) -> Result<Route, DownloadError> {
        Route::from_url(&self.source)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}
