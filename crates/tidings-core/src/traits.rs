use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;
use crate::models::Article;

/// A raw HTTP response, whatever its status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub body: String,
    /// Server-declared wait from a `Retry-After` header.
    pub retry_after: Option<Duration>,
    /// Time spent waiting for this response.
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn new(status: u16, url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            url: url.into(),
            body: body.into(),
            retry_after: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Performs a single GET. Implementations must not retry or throttle;
/// that is the crawl-policy manager's job.
pub trait Transport: Send + Sync + Clone + 'static {
    fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<HttpResponse, AppError>> + Send;
}

/// Hands out one reusable transport session per source.
pub trait TransportProvider: Send + Sync + 'static {
    type Transport: Transport;

    fn session(&self, source_id: &str) -> Result<Self::Transport, AppError>;
}

/// Converts fetched HTML into Markdown. CPU-bound; run it off the fetch pool.
pub trait MarkdownConverter: Send + Sync + Clone + 'static {
    fn convert(&self, html: &str, source_url: &str) -> Result<String, AppError>;
}

/// Remote media URL to local path.
pub type MediaMap = BTreeMap<String, PathBuf>;

/// Downloads media referenced by an article into its output directory.
pub trait MediaProcessor: Send + Sync + Clone + 'static {
    fn process(
        &self,
        markdown: &str,
        output_dir: &Path,
    ) -> impl Future<Output = Result<MediaMap, AppError>> + Send;
}

/// Persists a converted article. Returns the path actually written.
pub trait ArticleWriter: Send + Sync + Clone + 'static {
    fn write(
        &self,
        article: &Article,
        markdown: &str,
        media: &MediaMap,
        output_dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, AppError>> + Send;
}

/// A MediaProcessor that downloads nothing.
#[derive(Debug, Clone, Default)]
pub struct NullMediaProcessor;

impl MediaProcessor for NullMediaProcessor {
    async fn process(&self, _markdown: &str, _output_dir: &Path) -> Result<MediaMap, AppError> {
        Ok(MediaMap::new())
    }
}
