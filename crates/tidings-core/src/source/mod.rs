//! News sources: the capability every source implements, and the HTTP
//! handle sources fetch through.

mod configured;
mod feed;
mod hacker_news;
mod listing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::models::{Article, SourceDescriptor};
use crate::policy::CrawlPolicyManager;
use crate::timeout_tracker::TimeoutTracker;
use crate::traits::{HttpResponse, Transport};

pub use configured::ConfiguredSource;
pub use feed::parse_feed;
pub use hacker_news::HackerNewsSource;
pub use listing::{DEFAULT_ARTICLE_SELECTOR, ListingRules, parse_listing};

/// What the engine needs from a source.
///
/// Implementations only describe *how* to find and fetch articles. Rate
/// limiting, circuit breaking, retries and robots.txt are applied around
/// them by the factory and by [`SourceClient`].
#[async_trait]
pub trait NewsSource: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Endpoints discovery may start from, in preference order.
    fn discovery_endpoints(&self) -> Vec<String> {
        self.descriptor().discovery_endpoints()
    }

    /// Discover up to `count` articles from one endpoint.
    async fn discover_from(&self, endpoint: &str, count: usize) -> Result<Vec<Article>, AppError>;

    /// Discover up to `count` articles, trying each endpoint in turn.
    async fn discover_articles(&self, count: usize) -> Result<Vec<Article>, AppError> {
        let mut last_error = None;
        for endpoint in self.discovery_endpoints() {
            match self.discover_from(&endpoint, count).await {
                Ok(articles) => return Ok(articles),
                Err(e) => {
                    tracing::debug!(
                        source_id = %self.id(),
                        endpoint = %endpoint,
                        error = %e,
                        "Discovery endpoint failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::ConfigError(format!("Source '{}' has no discovery endpoints", self.id()))
        }))
    }

    /// Raw HTML of the article page.
    async fn fetch_content(&self, article: &Article) -> Result<String, AppError>;
}

/// Per-source HTTP handle.
///
/// Picks the timeout (tracker recommendation, then the source's own, then
/// the default), goes through the crawl-policy manager and feeds successful
/// response times back into the tracker.
#[derive(Clone)]
pub struct SourceClient<T> {
    source_id: String,
    transport: T,
    policy: Arc<CrawlPolicyManager>,
    timeouts: Arc<TimeoutTracker>,
    configured_timeout: Option<Duration>,
}

impl<T: Transport> SourceClient<T> {
    pub fn new(
        source_id: impl Into<String>,
        transport: T,
        policy: Arc<CrawlPolicyManager>,
        timeouts: Arc<TimeoutTracker>,
        configured_timeout: Option<Duration>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            transport,
            policy,
            timeouts,
            configured_timeout,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn current_timeout(&self) -> Duration {
        self.timeouts
            .timeout_for(&self.source_id, self.configured_timeout)
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, AppError> {
        let timeout = self.current_timeout();
        let response = self.policy.fetch(&self.transport, url, timeout).await?;
        self.timeouts
            .record_response_time(&self.source_id, response.elapsed);
        Ok(response)
    }

    pub async fn get_text(&self, url: &str) -> Result<String, AppError> {
        Ok(self.get(url).await?.body)
    }

    pub async fn get_json<D: DeserializeOwned>(&self, url: &str) -> Result<D, AppError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body)
            .map_err(|e| AppError::ParseError(format!("Invalid JSON from {url}: {e}")))
    }
}
