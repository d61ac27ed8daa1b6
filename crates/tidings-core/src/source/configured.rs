use async_trait::async_trait;
use url::Url;

use super::feed::parse_feed;
use super::listing::{ListingRules, parse_listing};
use super::{NewsSource, SourceClient};
use crate::error::AppError;
use crate::models::{Article, DiscoveryMethod, SourceDescriptor};
use crate::traits::Transport;

/// A source defined entirely by its descriptor: RSS/Atom feeds or an HTML
/// listing page with CSS selectors.
pub struct ConfiguredSource<T> {
    descriptor: SourceDescriptor,
    client: SourceClient<T>,
    base_host: Option<String>,
}

impl<T: Transport> ConfiguredSource<T> {
    pub fn new(descriptor: SourceDescriptor, client: SourceClient<T>) -> Self {
        let base_host = Url::parse(&descriptor.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        Self {
            descriptor,
            client,
            base_host,
        }
    }

    fn limit(&self, count: usize) -> usize {
        self.descriptor
            .max_articles
            .map_or(count, |max| max.min(count))
    }
}

#[async_trait]
impl<T: Transport> NewsSource for ConfiguredSource<T> {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn discover_from(&self, endpoint: &str, count: usize) -> Result<Vec<Article>, AppError> {
        let limit = self.limit(count);
        let body = self.client.get_text(endpoint).await?;

        match self.descriptor.discovery_method {
            DiscoveryMethod::Rss => parse_feed(&self.descriptor.id, endpoint, &body, limit),
            DiscoveryMethod::Html => parse_listing(
                &self.descriptor.id,
                endpoint,
                &body,
                ListingRules {
                    selectors: &self.descriptor.article_selectors,
                    skip_patterns: &self.descriptor.skip_patterns,
                    base_host: self.base_host.as_deref(),
                    limit,
                },
            ),
        }
    }

    async fn fetch_content(&self, article: &Article) -> Result<String, AppError> {
        self.client.get_text(&article.url).await
    }
}
