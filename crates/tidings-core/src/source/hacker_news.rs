//! Hacker News through its public Firebase JSON API.

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;

use super::{NewsSource, SourceClient};
use crate::error::AppError;
use crate::models::{Article, DiscoveryMethod, SourceDescriptor};
use crate::traits::Transport;

pub const HACKER_NEWS_ID: &str = "hacker_news";
const DEFAULT_API_BASE: &str = "https://hacker-news.firebaseio.com/v0";
const SITE: &str = "https://news.ycombinator.com";

#[derive(Debug, Deserialize)]
struct Item {
    id: u64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    dead: bool,
    #[serde(default)]
    deleted: bool,
}

/// Top stories: the id list first, then one request per item.
///
/// `custom_config.api_base` overrides the API root.
pub struct HackerNewsSource<T> {
    descriptor: SourceDescriptor,
    client: SourceClient<T>,
}

impl<T: Transport> HackerNewsSource<T> {
    pub fn new(descriptor: SourceDescriptor, client: SourceClient<T>) -> Self {
        Self { descriptor, client }
    }

    pub fn default_descriptor() -> SourceDescriptor {
        SourceDescriptor::new(HACKER_NEWS_ID, SITE, DiscoveryMethod::Html)
            .with_display_name("Hacker News")
            .with_category("technology")
    }

    fn api_base(&self) -> &str {
        self.descriptor
            .custom_str("api_base")
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
    }

    fn to_article(&self, item: Item) -> Option<Article> {
        if item.dead || item.deleted {
            return None;
        }
        let title = item.title.filter(|t| !t.trim().is_empty())?;
        let url = item
            .url
            .unwrap_or_else(|| format!("{SITE}/item?id={}", item.id));

        let mut article = Article::new(&self.descriptor.id, title.trim(), url);
        article.summary = item.text.filter(|t| !t.is_empty());
        article.published = item.time.and_then(|t| DateTime::from_timestamp(t, 0));
        Some(article)
    }
}

#[async_trait]
impl<T: Transport> NewsSource for HackerNewsSource<T> {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn discovery_endpoints(&self) -> Vec<String> {
        vec![self.api_base().to_string()]
    }

    async fn discover_from(&self, endpoint: &str, count: usize) -> Result<Vec<Article>, AppError> {
        let endpoint = endpoint.trim_end_matches('/');
        let ids: Vec<u64> = self
            .client
            .get_json(&format!("{endpoint}/topstories.json"))
            .await?;

        let mut articles = Vec::with_capacity(count.min(ids.len()));
        for id in ids {
            if articles.len() >= count {
                break;
            }
            // Items come back as JSON `null` once purged.
            let item: Option<Item> = self
                .client
                .get_json(&format!("{endpoint}/item/{id}.json"))
                .await?;
            if let Some(article) = item.and_then(|i| self.to_article(i)) {
                articles.push(article);
            }
        }
        Ok(articles)
    }

    async fn fetch_content(&self, article: &Article) -> Result<String, AppError> {
        self.client.get_text(&article.url).await
    }
}
