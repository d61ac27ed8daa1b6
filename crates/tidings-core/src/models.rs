use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// How a source finds its articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Rss,
    Html,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Rss => "rss",
            DiscoveryMethod::Html => "html",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rss" | "atom" | "feed" => Ok(DiscoveryMethod::Rss),
            "html" => Ok(DiscoveryMethod::Html),
            _ => Err(format!("Unknown discovery method: {s}")),
        }
    }
}

/// Static description of a news source.
///
/// Loaded once from a declarative definition file or supplied by a
/// code-defined source, then shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_discovery_method")]
    pub discovery_method: DiscoveryMethod,
    /// RSS/Atom endpoints, tried in order.
    #[serde(default)]
    pub feed_urls: Vec<String>,
    /// CSS selectors matching article links on an HTML listing page.
    #[serde(default)]
    pub article_selectors: Vec<String>,
    /// Links containing any of these substrings are ignored.
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    /// Requests per second.
    #[serde(default)]
    pub rate_limit: Option<f64>,
    /// Token bucket capacity; defaults to the rate rounded up.
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_articles: Option<usize>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub custom_config: serde_json::Map<String, serde_json::Value>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_discovery_method() -> DiscoveryMethod {
    DiscoveryMethod::Rss
}

fn default_enabled() -> bool {
    true
}

impl SourceDescriptor {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        discovery_method: DiscoveryMethod,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            base_url: base_url.into(),
            category: default_category(),
            discovery_method,
            feed_urls: Vec::new(),
            article_selectors: Vec::new(),
            skip_patterns: Vec::new(),
            rate_limit: None,
            burst: None,
            timeout_secs: None,
            max_articles: None,
            enabled: true,
            custom_config: serde_json::Map::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_feed_urls(mut self, urls: Vec<String>) -> Self {
        self.feed_urls = urls;
        self
    }

    pub fn with_article_selectors(mut self, selectors: Vec<String>) -> Self {
        self.article_selectors = selectors;
        self
    }

    pub fn with_skip_patterns(mut self, patterns: Vec<String>) -> Self {
        self.skip_patterns = patterns;
        self
    }

    pub fn with_rate_limit(mut self, requests_per_sec: f64) -> Self {
        self.rate_limit = Some(requests_per_sec);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Check required fields. Returns every problem found, not just the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id is required".to_string());
        } else if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            errors.push(format!(
                "id '{}' may only contain ASCII letters, digits, '-' and '_'",
                self.id
            ));
        }

        if self.display_name.trim().is_empty() {
            errors.push("display_name is required".to_string());
        }

        if self.base_url.trim().is_empty() {
            errors.push("base_url is required".to_string());
        } else if let Err(e) = parse_http_url(&self.base_url) {
            errors.push(format!("base_url: {e}"));
        }

        for feed in &self.feed_urls {
            if let Err(e) = parse_http_url(feed) {
                errors.push(format!("feed_urls: {e}"));
            }
        }

        if self.discovery_method == DiscoveryMethod::Html {
            for selector in &self.article_selectors {
                if scraper::Selector::parse(selector).is_err() {
                    errors.push(format!("article_selectors: invalid selector '{selector}'"));
                }
            }
        }

        if let Some(rate) = self.rate_limit
            && !(rate.is_finite() && rate > 0.0)
        {
            errors.push(format!("rate_limit must be a positive number, got {rate}"));
        }

        if self.burst == Some(0) {
            errors.push("burst must be at least 1".to_string());
        }

        if self.timeout_secs == Some(0) {
            errors.push("timeout_secs must be at least 1".to_string());
        }

        errors
    }

    /// Endpoints discovery starts from, in preference order.
    pub fn discovery_endpoints(&self) -> Vec<String> {
        match self.discovery_method {
            DiscoveryMethod::Rss if !self.feed_urls.is_empty() => self.feed_urls.clone(),
            _ => vec![self.base_url.clone()],
        }
    }

    /// Look up a string in `custom_config`.
    pub fn custom_str(&self, key: &str) -> Option<&str> {
        self.custom_config.get(key).and_then(|v| v.as_str())
    }
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL '{raw}': {e}"))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(format!("URL scheme '{scheme}' is not allowed in '{raw}'")),
    }
    if url.host_str().is_none() {
        return Err(format!("URL '{raw}' has no host"));
    }
    Ok(url)
}

/// An article discovered by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub source_id: String,
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    /// Publication time as declared by the source, when it declares one.
    pub published: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl Article {
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            url: url.into(),
            summary: None,
            published: None,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SourceDescriptor {
        SourceDescriptor::new("npr", "https://text.npr.org", DiscoveryMethod::Html)
            .with_display_name("NPR Text")
            .with_article_selectors(vec!["a.topic-title".into()])
    }

    #[test]
    fn test_valid_descriptor_has_no_errors() {
        assert!(valid().validate().is_empty());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut d = valid();
        d.display_name = String::new();
        d.base_url = "ftp://example.com".into();
        d.rate_limit = Some(-1.0);

        let errors = d.validate();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("display_name")));
        assert!(errors.iter().any(|e| e.contains("not allowed")));
        assert!(errors.iter().any(|e| e.contains("rate_limit")));
    }

    #[test]
    fn test_validate_rejects_bad_selector_and_id() {
        let mut d = valid();
        d.id = "has space".into();
        d.article_selectors = vec!["a[".into()];

        let errors = d.validate();
        assert!(errors.iter().any(|e| e.contains("may only contain")));
        assert!(errors.iter().any(|e| e.contains("invalid selector")));
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let d: SourceDescriptor = serde_json::from_str(
            r#"{"id": "bbc", "display_name": "BBC", "base_url": "https://bbc.co.uk",
                "feed_urls": ["https://feeds.bbci.co.uk/news/rss.xml"],
                "custom_config": {"region": "uk"}}"#,
        )
        .unwrap();

        assert_eq!(d.discovery_method, DiscoveryMethod::Rss);
        assert_eq!(d.category, "general");
        assert!(d.enabled);
        assert_eq!(d.custom_str("region"), Some("uk"));
        assert_eq!(
            d.discovery_endpoints(),
            vec!["https://feeds.bbci.co.uk/news/rss.xml".to_string()]
        );
    }

    #[test]
    fn test_html_endpoints_fall_back_to_base_url() {
        let d = valid().with_feed_urls(vec!["https://text.npr.org/feed".into()]);
        assert_eq!(d.discovery_endpoints(), vec!["https://text.npr.org".to_string()]);
    }

    #[test]
    fn test_discovery_method_parse() {
        assert_eq!("RSS".parse::<DiscoveryMethod>().unwrap(), DiscoveryMethod::Rss);
        assert_eq!("atom".parse::<DiscoveryMethod>().unwrap(), DiscoveryMethod::Rss);
        assert_eq!("html".parse::<DiscoveryMethod>().unwrap(), DiscoveryMethod::Html);
        assert!("gopher".parse::<DiscoveryMethod>().is_err());
    }
}
