//! Article discovery from an HTML listing page.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::feed::collapse_whitespace;
use crate::error::AppError;
use crate::models::Article;

pub const DEFAULT_ARTICLE_SELECTOR: &str = "article a[href]";

/// What to pick from a listing page.
#[derive(Debug, Clone, Copy)]
pub struct ListingRules<'a> {
    pub selectors: &'a [String],
    pub skip_patterns: &'a [String],
    /// Links whose host is neither this nor a subdomain of it are dropped.
    pub base_host: Option<&'a str>,
    pub limit: usize,
}

/// Collect article links matching the rules, in page order.
///
/// Links are resolved against `page_url`, de-duplicated by absolute URL and
/// titled by their text, falling back to the `title` attribute.
pub fn parse_listing(
    source_id: &str,
    page_url: &str,
    html: &str,
    rules: ListingRules<'_>,
) -> Result<Vec<Article>, AppError> {
    let page = Url::parse(page_url)
        .map_err(|e| AppError::ConfigError(format!("Invalid listing URL {page_url}: {e}")))?;

    let selectors = compile_selectors(rules.selectors)?;
    let document = Html::parse_document(html);
    let base_host = rules.base_host.map(strip_www);

    let mut seen = HashSet::new();
    let mut articles = Vec::new();

    'selectors: for selector in &selectors {
        for element in document.select(selector) {
            if articles.len() >= rules.limit {
                break 'selectors;
            }
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Ok(resolved) = page.join(href) else {
                continue;
            };
            if !matches!(resolved.scheme(), "http" | "https") {
                continue;
            }
            if let Some(base) = base_host
                && !same_site(&resolved, base)
            {
                continue;
            }

            let mut url = resolved;
            url.set_fragment(None);
            let url = url.to_string();
            if rules.skip_patterns.iter().any(|p| url.contains(p.as_str())) {
                continue;
            }
            if !seen.insert(url.clone()) {
                continue;
            }

            let Some(title) = link_title(&element) else {
                continue;
            };
            articles.push(Article::new(source_id, title, url));
        }
    }

    tracing::debug!(
        source_id = %source_id,
        page = %page_url,
        count = articles.len(),
        "Parsed listing"
    );
    Ok(articles)
}

fn compile_selectors(raw: &[String]) -> Result<Vec<Selector>, AppError> {
    if raw.is_empty() {
        return Selector::parse(DEFAULT_ARTICLE_SELECTOR)
            .map(|s| vec![s])
            .map_err(|e| AppError::ConfigError(format!("Invalid selector: {e}")));
    }
    raw.iter()
        .map(|s| {
            Selector::parse(s)
                .map_err(|e| AppError::ConfigError(format!("Invalid selector '{s}': {e}")))
        })
        .collect()
}

fn link_title(element: &ElementRef<'_>) -> Option<String> {
    let text = collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "));
    if !text.is_empty() {
        return Some(text);
    }
    element
        .value()
        .attr("title")
        .map(collapse_whitespace)
        .filter(|t| !t.is_empty())
}

fn strip_www(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn same_site(url: &Url, base: &str) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = strip_www(host);
    host == base || host.ends_with(&format!(".{base}"))
}
