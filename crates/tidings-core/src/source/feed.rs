//! RSS 2.0, RSS 1.0 and Atom parsing.

use chrono::{DateTime, Utc};
use scraper::Html;
use serde::Deserialize;
use url::Url;

use crate::error::AppError;
use crate::models::Article;

/// Any of the three feed flavours. The root element name is not checked;
/// which of the fields is populated tells them apart.
#[derive(Debug, Deserialize)]
struct FeedDocument {
    /// RSS 2.0: `<rss><channel><item>`.
    #[serde(default)]
    channel: Option<Channel>,
    /// RSS 1.0: `<rdf:RDF><item>`.
    #[serde(default)]
    item: Vec<Entry>,
    /// Atom: `<feed><entry>`.
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Debug, Default, Deserialize)]
struct Channel {
    #[serde(default)]
    item: Vec<Entry>,
}

/// Fields of an RSS item or Atom entry we care about. Every field is a list
/// so repeated or namespaced duplicates never fail the whole document.
#[derive(Debug, Default, Deserialize)]
struct Entry {
    #[serde(default)]
    title: Vec<Text>,
    #[serde(default)]
    link: Vec<Link>,
    /// RSS fallback when `<link>` is missing.
    #[serde(default)]
    guid: Vec<Text>,
    #[serde(default)]
    description: Vec<Text>,
    #[serde(default)]
    summary: Vec<Text>,
    #[serde(default)]
    content: Vec<Text>,
    #[serde(default, rename = "pubDate")]
    pub_date: Vec<Text>,
    #[serde(default)]
    published: Vec<Text>,
    #[serde(default)]
    updated: Vec<Text>,
}

#[derive(Debug, Default, Deserialize)]
struct Text {
    #[serde(default, rename = "$text")]
    value: String,
}

/// `<link>url</link>` in RSS, `<link href="url" rel="..."/>` in Atom.
#[derive(Debug, Default, Deserialize)]
struct Link {
    #[serde(default, rename = "@href")]
    href: Option<String>,
    #[serde(default, rename = "@rel")]
    rel: Option<String>,
    #[serde(default, rename = "$text")]
    text: Option<String>,
}

impl Entry {
    fn link(&self) -> Option<&str> {
        let alternate = self
            .link
            .iter()
            .filter(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .chain(self.link.iter());
        for link in alternate {
            let value = link.href.as_deref().or(link.text.as_deref()).map(str::trim);
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                return Some(value);
            }
        }
        first_text(&self.guid).filter(|g| g.starts_with("http"))
    }

    fn published(&self) -> Option<DateTime<Utc>> {
        self.pub_date
            .iter()
            .chain(&self.published)
            .chain(&self.updated)
            .find_map(|t| parse_date(t.value.trim()))
    }

    fn summary(&self) -> Option<String> {
        [&self.description, &self.summary, &self.content]
            .into_iter()
            .find_map(|texts| first_text(texts))
            .map(strip_markup)
            .filter(|s| !s.is_empty())
    }
}

fn first_text(texts: &[Text]) -> Option<&str> {
    texts
        .iter()
        .map(|t| t.value.trim())
        .find(|v| !v.is_empty())
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Feed summaries often carry HTML; keep the text only.
fn strip_markup(raw: &str) -> String {
    if !raw.contains('<') {
        return collapse_whitespace(raw);
    }
    let fragment = Html::parse_fragment(raw);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    collapse_whitespace(&text)
}

pub(crate) fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a feed into at most `limit` articles, in document order.
///
/// Items without a title or a usable link are dropped. Relative links are
/// resolved against `feed_url`.
pub fn parse_feed(
    source_id: &str,
    feed_url: &str,
    xml: &str,
    limit: usize,
) -> Result<Vec<Article>, AppError> {
    let document: FeedDocument = quick_xml::de::from_str(xml)
        .map_err(|e| AppError::ParseError(format!("{feed_url}: {e}")))?;

    let is_feed =
        document.channel.is_some() || !document.item.is_empty() || !document.entry.is_empty();
    if !is_feed {
        return Err(AppError::ParseError(format!(
            "{feed_url}: not an RSS or Atom feed"
        )));
    }

    let base = Url::parse(feed_url).ok();
    let entries = document
        .channel
        .map(|c| c.item)
        .unwrap_or_default()
        .into_iter()
        .chain(document.item)
        .chain(document.entry);

    let mut articles = Vec::new();
    for entry in entries {
        if articles.len() >= limit {
            break;
        }
        let Some(title) = first_text(&entry.title).map(collapse_whitespace) else {
            continue;
        };
        let Some(link) = entry.link() else {
            continue;
        };
        let url = match &base {
            Some(base) => match base.join(link) {
                Ok(u) => u.to_string(),
                Err(_) => continue,
            },
            None => link.to_string(),
        };

        let mut article = Article::new(source_id, title, url);
        article.summary = entry.summary();
        article.published = entry.published();
        articles.push(article);
    }

    tracing::debug!(
        source_id = %source_id,
        feed = %feed_url,
        count = articles.len(),
        "Parsed feed"
    );
    Ok(articles)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>World News</title>
    <link>https://news.example/</link>
    <atom:link href="https://news.example/rss" rel="self"/>
    <item>
      <title>First story</title>
      <link>https://news.example/world/1</link>
      <description><![CDATA[<p>Something <b>happened</b>.</p>]]></description>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Second story</title>
      <link>/world/2</link>
    </item>
    <item>
      <title>No link at all</title>
    </item>
    <item>
      <title>Third story</title>
      <guid>https://news.example/world/3</guid>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Feed</title>
  <link href="https://blog.example/"/>
  <entry>
    <title type="html">Atom entry</title>
    <link rel="edit" href="https://blog.example/edit/1"/>
    <link rel="alternate" href="https://blog.example/posts/1"/>
    <summary>Short summary</summary>
    <updated>2025-06-10T12:30:00Z</updated>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss() {
        let articles = parse_feed("world", "https://news.example/rss", RSS, 10).unwrap();
        assert_eq!(articles.len(), 3);

        assert_eq!(articles[0].title, "First story");
        assert_eq!(articles[0].summary.as_deref(), Some("Something happened ."));
        assert!(articles[0].published.is_some());

        assert_eq!(articles[1].url, "https://news.example/world/2");
        assert_eq!(articles[2].url, "https://news.example/world/3");
        assert!(articles.iter().all(|a| a.source_id == "world"));
    }

    #[test]
    fn test_parse_atom_prefers_alternate_link() {
        let articles = parse_feed("blog", "https://blog.example/atom", ATOM, 10).unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].url, "https://blog.example/posts/1");
        assert_eq!(articles[0].summary.as_deref(), Some("Short summary"));
        assert_eq!(
            articles[0].published.map(|d| d.to_rfc3339()),
            Some("2025-06-10T12:30:00+00:00".to_string())
        );
    }

    #[test]
    fn test_limit_is_respected_in_order() {
        let articles = parse_feed("world", "https://news.example/rss", RSS, 2).unwrap();
        let titles: Vec<_> = articles.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, ["First story", "Second story"]);
    }

    #[test]
    fn test_html_page_is_not_a_feed() {
        let err = parse_feed(
            "x",
            "https://x.example/",
            "<html><body><p>hi</p></body></html>",
            10,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::ParseError(msg) if msg.contains("not an RSS")));
    }

    #[test]
    fn test_empty_channel_is_an_empty_feed() {
        let xml = "<rss><channel><title>Quiet</title></channel></rss>";
        assert!(parse_feed("q", "https://q.example/rss", xml, 10).unwrap().is_empty());
    }
}
