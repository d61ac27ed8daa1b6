use std::sync::Arc;

use htmd::HtmlToMarkdown;
use tidings_core::error::AppError;
use tidings_core::traits::MarkdownConverter;

const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg", "form",
];

/// Article HTML to Markdown using htmd.
///
/// Page chrome (navigation, footers, scripts, forms) is dropped. A page that
/// converts to nothing is an error rather than an empty article.
#[derive(Clone)]
pub struct HtmdConverter {
    converter: Arc<HtmlToMarkdown>,
}

impl HtmdConverter {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(SKIPPED_TAGS.to_vec())
            .build();
        Self {
            converter: Arc::new(converter),
        }
    }
}

impl Default for HtmdConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownConverter for HtmdConverter {
    fn convert(&self, html: &str, source_url: &str) -> Result<String, AppError> {
        let markdown = self
            .converter
            .convert(html)
            .map_err(|e| AppError::CleanerError(format!("{source_url}: {e}")))?;

        let markdown = markdown.trim();
        if markdown.is_empty() {
            return Err(AppError::CleanerError(format!(
                "{source_url}: no content after conversion"
            )));
        }
        Ok(format!("{markdown}\n"))
    }
}
