use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tidings_core::error::AppError;
use tidings_core::models::Article;
use tidings_core::traits::{ArticleWriter, MediaMap};

pub const ARTICLE_FILE: &str = "index.md";

/// Writes each article as `index.md` in its output directory.
///
/// The file starts with a short header (title, source, link, dates). Media
/// links found in the map are rewritten to the local paths.
#[derive(Debug, Clone, Default)]
pub struct FsArticleWriter;

impl FsArticleWriter {
    pub fn new() -> Self {
        Self
    }
}

impl ArticleWriter for FsArticleWriter {
    async fn write(
        &self,
        article: &Article,
        markdown: &str,
        media: &MediaMap,
        output_dir: &Path,
    ) -> Result<PathBuf, AppError> {
        tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
            AppError::StorageError(format!("Cannot create {}: {e}", output_dir.display()))
        })?;

        let path = output_dir.join(ARTICLE_FILE);
        let document = render(article, markdown, media, output_dir);
        tokio::fs::write(&path, document)
            .await
            .map_err(|e| AppError::StorageError(format!("Cannot write {}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "Wrote article");
        Ok(path)
    }
}

fn render(article: &Article, markdown: &str, media: &MediaMap, output_dir: &Path) -> String {
    let mut out = String::with_capacity(markdown.len() + 256);
    // Writing to a String cannot fail.
    let _ = writeln!(out, "# {}\n", article.title);
    let _ = writeln!(out, "- Source: {}", article.source_id);
    let _ = writeln!(out, "- Link: <{}>", article.url);
    if let Some(published) = article.published {
        let _ = writeln!(out, "- Published: {}", published.to_rfc3339());
    }
    let _ = writeln!(out, "- Retrieved: {}\n", article.discovered_at.to_rfc3339());

    let mut body = markdown.to_string();
    for (remote, local) in media {
        let local = local.strip_prefix(output_dir).unwrap_or(local);
        body = body.replace(remote.as_str(), &local.display().to_string());
    }
    out.push_str(&body);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}
