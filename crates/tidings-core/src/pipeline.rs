//! Content pipeline: fetch → convert → media → write, per discovered article.
//!
//! Fetching runs on the fetch pool (bounded by `max_parallel`). Conversion is
//! CPU-bound and runs on `spawn_blocking` behind its own semaphore, so a task
//! never holds a permit of one pool while waiting on the other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::BatchConfig;
use crate::error::AppError;
use crate::factory::{BatchReport, SourceFactory, SourceHandle};
use crate::models::Article;
use crate::retry::RetryExecutor;
use crate::skip::{Outcome, SkipRecord, SkipTracker};
use crate::traits::{
    ArticleWriter, MarkdownConverter, MediaMap, MediaProcessor, TransportProvider,
};

pub const FETCH_OPERATION: &str = "fetch_content";
pub const CONVERT_OPERATION: &str = "convert";
pub const WRITE_OPERATION: &str = "write_article";

/// Where an article's files go: `root/<source_id>/<index:03>`.
pub fn article_output_dir(root: &Path, source_id: &str, index: usize) -> PathBuf {
    root.join(source_id).join(format!("{index:03}"))
}

/// What happened to one article.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleOutcome {
    pub source_id: String,
    /// 1-based position within the source's discovery results.
    pub index: usize,
    pub url: String,
    pub outcome: Outcome<PathBuf>,
}

#[derive(Clone)]
struct Stages<C, M, W> {
    converter: C,
    media: M,
    writer: W,
    processing: Arc<Semaphore>,
    retry: RetryExecutor,
}

struct ArticleJob {
    handle: SourceHandle,
    article: Article,
    output_dir: PathBuf,
}

/// Turns a [`BatchReport`] into written articles.
pub struct ContentPipeline<C, M, W> {
    converter: C,
    media: M,
    writer: W,
    output_root: PathBuf,
    fetch_permits: Arc<Semaphore>,
    processing_permits: Arc<Semaphore>,
}

impl<C, M, W> ContentPipeline<C, M, W>
where
    C: MarkdownConverter,
    M: MediaProcessor,
    W: ArticleWriter,
{
    pub fn new(
        converter: C,
        media: M,
        writer: W,
        output_root: impl Into<PathBuf>,
        batch: &BatchConfig,
    ) -> Self {
        Self {
            converter,
            media,
            writer,
            output_root: output_root.into(),
            fetch_permits: Arc::new(Semaphore::new(batch.max_parallel.max(1))),
            processing_permits: Arc::new(Semaphore::new(batch.processing_workers.max(1))),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Process every article of every completed source in `report`.
    ///
    /// Skipped sources contribute nothing. Each failed article becomes a
    /// skip record; the rest carry on.
    pub async fn run<P: TransportProvider>(
        &self,
        factory: &SourceFactory<P>,
        report: &BatchReport,
        cancel: &CancellationToken,
    ) -> Vec<ArticleOutcome> {
        let run_skips = Arc::new(SkipTracker::new());
        let stages = Stages {
            converter: self.converter.clone(),
            media: self.media.clone(),
            writer: self.writer.clone(),
            processing: Arc::clone(&self.processing_permits),
            retry: factory.services().retry.with_skips(Arc::clone(&run_skips)),
        };

        let mut results = Vec::new();
        let mut tasks: Vec<(ArticleOutcome, JoinHandle<Outcome<PathBuf>>)> = Vec::new();

        for (source_id, outcome) in &report.outcomes {
            let Some(articles) = outcome.as_completed() else {
                continue;
            };
            let handle = match factory.create_source(source_id) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::warn!(source_id = %source_id, error = %e, "No handle for source");
                    for (position, article) in articles.iter().enumerate() {
                        let record = SkipRecord::new(source_id.as_str(), FETCH_OPERATION, &e, 0);
                        stages.retry.skips().record(record.clone());
                        let index = position + 1;
                        results.push(skipped_article(source_id, index, article, record));
                    }
                    None
                }
            };
            let Some(handle) = handle else {
                continue;
            };

            for (position, article) in articles.iter().enumerate() {
                let index = position + 1;
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = Arc::clone(&self.fetch_permits).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    let record = SkipRecord::cancelled(source_id.as_str(), FETCH_OPERATION);
                    stages.retry.skips().record(record.clone());
                    results.push(skipped_article(source_id, index, article, record));
                    continue;
                };

                let job = ArticleJob {
                    handle: handle.clone(),
                    article: article.clone(),
                    output_dir: article_output_dir(&self.output_root, source_id, index),
                };
                let span = tracing::info_span!("article", source_id = %source_id, index);
                let task = tokio::spawn(process(job, stages.clone(), permit).instrument(span));
                let meta = ArticleOutcome {
                    source_id: source_id.clone(),
                    index,
                    url: article.url.clone(),
                    outcome: Outcome::Completed(PathBuf::new()),
                };
                tasks.push((meta, task));
            }
        }

        for (mut meta, task) in tasks {
            meta.outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    let error = AppError::SourceError {
                        source_id: meta.source_id.clone(),
                        message: format!("article task failed: {join_error}"),
                    };
                    tracing::error!(source_id = %meta.source_id, url = %meta.url, %error);
                    skip(&stages, &meta.source_id, FETCH_OPERATION, &error)
                }
            };
            results.push(meta);
        }

        results.sort_by(|a, b| {
            (a.source_id.as_str(), a.index).cmp(&(b.source_id.as_str(), b.index))
        });
        let written = results.iter().filter(|r| r.outcome.is_completed()).count();
        tracing::info!(
            articles = results.len(),
            written,
            skipped = results.len() - written,
            "Content pipeline finished"
        );
        factory.services().skips.absorb(&run_skips);
        results
    }
}

fn skipped_article(
    source_id: &str,
    index: usize,
    article: &Article,
    record: SkipRecord,
) -> ArticleOutcome {
    ArticleOutcome {
        source_id: source_id.to_string(),
        index,
        url: article.url.clone(),
        outcome: Outcome::Skipped(record),
    }
}

async fn process<C, M, W>(
    job: ArticleJob,
    stages: Stages<C, M, W>,
    fetch_permit: OwnedSemaphorePermit,
) -> Outcome<PathBuf>
where
    C: MarkdownConverter,
    M: MediaProcessor,
    W: ArticleWriter,
{
    let ArticleJob {
        handle,
        article,
        output_dir,
    } = job;
    let source_id = handle.id().to_string();

    // 1. Fetch
    let fetched = stages
        .retry
        .execute(|| handle.fetch_content(&article), FETCH_OPERATION, &source_id)
        .await;
    drop(fetch_permit);
    let html = match fetched {
        Outcome::Completed(html) => html,
        Outcome::Skipped(record) => return Outcome::Skipped(record),
    };
    tracing::debug!(url = %article.url, bytes = html.len(), "Fetched article");

    // 2. Convert, on the processing pool
    let markdown = match convert(&stages, html, article.url.clone()).await {
        Ok(markdown) => markdown,
        Err(e) => return skip(&stages, &source_id, CONVERT_OPERATION, &e),
    };

    // 3. Media. A failure here costs the images, not the article.
    let media = match stages.media.process(&markdown, &output_dir).await {
        Ok(media) => media,
        Err(e) => {
            tracing::warn!(url = %article.url, error = %e, "Media processing failed");
            MediaMap::new()
        }
    };

    // 4. Write
    match stages
        .writer
        .write(&article, &markdown, &media, &output_dir)
        .await
    {
        Ok(path) => {
            tracing::info!(url = %article.url, path = %path.display(), "Article written");
            Outcome::Completed(path)
        }
        Err(e) => skip(&stages, &source_id, WRITE_OPERATION, &e),
    }
}

async fn convert<C, M, W>(
    stages: &Stages<C, M, W>,
    html: String,
    url: String,
) -> Result<String, AppError>
where
    C: MarkdownConverter,
{
    let _permit = Arc::clone(&stages.processing)
        .acquire_owned()
        .await
        .map_err(|_| AppError::Cancelled)?;
    let converter = stages.converter.clone();
    tokio::task::spawn_blocking(move || converter.convert(&html, &url))
        .await
        .map_err(|e| AppError::CleanerError(format!("Conversion task failed: {e}")))?
}

fn skip<C, M, W>(
    stages: &Stages<C, M, W>,
    source_id: &str,
    operation: &str,
    error: &AppError,
) -> Outcome<PathBuf> {
    let record = SkipRecord::new(source_id, operation, error, 1);
    stages.retry.skips().record(record.clone());
    Outcome::Skipped(record)
}
