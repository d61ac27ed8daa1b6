//! Source factory and batch scheduler: the composition root.
//!
//! Shared services are built once and passed in, never looked up globally,
//! so every test gets fresh pools.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerPool, CircuitBreakerStats, CircuitState};
use crate::config::{BatchConfig, EngineConfig};
use crate::error::{AppError, panic_message};
use crate::models::{Article, SourceDescriptor};
use crate::policy::CrawlPolicyManager;
use crate::rate_limiter::{RateLimiterPool, RateLimiterStats, TokenBucket};
use crate::registry::SourceRegistry;
use crate::retry::{RetryExecutor, UrlFallbackExecutor};
use crate::skip::{Outcome, SkipRecord, SkipSummary, SkipTracker};
use crate::source::{NewsSource, SourceClient};
use crate::timeout_tracker::{TimeoutStats, TimeoutTracker};
use crate::traits::TransportProvider;

pub const DISCOVER_OPERATION: &str = "discover_articles";

/// Skip records kept across runs in [`Services::skips`].
pub const SKIP_HISTORY_LIMIT: usize = 1_000;

/// Process-wide services, constructed once at startup.
pub struct Services {
    pub breakers: CircuitBreakerPool,
    pub limiters: RateLimiterPool,
    pub timeouts: Arc<TimeoutTracker>,
    pub policy: Arc<CrawlPolicyManager>,
    /// Recent skips of every run, oldest dropped first.
    pub skips: Arc<SkipTracker>,
    pub retry: RetryExecutor,
    pub batch: BatchConfig,
}

impl Services {
    pub fn new(config: &EngineConfig) -> Self {
        let skips = Arc::new(SkipTracker::bounded(SKIP_HISTORY_LIMIT));
        Self {
            breakers: CircuitBreakerPool::new(config.circuit_breaker.clone()),
            limiters: RateLimiterPool::new(config.rate_limit.clone()),
            timeouts: Arc::new(TimeoutTracker::new(config.timeout.clone())),
            policy: Arc::new(CrawlPolicyManager::new(config.policy.clone())),
            retry: RetryExecutor::new(config.retry.clone(), Arc::clone(&skips)),
            skips,
            batch: config.batch.clone(),
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

/// A source wired to its own breaker and rate limiter.
///
/// Every call takes a token, then goes through the breaker. An open breaker
/// rejects without touching the source.
#[derive(Clone)]
pub struct SourceHandle {
    source: Arc<dyn NewsSource>,
    breaker: CircuitBreaker,
    limiter: Arc<TokenBucket>,
}

impl SourceHandle {
    pub fn new(
        source: Arc<dyn NewsSource>,
        breaker: CircuitBreaker,
        limiter: Arc<TokenBucket>,
    ) -> Self {
        Self {
            source,
            breaker,
            limiter,
        }
    }

    pub fn id(&self) -> &str {
        self.source.id()
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        self.source.descriptor()
    }

    pub fn discovery_endpoints(&self) -> Vec<String> {
        self.source.discovery_endpoints()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Discover from one endpoint. Never yields more than `count` articles.
    pub async fn discover_from(
        &self,
        endpoint: &str,
        count: usize,
    ) -> Result<Vec<Article>, AppError> {
        self.limiter.acquire().await;
        let mut articles = self
            .breaker
            .call(|| self.source.discover_from(endpoint, count))
            .await?;
        articles.truncate(count);
        Ok(articles)
    }

    /// Raw HTML of one article.
    pub async fn fetch_content(&self, article: &Article) -> Result<String, AppError> {
        self.limiter.acquire().await;
        Ok(self
            .breaker
            .call(|| self.source.fetch_content(article))
            .await?)
    }
}

/// Events emitted during a batch for monitoring/logging.
#[derive(Debug, Clone)]
pub enum BatchEvent<'a> {
    Started {
        run_id: Uuid,
        sources: usize,
        max_parallel: usize,
    },
    SourceStarted {
        source_id: &'a str,
    },
    SourceCompleted {
        source_id: &'a str,
        articles: usize,
    },
    SourceSkipped {
        record: &'a SkipRecord,
    },
    Finished {
        run_id: Uuid,
        completed: usize,
        skipped: usize,
        elapsed: Duration,
    },
}

/// Receives batch events (decoupled logging).
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBatchReporter;

impl BatchReporter for TracingBatchReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::Started {
                run_id,
                sources,
                max_parallel,
            } => {
                tracing::info!(%run_id, sources, max_parallel, "Batch started");
            }
            BatchEvent::SourceStarted { source_id } => {
                tracing::debug!(%source_id, "Source task started");
            }
            BatchEvent::SourceCompleted {
                source_id,
                articles,
            } => {
                tracing::info!(%source_id, articles, "Source completed");
            }
            BatchEvent::SourceSkipped { record } => {
                tracing::warn!(
                    source_id = %record.source_id,
                    kind = %record.error_kind,
                    attempts = record.attempts_made,
                    reason = %record.reason,
                    "Source skipped"
                );
            }
            BatchEvent::Finished {
                run_id,
                completed,
                skipped,
                elapsed,
            } => {
                tracing::info!(
                    %run_id,
                    completed,
                    skipped,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch finished"
                );
            }
        }
    }
}

/// Result of one batch run: an outcome for every requested id.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub outcomes: BTreeMap<String, Outcome<Vec<Article>>>,
}

impl BatchReport {
    /// Articles per source. Skipped sources map to an empty list.
    pub fn articles(&self) -> BTreeMap<String, Vec<Article>> {
        self.outcomes
            .iter()
            .map(|(id, outcome)| {
                let articles = outcome.as_completed().cloned().unwrap_or_default();
                (id.clone(), articles)
            })
            .collect()
    }

    /// Skips of this run, grouped by source.
    pub fn skip_report(&self) -> BTreeMap<String, Vec<SkipRecord>> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| outcome.skipped().map(|r| (id.clone(), vec![r.clone()])))
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_completed()).count()
    }

    pub fn total_articles(&self) -> usize {
        self.outcomes
            .values()
            .filter_map(Outcome::as_completed)
            .map(Vec::len)
            .sum()
    }

    pub fn summary(&self) -> SkipSummary {
        SkipSummary::from_records(self.outcomes.values().filter_map(Outcome::skipped))
    }
}

/// Creates source handles and runs batches over them.
pub struct SourceFactory<P: TransportProvider> {
    registry: SourceRegistry<P::Transport>,
    provider: P,
    services: Services,
    handles: Mutex<HashMap<String, SourceHandle>>,
    last_run: Mutex<Arc<SkipTracker>>,
}

impl<P: TransportProvider> SourceFactory<P> {
    pub fn new(registry: SourceRegistry<P::Transport>, provider: P, services: Services) -> Self {
        Self {
            registry,
            provider,
            services,
            handles: Mutex::new(HashMap::new()),
            last_run: Mutex::new(Arc::new(SkipTracker::new())),
        }
    }

    pub fn registry(&self) -> &SourceRegistry<P::Transport> {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn discover_sources(&self) -> BTreeSet<String> {
        self.registry.discover_sources()
    }

    pub fn validate_sources(&self) -> BTreeMap<String, Vec<String>> {
        self.registry.validate_sources()
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<String, SourceHandle>> {
        self.handles.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned source handle cache");
            poisoned.into_inner()
        })
    }

    fn lock_last_run(&self) -> MutexGuard<'_, Arc<SkipTracker>> {
        self.last_run.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned run skip tracker");
            poisoned.into_inner()
        })
    }

    /// Handle for `id`, created on first use and cached afterwards.
    ///
    /// Each source gets its own transport session from the provider.
    pub fn create_source(&self, id: &str) -> Result<SourceHandle, AppError> {
        if let Some(handle) = self.lock_handles().get(id) {
            return Ok(handle.clone());
        }

        let descriptor = self.registry.lookup(id)?;
        let transport = self.provider.session(id)?;
        let client = SourceClient::new(
            id,
            transport,
            Arc::clone(&self.services.policy),
            Arc::clone(&self.services.timeouts),
            descriptor.timeout_secs.map(Duration::from_secs),
        );
        let limiter =
            self.services
                .limiters
                .get_or_create(id, descriptor.rate_limit, descriptor.burst);
        let source = self.registry.build(id, client)?;
        let handle = SourceHandle::new(source, self.services.breakers.get(id), limiter);

        tracing::debug!(source_id = %id, "Created source handle");
        Ok(self
            .lock_handles()
            .entry(id.to_string())
            .or_insert(handle)
            .clone())
    }

    /// Discover up to `count` articles from each source, at most
    /// `max_parallel` sources at a time.
    pub async fn batch_discover(
        &self,
        ids: &[String],
        count: usize,
        max_parallel: usize,
    ) -> BatchReport {
        self.batch_discover_with(
            ids,
            count,
            max_parallel,
            &CancellationToken::new(),
            &TracingBatchReporter,
        )
        .await
    }

    /// [`batch_discover`](Self::batch_discover) with cancellation and a
    /// custom reporter.
    ///
    /// Once `cancel` fires no further source task starts; those ids come
    /// back as `Cancelled` skips. Tasks already running finish on their own.
    /// Every requested id appears in the report exactly once.
    pub async fn batch_discover_with<R: BatchReporter>(
        &self,
        ids: &[String],
        count: usize,
        max_parallel: usize,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> BatchReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("batch", %run_id);
        self.run_batch(run_id, ids, count, max_parallel, cancel, reporter)
            .instrument(span)
            .await
    }

    async fn run_batch<R: BatchReporter>(
        &self,
        run_id: Uuid,
        ids: &[String],
        count: usize,
        max_parallel: usize,
        cancel: &CancellationToken,
        reporter: &R,
    ) -> BatchReport {
        let started = tokio::time::Instant::now();
        let max_parallel = max_parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(max_parallel));

        let mut requested = BTreeSet::new();
        let ids: Vec<&String> = ids.iter().filter(|id| requested.insert(id.as_str())).collect();
        reporter.report(BatchEvent::Started {
            run_id,
            sources: ids.len(),
            max_parallel,
        });

        let run_skips = Arc::new(SkipTracker::new());
        let retry = self.services.retry.with_skips(Arc::clone(&run_skips));
        let mut outcomes = BTreeMap::new();
        let mut tasks: Vec<(String, JoinHandle<Outcome<Vec<Article>>>)> = Vec::new();

        for id in ids {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let record = SkipRecord::cancelled(id.as_str(), DISCOVER_OPERATION);
                outcomes.insert(id.clone(), self.skip(record, &run_skips, reporter));
                continue;
            };

            let handle = match self.create_source(id) {
                Ok(handle) => handle,
                Err(e) => {
                    let record = SkipRecord::new(id.as_str(), DISCOVER_OPERATION, &e, 0);
                    outcomes.insert(id.clone(), self.skip(record, &run_skips, reporter));
                    continue;
                }
            };

            reporter.report(BatchEvent::SourceStarted { source_id: id });
            let fallback = UrlFallbackExecutor::new(retry.clone());
            let task = async move {
                let _permit = permit;
                let endpoints = handle.discovery_endpoints();
                fallback
                    .execute(
                        &endpoints,
                        |endpoint| {
                            let handle = handle.clone();
                            async move { handle.discover_from(&endpoint, count).await }
                        },
                        DISCOVER_OPERATION,
                        handle.id(),
                    )
                    .await
            };
            tasks.push((id.clone(), tokio::spawn(task.in_current_span())));
        }

        for (id, task) in tasks {
            let outcome = match task.await {
                Ok(Outcome::Completed(articles)) => {
                    reporter.report(BatchEvent::SourceCompleted {
                        source_id: &id,
                        articles: articles.len(),
                    });
                    Outcome::Completed(articles)
                }
                Ok(Outcome::Skipped(record)) => {
                    reporter.report(BatchEvent::SourceSkipped { record: &record });
                    Outcome::Skipped(record)
                }
                Err(join_error) => {
                    let message = if join_error.is_panic() {
                        format!("panicked: {}", panic_message(&*join_error.into_panic()))
                    } else {
                        "task aborted".to_string()
                    };
                    tracing::error!(source_id = %id, %message, "Source task failed");
                    let error = AppError::SourceError {
                        source_id: id.clone(),
                        message,
                    };
                    let record = SkipRecord::new(id.as_str(), DISCOVER_OPERATION, &error, 1);
                    self.skip(record, &run_skips, reporter)
                }
            };
            outcomes.insert(id, outcome);
        }

        let report = BatchReport { run_id, outcomes };
        reporter.report(BatchEvent::Finished {
            run_id,
            completed: report.completed(),
            skipped: report.outcomes.len() - report.completed(),
            elapsed: started.elapsed(),
        });

        self.services.skips.absorb(&run_skips);
        *self.lock_last_run() = run_skips;
        report
    }

    /// Record a skip made here rather than inside the retry executor.
    fn skip<R: BatchReporter>(
        &self,
        record: SkipRecord,
        run_skips: &SkipTracker,
        reporter: &R,
    ) -> Outcome<Vec<Article>> {
        run_skips.record(record.clone());
        reporter.report(BatchEvent::SourceSkipped { record: &record });
        Outcome::Skipped(record)
    }

    pub fn get_all_circuit_states(&self) -> BTreeMap<String, CircuitState> {
        self.services.breakers.all_states()
    }

    pub fn get_all_circuit_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.services.breakers.all_stats()
    }

    pub fn get_all_rate_limiter_stats(&self) -> BTreeMap<String, RateLimiterStats> {
        self.services.limiters.all_stats()
    }

    pub fn get_all_timeout_stats(&self) -> BTreeMap<String, TimeoutStats> {
        self.services.timeouts.stats()
    }

    /// Skips of the most recent batch, grouped by source.
    ///
    /// Earlier runs are in [`Services::skips`].
    pub fn skip_report(&self) -> BTreeMap<String, Vec<SkipRecord>> {
        self.lock_last_run().by_source()
    }

    pub fn reset_circuits(&self) {
        self.services.breakers.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::ErrorKind;
    use crate::retry::RetryConfig;
    use crate::registry::SourceBuilder;
    use crate::testutil::{ConcurrencyGauge, MockProvider, MockSource, MockTransport};

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn factory(sources: Vec<MockSource>, config: EngineConfig) -> SourceFactory<MockProvider> {
        let mut registry = SourceRegistry::<MockTransport>::new();
        for source in sources {
            source.register(&mut registry);
        }
        SourceFactory::new(registry, MockProvider::default(), Services::new(&config))
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.rate_limit.default_rate = 100.0;
        config.retry = RetryConfig {
            jitter: false,
            ..Default::default()
        };
        config
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<String>>,
    }

    impl BatchReporter for RecordingReporter {
        fn report(&self, event: BatchEvent<'_>) {
            let line = match event {
                BatchEvent::Started { .. } => "started".to_string(),
                BatchEvent::SourceStarted { source_id } => format!("start:{source_id}"),
                BatchEvent::SourceCompleted { source_id, .. } => format!("done:{source_id}"),
                BatchEvent::SourceSkipped { record } => format!("skip:{}", record.source_id),
                BatchEvent::Finished { .. } => "finished".to_string(),
            };
            self.events.lock().unwrap().push(line);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_source_resolves_to_empty_list() {
        let ok = MockSource::new("ok_source");
        let failing = MockSource::new("always_fails_source")
            .failing(|| AppError::NetworkError("connection refused".into()));
        let factory = factory(vec![ok, failing.clone()], fast_config());

        let report = factory
            .batch_discover(&ids(&["ok_source", "always_fails_source"]), 10, 2)
            .await;

        let articles = report.articles();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles["ok_source"].len(), 10);
        assert!(articles["always_fails_source"].is_empty());

        let skips = report.skip_report();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips["always_fails_source"].len(), 1);
        assert_eq!(skips["always_fails_source"][0].attempts_made, 2);
        assert_eq!(failing.calls(), 2);
        assert_eq!(factory.skip_report()["always_fails_source"].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_report_covers_latest_run_only() {
        let flaky = MockSource::new("flaky").failing(|| AppError::Timeout(30));
        let factory = factory(vec![flaky, MockSource::new("steady")], fast_config());

        factory.batch_discover(&ids(&["flaky"]), 1, 1).await;
        assert_eq!(factory.skip_report()["flaky"].len(), 1);

        let second = factory.batch_discover(&ids(&["steady"]), 1, 1).await;
        assert!(second.skip_report().is_empty());
        assert!(factory.skip_report().is_empty());
        assert_eq!(factory.services().skips.for_source("flaky").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_parallel() {
        let gauge = ConcurrencyGauge::default();
        let sources: Vec<MockSource> = (0..6)
            .map(|i| {
                MockSource::new(&format!("s{i}"))
                    .with_delay(Duration::from_secs(1))
                    .with_gauge(gauge.clone())
            })
            .collect();
        let factory = factory(sources, fast_config());
        let requested = ids(&["s0", "s1", "s2", "s3", "s4", "s5"]);

        let report = factory.batch_discover(&requested, 3, 2).await;

        assert_eq!(report.completed(), 6);
        assert_eq!(report.total_articles(), 18);
        assert_eq!(gauge.peak(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_without_calling_source() {
        let mut config = fast_config();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let flaky = MockSource::new("flaky").failing(|| AppError::SourceError {
            source_id: "flaky".into(),
            message: "bad markup".into(),
        });
        let factory = factory(vec![flaky.clone()], config);
        let requested = ids(&["flaky"]);

        factory.batch_discover(&requested, 5, 1).await;
        assert_eq!(factory.get_all_circuit_states()["flaky"], CircuitState::Open);
        assert_eq!(flaky.calls(), 1);

        let report = factory.batch_discover(&requested, 5, 1).await;
        let record = report.outcomes["flaky"].skipped().unwrap();
        assert_eq!(record.error_kind, ErrorKind::CircuitOpen);
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_source_is_isolated() {
        let factory = factory(
            vec![MockSource::new("boom").panicking(), MockSource::new("fine")],
            fast_config(),
        );

        let report = factory.batch_discover(&ids(&["boom", "fine"]), 4, 2).await;

        let record = report.outcomes["boom"].skipped().unwrap();
        assert_eq!(record.error_kind, ErrorKind::SourceLogic);
        assert!(record.reason.contains("blew up"), "{}", record.reason);
        assert_eq!(report.articles()["fine"].len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_builder_is_isolated() {
        let mut registry = SourceRegistry::<MockTransport>::new();
        MockSource::new("fine").register(&mut registry);
        let builder: SourceBuilder<MockTransport> =
            Arc::new(
                |_: SourceDescriptor, _: SourceClient<MockTransport>| -> Arc<dyn NewsSource> {
                    panic!("constructor blew up")
                },
            );
        registry.register_code(MockSource::new("bad").descriptor().clone(), builder);
        let factory = SourceFactory::new(
            registry,
            MockProvider::default(),
            Services::new(&fast_config()),
        );

        let report = factory.batch_discover(&ids(&["bad", "fine"]), 2, 2).await;

        let record = report.outcomes["bad"].skipped().unwrap();
        assert_eq!(record.error_kind, ErrorKind::SourceLogic);
        assert!(record.reason.contains("constructor blew up"), "{}", record.reason);
        assert_eq!(report.articles()["fine"].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_duplicate_ids() {
        let factory = factory(vec![MockSource::new("known")], fast_config());

        let report = factory
            .batch_discover(&ids(&["known", "missing", "known"]), 1, 4)
            .await;

        assert_eq!(report.outcomes.len(), 2);
        let record = report.outcomes["missing"].skipped().unwrap();
        assert_eq!(record.error_kind, ErrorKind::Configuration);
        assert_eq!(record.attempts_made, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_endpoint_used() {
        let source = MockSource::new("multi")
            .with_endpoints(ids(&["https://multi.example/a.xml", "https://multi.example/b.xml"]))
            .failing_on("https://multi.example/a.xml");
        let factory = factory(vec![source], fast_config());

        let report = factory.batch_discover(&ids(&["multi"]), 2, 1).await;

        let articles = &report.articles()["multi"];
        assert_eq!(articles.len(), 2);
        assert!(articles[0].url.starts_with("https://multi.example/b.xml"));
        assert!(report.skip_report().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_starts_nothing_new() {
        let sources = vec![
            MockSource::new("a").with_delay(Duration::from_secs(5)),
            MockSource::new("b"),
            MockSource::new("c"),
        ];
        let factory = factory(sources, fast_config());
        let cancel = CancellationToken::new();
        let reporter = RecordingReporter::default();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let report = factory
            .batch_discover_with(&ids(&["a", "b", "c"]), 1, 1, &cancel, &reporter)
            .await;

        assert!(report.outcomes["a"].is_completed());
        for id in ["b", "c"] {
            let record = report.outcomes[id].skipped().unwrap();
            assert_eq!(record.error_kind, ErrorKind::Cancelled);
        }
        let events = reporter.events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("started"));
        assert!(!events.contains(&"start:b".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_source_caches_handle_and_session() {
        let factory = factory(vec![MockSource::new("one")], fast_config());

        let first = factory.create_source("one").unwrap();
        let second = factory.create_source("one").unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(factory.provider.sessions(), ["one"]);
        assert!(factory.get_all_rate_limiter_stats().contains_key("one"));
        assert!(factory.create_source("two").is_err());
    }
}
