//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability,
//! allowing test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::{Article, DiscoveryMethod, SourceDescriptor};
use crate::registry::SourceRegistry;
use crate::source::NewsSource;
use crate::traits::{
    ArticleWriter, HttpResponse, MarkdownConverter, MediaMap, Transport, TransportProvider,
};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Call {
    url: String,
    at: Instant,
    timeout: Duration,
}

#[derive(Debug)]
enum Route {
    Response(HttpResponse),
    ConnectionRefused,
}

#[derive(Debug, Default)]
struct TransportState {
    queued: HashMap<String, VecDeque<Result<HttpResponse, AppError>>>,
    routes: HashMap<String, Route>,
    calls: Vec<Call>,
    latency: Duration,
}

/// Transport answering from a per-URL script.
///
/// Queued results are consumed first, then the fixed route applies.
/// Unrouted URLs answer 404.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, url: impl Into<String>, response: HttpResponse) -> Self {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.into(), Route::Response(response));
        self
    }

    pub fn with_body(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        let url = url.into();
        let response = HttpResponse::new(200, url.clone(), body);
        self.with_response(url, response)
    }

    pub fn with_status(self, url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        let response = HttpResponse::new(status, url.clone(), "");
        self.with_response(url, response)
    }

    /// Every request to `url` fails with a connection error.
    pub fn with_error(self, url: impl Into<String>) -> Self {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(url.into(), Route::ConnectionRefused);
        self
    }

    /// Every request takes `latency` before it answers.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().unwrap().latency = latency;
        self
    }

    /// One-shot result for the next request to `url`.
    pub fn push(self, url: impl Into<String>, result: Result<HttpResponse, AppError>) -> Self {
        self.state
            .lock()
            .unwrap()
            .queued
            .entry(url.into())
            .or_default()
            .push_back(result);
        self
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.url == url)
            .count()
    }

    pub fn call_times(&self, url: &str) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.url == url)
            .map(|c| c.at)
            .collect()
    }

    pub fn last_timeout(&self, url: &str) -> Option<Duration> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .rev()
            .find(|c| c.url == url)
            .map(|c| c.timeout)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

impl MockTransport {
    fn answer(&self, url: &str, timeout: Duration) -> (Result<HttpResponse, AppError>, Duration) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            url: url.to_string(),
            at: Instant::now(),
            timeout,
        });
        let latency = state.latency;

        if let Some(queue) = state.queued.get_mut(url)
            && let Some(result) = queue.pop_front()
        {
            return (result, latency);
        }

        let result = match state.routes.get(url) {
            Some(Route::Response(response)) => Ok(response.clone()),
            Some(Route::ConnectionRefused) => {
                Err(AppError::NetworkError(format!("connection refused: {url}")))
            }
            None => Ok(HttpResponse::new(404, url, "")),
        };
        (result, latency)
    }
}

impl Transport for MockTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, AppError> {
        let (result, latency) = self.answer(url, timeout);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        result
    }
}

/// Hands every source the same [`MockTransport`].
#[derive(Clone, Default)]
pub struct MockProvider {
    pub transport: MockTransport,
    sessions: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            sessions: Arc::default(),
        }
    }

    /// Source ids a session was requested for, in order.
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.lock().unwrap().clone()
    }
}

impl TransportProvider for MockProvider {
    type Transport = MockTransport;

    fn session(&self, source_id: &str) -> Result<MockTransport, AppError> {
        self.sessions.lock().unwrap().push(source_id.to_string());
        Ok(self.transport.clone())
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> AppError + Send + Sync>;

/// Tracks how many calls run at once.
#[derive(Clone, Default)]
pub struct ConcurrencyGauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Source with scripted discovery.
///
/// By default every endpoint yields 100 articles, more than any test asks
/// for, so truncation to the requested count is observable.
#[derive(Clone)]
pub struct MockSource {
    descriptor: SourceDescriptor,
    available: usize,
    failure: Option<ErrorFactory>,
    failing_endpoints: Vec<String>,
    panics: bool,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    gauge: ConcurrencyGauge,
}

impl MockSource {
    pub fn new(id: &str) -> Self {
        Self {
            descriptor: SourceDescriptor::new(
                id,
                format!("https://{id}.example"),
                DiscoveryMethod::Rss,
            ),
            available: 100,
            failure: None,
            failing_endpoints: Vec::new(),
            panics: false,
            delay: Duration::ZERO,
            calls: Arc::default(),
            gauge: ConcurrencyGauge::default(),
        }
    }

    pub fn with_articles(mut self, available: usize) -> Self {
        self.available = available;
        self
    }

    /// Every call fails with the error `make` builds.
    pub fn failing(mut self, make: impl Fn() -> AppError + Send + Sync + 'static) -> Self {
        self.failure = Some(Arc::new(make));
        self
    }

    pub fn failing_on(mut self, endpoint: &str) -> Self {
        self.failing_endpoints.push(endpoint.to_string());
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.descriptor.feed_urls = endpoints;
        self
    }

    pub fn with_gauge(mut self, gauge: ConcurrencyGauge) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn with_descriptor(mut self, descriptor: SourceDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// `discover_from` invocations so far, across clones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Register this mock as a code-defined source.
    pub fn register(self, registry: &mut SourceRegistry<MockTransport>) {
        let descriptor = self.descriptor.clone();
        registry.register_code(
            descriptor,
            Arc::new(
                move |_: SourceDescriptor, _: crate::source::SourceClient<MockTransport>| {
                    Arc::new(self.clone()) as Arc<dyn NewsSource>
                },
            ),
        );
    }
}

#[async_trait]
impl NewsSource for MockSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn discover_from(&self, endpoint: &str, _count: usize) -> Result<Vec<Article>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.gauge.exit();

        if self.panics {
            panic!("mock source '{}' blew up", self.descriptor.id);
        }
        if self.failing_endpoints.iter().any(|e| e == endpoint) {
            return Err(AppError::HttpStatus {
                status: 500,
                url: endpoint.to_string(),
            });
        }
        if let Some(make) = &self.failure {
            return Err(make());
        }

        let id = &self.descriptor.id;
        Ok((0..self.available)
            .map(|i| Article::new(id, format!("{id} story {i}"), format!("{endpoint}/story/{i}")))
            .collect())
    }

    async fn fetch_content(&self, article: &Article) -> Result<String, AppError> {
        if let Some(make) = &self.failure {
            return Err(make());
        }
        Ok(format!(
            "<html><body><h1>{}</h1><p>Body.</p></body></html>",
            article.title
        ))
    }
}

// ---------------------------------------------------------------------------
// MockConverter / MockMedia / MockWriter
// ---------------------------------------------------------------------------

/// Converter that prefixes the input, or fails on HTML containing a marker.
#[derive(Clone, Default)]
pub struct MockConverter {
    fail_marker: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl MockConverter {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MarkdownConverter for MockConverter {
    fn convert(&self, html: &str, source_url: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker
            && html.contains(marker.as_str())
        {
            return Err(AppError::CleanerError(format!("cannot convert {source_url}")));
        }
        Ok(format!("md:{html}"))
    }
}

/// Writer that records what it was asked to write.
#[derive(Clone, Default)]
pub struct MockWriter {
    writes: Arc<Mutex<Vec<(Article, String, PathBuf)>>>,
    fail: bool,
}

impl MockWriter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn writes(&self) -> Vec<(Article, String, PathBuf)> {
        self.writes.lock().unwrap().clone()
    }
}

impl ArticleWriter for MockWriter {
    async fn write(
        &self,
        article: &Article,
        markdown: &str,
        _media: &MediaMap,
        output_dir: &Path,
    ) -> Result<PathBuf, AppError> {
        if self.fail {
            return Err(AppError::StorageError("disk full".into()));
        }
        let path = output_dir.join("index.md");
        self.writes
            .lock()
            .unwrap()
            .push((article.clone(), markdown.to_string(), path.clone()));
        Ok(path)
    }
}
