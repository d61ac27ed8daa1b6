pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod factory;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod skip;
pub mod source;
pub mod timeout_tracker;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerPool, CircuitState};
pub use config::{BatchConfig, EngineConfig};
pub use error::{AppError, ErrorKind};
pub use factory::{
    BatchEvent, BatchReport, BatchReporter, Services, SourceFactory, SourceHandle,
    TracingBatchReporter,
};
pub use models::{Article, DiscoveryMethod, SourceDescriptor};
pub use pipeline::{ArticleOutcome, ContentPipeline, article_output_dir};
pub use policy::{CrawlPolicyManager, PolicyConfig};
pub use rate_limiter::{RateLimitConfig, RateLimiterPool, TokenBucket};
pub use registry::{SourceBuilder, SourceRegistry, builtin_sources};
pub use retry::{RetryConfig, RetryExecutor, UrlFallbackExecutor};
pub use skip::{Outcome, SkipRecord, SkipSummary, SkipTracker};
pub use source::{NewsSource, SourceClient};
pub use timeout_tracker::{TimeoutConfig, TimeoutTracker};
pub use traits::{
    ArticleWriter, HttpResponse, MarkdownConverter, MediaMap, MediaProcessor, NullMediaProcessor,
    Transport, TransportProvider,
};
