//! Crawl-policy management: robots.txt caching, per-domain crawl delay
//! and backoff on 429/503.
//!
//! [`CrawlPolicyManager`] is the only component that issues the literal
//! network call for a source. Everything above it (breaker, limiter, retry
//! executor) decides *whether* to call; this module decides *when* and
//! handles the server telling us to slow down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use robotstxt::DefaultMatcher;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use url::Url;

use crate::error::AppError;
use crate::traits::{HttpResponse, Transport};

/// How long a fetched policy stays valid.
pub const POLICY_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Token matched against `User-agent:` lines in robots.txt.
    pub user_agent: String,
    pub ttl: Duration,
    /// Minimum gap between two requests to one domain, whatever robots.txt says.
    pub min_delay: Duration,
    /// Retries after the first attempt on 429/503.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// A server-declared wait longer than this is not honored; the request
    /// fails as throttled instead.
    pub max_backoff: Duration,
    pub policy_timeout: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            user_agent: "TidingsBot".to_string(),
            ttl: POLICY_TTL,
            min_delay: Duration::from_secs(1),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            policy_timeout: Duration::from_secs(10),
        }
    }
}

/// Parsed access policy for one domain.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    domain: String,
    /// Raw robots.txt. `None` means everything is allowed.
    content: Option<String>,
    crawl_delay: Option<f64>,
    fetched_at: Instant,
}

impl AccessPolicy {
    pub fn allow_all(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            content: None,
            crawl_delay: None,
            fetched_at: Instant::now(),
        }
    }

    pub fn from_robots(domain: impl Into<String>, content: String, user_agent: &str) -> Self {
        let crawl_delay = parse_crawl_delay(&content, user_agent);
        Self {
            domain: domain.into(),
            content: Some(content),
            crawl_delay,
            fetched_at: Instant::now(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Declared crawl delay in seconds for the agent this policy was parsed for.
    pub fn crawl_delay(&self) -> Option<f64> {
        self.crawl_delay
    }

    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        match &self.content {
            None => true,
            Some(body) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(body, user_agent, url)
            }
        }
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() >= ttl
    }
}

/// Result of [`CrawlPolicyManager::can_fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

pub struct CrawlPolicyManager {
    config: PolicyConfig,
    cache: RwLock<HashMap<String, Arc<AccessPolicy>>>,
    /// One robots.txt fetch at a time per domain.
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Earliest instant the next request to each domain may start.
    next_slot: Mutex<HashMap<String, Instant>>,
    policy_fetches: AtomicU64,
}

impl CrawlPolicyManager {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
            fetch_locks: Mutex::new(HashMap::new()),
            next_slot: Mutex::new(HashMap::new()),
            policy_fetches: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Number of robots.txt documents fetched so far.
    pub fn policy_fetches(&self) -> u64 {
        self.policy_fetches.load(Ordering::Relaxed)
    }

    /// Policy for the domain of `url`, from cache when younger than the TTL.
    ///
    /// A missing robots.txt (4xx) allows everything. So does one that cannot
    /// be fetched; that result is cached too, so a dead policy endpoint is
    /// not retried on every request.
    pub async fn get_policy<T: Transport>(
        &self,
        transport: &T,
        url: &str,
    ) -> Result<Arc<AccessPolicy>, AppError> {
        let domain = domain_key(url)
            .ok_or_else(|| AppError::ConfigError(format!("Invalid URL: {url}")))?;

        if let Some(policy) = self.fresh_policy(&domain).await {
            return Ok(policy);
        }

        let lock = Arc::clone(
            self.fetch_locks
                .lock()
                .await
                .entry(domain.clone())
                .or_default(),
        );
        let _fetching = lock.lock().await;

        // Another request may have fetched it while we queued.
        if let Some(policy) = self.fresh_policy(&domain).await {
            return Ok(policy);
        }
        self.enforce_delay(&domain, None).await;
        if let Some(policy) = self.fresh_policy(&domain).await {
            return Ok(policy);
        }

        let robots_url = format!("{domain}/robots.txt");
        self.policy_fetches.fetch_add(1, Ordering::Relaxed);

        let policy = match transport.get(&robots_url, self.config.policy_timeout).await {
            Ok(response) if response.is_success() => {
                AccessPolicy::from_robots(&domain, response.body, &self.config.user_agent)
            }
            Ok(response) if (400..500).contains(&response.status) => {
                tracing::debug!(domain = %domain, status = response.status, "No robots.txt");
                AccessPolicy::allow_all(&domain)
            }
            Ok(response) => {
                tracing::warn!(
                    domain = %domain,
                    status = response.status,
                    "robots.txt unavailable, allowing all"
                );
                AccessPolicy::allow_all(&domain)
            }
            Err(e) => {
                tracing::warn!(
                    domain = %domain,
                    error = %e,
                    "robots.txt fetch failed, allowing all"
                );
                AccessPolicy::allow_all(&domain)
            }
        };

        let policy = Arc::new(policy);
        self.cache
            .write()
            .await
            .insert(domain, Arc::clone(&policy));
        Ok(policy)
    }

    async fn fresh_policy(&self, domain: &str) -> Option<Arc<AccessPolicy>> {
        self.cache
            .read()
            .await
            .get(domain)
            .filter(|policy| !policy.is_stale(self.config.ttl))
            .cloned()
    }

    pub async fn can_fetch<T: Transport>(
        &self,
        transport: &T,
        url: &str,
    ) -> Result<PolicyDecision, AppError> {
        let policy = self.get_policy(transport, url).await?;
        Ok(if policy.is_allowed(url, &self.config.user_agent) {
            PolicyDecision {
                allowed: true,
                reason: "allowed".to_string(),
            }
        } else {
            PolicyDecision {
                allowed: false,
                reason: format!(
                    "robots.txt for {} disallows {}",
                    policy.domain(),
                    self.config.user_agent
                ),
            }
        })
    }

    /// Wait until `max(crawl_delay, min_delay)` has passed since the last
    /// request to `domain`, then claim the slot.
    ///
    /// The slot is reserved under the lock and the sleep happens outside it,
    /// so concurrent callers for one domain queue up one delay apart while
    /// other domains are unaffected.
    pub async fn enforce_delay(&self, domain: &str, crawl_delay: Option<f64>) {
        let declared = crawl_delay
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO);
        let delay = declared.max(self.config.min_delay);

        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let start = slots.get(domain).map_or(now, |&next| next.max(now));
            slots.insert(domain.to_string(), start + delay);
            start - now
        };

        if !wait.is_zero() {
            tracing::debug!(domain = %domain, sleep_ms = %wait.as_millis(), "Crawl delay");
            tokio::time::sleep(wait).await;
        }
    }

    /// Run `do_request`, retrying on 429 and 503.
    ///
    /// 429 honors a `Retry-After` when the server sent one; otherwise both
    /// wait `initial_delay * 2^attempt`. Any other response, and any
    /// transport error, is returned as is.
    pub async fn request_with_backoff<F, Fut>(
        &self,
        url: &str,
        max_retries: u32,
        initial_delay: Duration,
        mut do_request: F,
    ) -> Result<HttpResponse, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpResponse, AppError>>,
    {
        let mut attempt = 0u32;
        loop {
            let response = do_request().await?;
            let throttled = match response.status {
                429 => true,
                503 => false,
                _ => return Ok(response),
            };

            let doubling = initial_delay.saturating_mul(2u32.saturating_pow(attempt));
            let delay = if throttled {
                response.retry_after.unwrap_or(doubling)
            } else {
                doubling
            };

            if attempt >= max_retries || delay > self.config.max_backoff {
                tracing::warn!(
                    url = %url,
                    status = response.status,
                    attempts = attempt + 1,
                    "Giving up after backoff"
                );
                return Err(if throttled {
                    AppError::Throttled {
                        url: url.to_string(),
                        retry_after: response.retry_after,
                    }
                } else {
                    AppError::ServiceUnavailable(url.to_string())
                });
            }

            tracing::warn!(
                url = %url,
                status = response.status,
                attempt = attempt + 1,
                max_retries,
                sleep_ms = %delay.as_millis(),
                "Backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Policy check, crawl delay and backoff around one GET.
    ///
    /// Returns the successful response; any non-2xx status that survives
    /// backoff becomes [`AppError::HttpStatus`].
    pub async fn fetch<T: Transport>(
        &self,
        transport: &T,
        url: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, AppError> {
        let domain = domain_key(url)
            .ok_or_else(|| AppError::ConfigError(format!("Invalid URL: {url}")))?;
        let policy = self.get_policy(transport, url).await?;
        if !policy.is_allowed(url, &self.config.user_agent) {
            return Err(AppError::PolicyDenied {
                url: url.to_string(),
                reason: format!("robots.txt for {domain}"),
            });
        }
        let crawl_delay = policy.crawl_delay();

        let domain = domain.as_str();
        let response = self
            .request_with_backoff(
                url,
                self.config.max_retries,
                self.config.initial_backoff,
                move || async move {
                    self.enforce_delay(domain, crawl_delay).await;
                    let started = Instant::now();
                    let mut response = transport.get(url, timeout).await?;
                    response.elapsed = started.elapsed();
                    Ok(response)
                },
            )
            .await?;

        if !response.is_success() {
            return Err(AppError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    pub async fn cached_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.cache.read().await.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

impl Default for CrawlPolicyManager {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

/// Cache key for a URL: its origin, e.g. `https://example.com`.
pub fn domain_key(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.host_str()?;
    match url.origin() {
        origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
/// Dates in the past yield zero.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

/// Crawl-delay for `user_agent`: the first group naming the agent wins,
/// otherwise the `*` group.
///
/// Consecutive `User-agent` lines share one group; any other directive
/// closes the agent list.
fn parse_crawl_delay(content: &str, user_agent: &str) -> Option<f64> {
    let agent = product_token(user_agent);
    let mut specific: Option<f64> = None;
    let mut wildcard: Option<f64> = None;

    let mut group_agents: Vec<String> = Vec::new();
    let mut in_agent_list = false;

    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                if !in_agent_list {
                    group_agents.clear();
                    in_agent_list = true;
                }
                group_agents.push(value.to_string());
            }
            "crawl-delay" => {
                in_agent_list = false;
                let Ok(delay) = value.parse::<f64>() else {
                    continue;
                };
                for name in &group_agents {
                    if name == "*" {
                        wildcard.get_or_insert(delay);
                    } else if !agent.is_empty()
                        && product_token(name).eq_ignore_ascii_case(agent)
                    {
                        specific.get_or_insert(delay);
                    }
                }
            }
            _ => in_agent_list = false,
        }
    }

    specific.or(wildcard)
}

/// Leading `[A-Za-z_-]` run of a user-agent, e.g. `TidingsBot` for
/// `TidingsBot/1.0`. Groups match on this token, compared without case.
fn product_token(agent: &str) -> &str {
    let agent = agent.trim();
    let end = agent
        .find(|c: char| !(c.is_ascii_alphabetic() || c == '_' || c == '-'))
        .unwrap_or(agent.len());
    &agent[..end]
}
