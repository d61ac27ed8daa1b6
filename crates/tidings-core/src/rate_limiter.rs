//! Per-source token-bucket rate limiting.
//!
//! Each source gets a bucket holding up to `capacity` tokens, refilled
//! continuously at `refill_rate` tokens per second. Short bursts up to the
//! capacity go through immediately; sustained traffic converges to the
//! refill rate.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests per second for sources that declare no rate.
    pub default_rate: f64,
    /// Bucket capacity for sources that declare no burst.
    /// `None` means the rate rounded up, at least 1.
    pub default_burst: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            default_burst: None,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    total_acquired: u64,
    total_rejected: u64,
    total_wait: Duration,
}

/// Snapshot of a bucket for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub refill_rate: f64,
    pub available_tokens: f64,
    pub total_acquired: u64,
    pub total_rejected: u64,
    pub total_wait_ms: u128,
}

/// A token bucket. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// Non-positive or non-finite values are clamped to sane minimums so a
    /// bad descriptor can never stall a source forever.
    pub fn new(name: impl Into<String>, capacity: u32, refill_rate: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        let refill_rate = if refill_rate.is_finite() && refill_rate > 0.0 {
            refill_rate
        } else {
            1.0
        };
        Self {
            name: name.into(),
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                total_acquired: 0,
                total_rejected: 0,
                total_wait: Duration::ZERO,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(limiter = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take a token if one is available right now. Never waits.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock_state();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.total_acquired += 1;
            true
        } else {
            state.total_rejected += 1;
            false
        }
    }

    /// Take a token, sleeping until the next one is due if the bucket is empty.
    pub async fn acquire(&self) {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.lock_state();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    state.total_acquired += 1;
                    state.total_wait += started.elapsed();
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
            };

            tracing::debug!(
                limiter = %self.name,
                sleep_ms = %wait.as_millis(),
                "Waiting for rate limit token"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// `acquire` when `blocking`, `try_acquire` otherwise.
    pub async fn acquire_with(&self, blocking: bool) -> bool {
        if blocking {
            self.acquire().await;
            true
        } else {
            self.try_acquire()
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.lock_state();
        self.refill(&mut state);
        RateLimiterStats {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            available_tokens: state.tokens,
            total_acquired: state.total_acquired,
            total_rejected: state.total_rejected,
            total_wait_ms: state.total_wait.as_millis(),
        }
    }
}

/// One token bucket per source id, created on demand.
pub struct RateLimiterPool {
    config: RateLimitConfig,
    limiters: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiterPool {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    fn lock_limiters(&self) -> MutexGuard<'_, HashMap<String, Arc<TokenBucket>>> {
        self.limiters.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter pool");
            poisoned.into_inner()
        })
    }

    /// Bucket for `source_id`. The rate and burst only apply on creation.
    pub fn get_or_create(
        &self,
        source_id: &str,
        rate: Option<f64>,
        burst: Option<u32>,
    ) -> Arc<TokenBucket> {
        let mut limiters = self.lock_limiters();
        if let Some(existing) = limiters.get(source_id) {
            return Arc::clone(existing);
        }

        let rate = rate.unwrap_or(self.config.default_rate);
        let capacity = burst
            .or(self.config.default_burst)
            .unwrap_or_else(|| rate.ceil().max(1.0) as u32);
        tracing::debug!(
            source_id = %source_id,
            rate,
            capacity,
            "Creating rate limiter"
        );

        let bucket = Arc::new(TokenBucket::new(source_id, capacity, rate));
        limiters.insert(source_id.to_string(), Arc::clone(&bucket));
        bucket
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<TokenBucket>> {
        self.lock_limiters().get(source_id).cloned()
    }

    pub fn all_stats(&self) -> BTreeMap<String, RateLimiterStats> {
        self.lock_limiters()
            .iter()
            .map(|(id, bucket)| (id.clone(), bucket.stats()))
            .collect()
    }
}

impl Default for RateLimiterPool {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
