//! Per-source circuit breakers.
//!
//! Stops calling a source that keeps failing, then probes it again once the
//! cooldown has elapsed. Every source gets its own breaker from the
//! [`CircuitBreakerPool`]; one source tripping never affects another.
//!
//! ```text
//! CLOSED --[failure_threshold failures]--> OPEN --[recovery_timeout]--> HALF_OPEN
//!   ^                                       ^                              |
//!   |                                       +---------[probe fails]--------+
//!   +------------------[success_threshold probes succeed]------------------+
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive probe successes that close it again.
    pub success_threshold: u32,
    /// Time spent open before a probe is let through.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Mutable part of a breaker, always accessed under its lock.
#[derive(Debug)]
struct Tally {
    state: CircuitState,
    failures: u32,
    probe_successes: u32,
    changed_at: Instant,
    probing: bool,
    last_error: Option<String>,
    calls: u64,
    successes: u64,
    failures_total: u64,
    rejected: u64,
    last_elapsed: Option<Duration>,
    total_elapsed: Duration,
}

impl Tally {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            probe_successes: 0,
            changed_at: Instant::now(),
            probing: false,
            last_error: None,
            calls: 0,
            successes: 0,
            failures_total: 0,
            rejected: 0,
            last_elapsed: None,
            total_elapsed: Duration::ZERO,
        }
    }

    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.changed_at = Instant::now();
        self.probing = false;
        self.probe_successes = 0;
        if state == CircuitState::Closed {
            self.failures = 0;
            self.last_error = None;
        }
    }

    fn cooldown_left(&self, recovery: Duration) -> Duration {
        recovery.saturating_sub(self.changed_at.elapsed())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub last_error: Option<String>,
    /// Duration of the most recent admitted call.
    pub last_call_elapsed: Option<Duration>,
    pub mean_call_elapsed: Option<Duration>,
    /// Remaining cooldown while open.
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug)]
pub enum CircuitBreakerError {
    /// The breaker rejected the call; the operation never ran.
    Open {
        name: String,
        retry_after: Duration,
        last_error: Option<String>,
    },
    Inner(AppError),
}

impl fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::Open {
                name, retry_after, ..
            } => write!(
                f,
                "circuit for '{name}' is open, next probe in {}s",
                retry_after.as_secs()
            ),
            CircuitBreakerError::Inner(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open {
                name, last_error, ..
            } => AppError::CircuitOpen {
                source_id: name,
                last_error,
            },
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Breaker for one source. Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    tally: Arc<Mutex<Tally>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            tally: Arc::new(Mutex::new(Tally::closed())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks the tally, applying a due OPEN -> HALF_OPEN transition first.
    fn tally(&self) -> MutexGuard<'_, Tally> {
        let mut tally = self.tally.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned breaker lock");
            poisoned.into_inner()
        });
        if tally.state == CircuitState::Open
            && tally.changed_at.elapsed() >= self.config.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Cooldown over, circuit half-open");
            tally.enter(CircuitState::HalfOpen);
        }
        tally
    }

    pub fn state(&self) -> CircuitState {
        self.tally().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let tally = self.tally();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: tally.state,
            consecutive_failures: tally.failures,
            total_calls: tally.calls,
            total_successes: tally.successes,
            total_failures: tally.failures_total,
            rejected_calls: tally.rejected,
            last_error: tally.last_error.clone(),
            last_call_elapsed: tally.last_elapsed,
            mean_call_elapsed: u32::try_from(tally.calls)
                .ok()
                .filter(|&calls| calls > 0)
                .map(|calls| tally.total_elapsed / calls),
            time_until_half_open: (tally.state == CircuitState::Open)
                .then(|| tally.cooldown_left(self.config.recovery_timeout)),
        }
    }

    /// Run `operation` if the breaker admits it.
    ///
    /// Open rejects without invoking `operation`. Half-open admits a single
    /// probe at a time. Errors for which [`AppError::should_trip_circuit`] is
    /// false pass through without touching the counters.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.admit()?;

        // Frees the probe slot if the future panics or is dropped.
        let mut slot = ProbeSlot {
            breaker: self,
            held: true,
        };
        let started = Instant::now();
        let result = operation().await;
        let elapsed = started.elapsed();
        slot.held = false;

        {
            let mut tally = self.tally();
            tally.calls += 1;
            tally.last_elapsed = Some(elapsed);
            tally.total_elapsed += elapsed;
        }
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => self.tally().probing = false,
        }
        result.map_err(CircuitBreakerError::Inner)
    }

    fn admit(&self) -> Result<(), CircuitBreakerError> {
        let mut tally = self.tally();
        let admitted = match tally.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if !tally.probing => {
                tally.probing = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => false,
        };
        if admitted {
            return Ok(());
        }

        tally.rejected += 1;
        tracing::debug!(circuit = %self.name, state = %tally.state, "Circuit rejected call");
        Err(CircuitBreakerError::Open {
            name: self.name.clone(),
            retry_after: tally.cooldown_left(self.config.recovery_timeout),
            last_error: tally.last_error.clone(),
        })
    }

    pub fn record_success(&self) {
        let mut tally = self.tally();
        tally.successes += 1;
        match tally.state {
            CircuitState::Closed => tally.failures = 0,
            CircuitState::HalfOpen => {
                tally.probing = false;
                tally.probe_successes += 1;
                if tally.probe_successes >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        probes = tally.probe_successes,
                        "Circuit closed"
                    );
                    tally.enter(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut tally = self.tally();
        tally.failures_total += 1;
        tally.last_error = Some(error.to_string());
        match tally.state {
            CircuitState::Closed => {
                tally.failures += 1;
                if tally.failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = tally.failures,
                        error = %error,
                        "Circuit opened"
                    );
                    tally.enter(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Probe failed, circuit reopened"
                );
                tally.enter(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        tracing::info!(circuit = %self.name, "Circuit reset");
        self.tally().enter(CircuitState::Closed);
    }
}

struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.tally().probing = false;
        }
    }
}

/// One breaker per source id, created on first use.
pub struct CircuitBreakerPool {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerPool {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn breakers(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned breaker pool");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, source_id: &str) -> CircuitBreaker {
        self.breakers()
            .entry(source_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(source_id, self.config.clone()))
            .clone()
    }

    pub fn all_states(&self) -> BTreeMap<String, CircuitState> {
        self.snapshot(CircuitBreaker::state)
    }

    pub fn all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.snapshot(CircuitBreaker::stats)
    }

    fn snapshot<V>(&self, f: impl Fn(&CircuitBreaker) -> V) -> BTreeMap<String, V> {
        self.breakers()
            .iter()
            .map(|(id, breaker)| (id.clone(), f(breaker)))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers().values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerPool {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn breaker(failures: u32, successes: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "feed",
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                recovery_timeout: Duration::from_secs(recovery_secs),
            },
        )
    }

    fn refused() -> AppError {
        AppError::NetworkError("connection refused".into())
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(|| async { Err::<(), _>(refused()) }).await;
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError> {
        cb.call(|| async { Ok::<_, AppError>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_failures_open_the_circuit() {
        let cb = breaker(3, 1, 60);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failure_streak() {
        let cb = breaker(3, 1, 60);
        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await.unwrap();
        fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_never_invokes_operation() {
        let cb = breaker(2, 1, 60);
        fail(&cb).await;
        fail(&cb).await;

        let invoked = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        match result {
            Err(CircuitBreakerError::Open {
                name, last_error, ..
            }) => {
                assert_eq!(name, "feed");
                assert!(last_error.unwrap_or_default().contains("refused"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(cb.stats().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_for_exactly_the_recovery_timeout() {
        let cb = breaker(1, 1, 60);
        fail(&cb).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(matches!(succeed(&cb).await, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(cb.stats().time_until_half_open, Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_cooldown() {
        let cb = breaker(3, 1, 60);
        for _ in 0..3 {
            fail(&cb).await;
        }
        assert!(succeed(&cb).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        let value = cb.call(|| async { Ok::<_, AppError>("fresh") }).await;
        assert_eq!(value.unwrap(), "fresh");

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_needs_success_threshold_probes_to_close() {
        let cb = breaker(1, 2, 5);
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_restarts_cooldown() {
        let cb = breaker(1, 2, 10);
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_in_flight() {
        let cb = breaker(1, 1, 1);
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        cb.admit().unwrap();
        assert!(cb.admit().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_the_slot() {
        let cb = breaker(1, 1, 1);
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let pending = cb.call(|| std::future::pending::<Result<(), AppError>>());
        tokio::select! {
            _ = pending => unreachable!(),
            () = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_record_call_durations() {
        let cb = breaker(5, 1, 60);
        assert_eq!(cb.stats().last_call_elapsed, None);
        assert_eq!(cb.stats().mean_call_elapsed, None);

        for secs in [1, 3] {
            cb.call(|| async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok::<_, AppError>(())
            })
            .await
            .unwrap();
        }
        let _ = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Err::<(), _>(refused())
            })
            .await;

        let stats = cb.stats();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.total_failures, 1);
        // Timer resolution is one millisecond.
        let about_two_secs = |d: Option<Duration>| {
            d.is_some_and(|d| d.abs_diff(Duration::from_secs(2)) <= Duration::from_millis(2))
        };
        assert!(about_two_secs(stats.last_call_elapsed), "{stats:?}");
        assert!(about_two_secs(stats.mean_call_elapsed), "{stats:?}");
    }

    #[tokio::test]
    async fn test_policy_denial_leaves_counters_alone() {
        let cb = breaker(1, 1, 60);
        let result = cb
            .call(|| async {
                Err::<(), _>(AppError::PolicyDenied {
                    url: "https://feed.example/private".into(),
                    reason: "robots.txt".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().total_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_open_circuit() {
        let cb = breaker(1, 1, 300);
        fail(&cb).await;
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_rejection_becomes_circuit_open_error() {
        let err = AppError::from(CircuitBreakerError::Open {
            name: "npr".into(),
            retry_after: Duration::from_secs(3),
            last_error: Some("boom".into()),
        });
        assert!(matches!(
            err,
            AppError::CircuitOpen { ref source_id, .. } if source_id == "npr"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_keeps_sources_apart() {
        let pool = CircuitBreakerPool::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        fail(&pool.get("a")).await;
        pool.get("b");

        let states = pool.all_states();
        assert_eq!(states["a"], CircuitState::Open);
        assert_eq!(states["b"], CircuitState::Closed);

        pool.reset_all();
        assert_eq!(pool.get("a").state(), CircuitState::Closed);
    }
}
