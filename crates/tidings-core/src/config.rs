use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::policy::PolicyConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::timeout_tracker::TimeoutConfig;

/// Concurrency limits for a batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Source tasks running at once.
    pub max_parallel: usize,
    /// CPU-bound post-processing jobs running at once. Separate from
    /// `max_parallel`; the two pools never share permits.
    pub processing_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            processing_workers: 2,
        }
    }
}

/// Every tunable of the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub timeout: TimeoutConfig,
    pub policy: PolicyConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
}

impl EngineConfig {
    /// Defaults overridden by environment variables.
    ///
    /// - `TIDINGS_MAX_PARALLEL`, `TIDINGS_PROCESSING_WORKERS`
    /// - `TIDINGS_DEFAULT_RATE` (requests/sec), `TIDINGS_DEFAULT_BURST`
    /// - `TIDINGS_FAILURE_THRESHOLD`, `TIDINGS_SUCCESS_THRESHOLD`,
    ///   `TIDINGS_RECOVERY_TIMEOUT_SECS`
    /// - `TIDINGS_DEFAULT_TIMEOUT_SECS`
    /// - `TIDINGS_USER_AGENT` (robots.txt token), `TIDINGS_MIN_DELAY_SECS`
    ///   (at least 1), `TIDINGS_BACKOFF_RETRIES`
    /// - `TIDINGS_RETRY_ATTEMPTS`, `TIDINGS_RETRY_JITTER`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();
        let vars = Vars(&lookup);

        if let Some(n) = vars.positive::<usize>("TIDINGS_MAX_PARALLEL")? {
            config.batch.max_parallel = n;
        }
        if let Some(n) = vars.positive::<usize>("TIDINGS_PROCESSING_WORKERS")? {
            config.batch.processing_workers = n;
        }

        if let Some(rate) = vars.positive_f64("TIDINGS_DEFAULT_RATE")? {
            config.rate_limit.default_rate = rate;
        }
        if let Some(burst) = vars.positive::<u32>("TIDINGS_DEFAULT_BURST")? {
            config.rate_limit.default_burst = Some(burst);
        }

        if let Some(n) = vars.positive::<u32>("TIDINGS_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Some(n) = vars.positive::<u32>("TIDINGS_SUCCESS_THRESHOLD")? {
            config.circuit_breaker.success_threshold = n;
        }
        if let Some(secs) = vars.positive::<u64>("TIDINGS_RECOVERY_TIMEOUT_SECS")? {
            config.circuit_breaker.recovery_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = vars.positive::<u64>("TIDINGS_DEFAULT_TIMEOUT_SECS")? {
            config.timeout.default_timeout = Duration::from_secs(secs);
        }

        if let Some(agent) = lookup("TIDINGS_USER_AGENT") {
            let agent = agent.trim();
            if agent.is_empty() {
                return Err(AppError::ConfigError(
                    "TIDINGS_USER_AGENT must not be empty".into(),
                ));
            }
            config.policy.user_agent = agent.to_string();
        }
        if let Some(secs) = vars.positive_f64("TIDINGS_MIN_DELAY_SECS")? {
            if secs < 1.0 {
                return Err(AppError::ConfigError(format!(
                    "TIDINGS_MIN_DELAY_SECS must be at least 1, got {secs}"
                )));
            }
            config.policy.min_delay = Duration::from_secs_f64(secs);
        }
        if let Some(n) = vars.parse::<u32>("TIDINGS_BACKOFF_RETRIES", "a non-negative integer")? {
            config.policy.max_retries = n;
        }

        if let Some(n) = vars.positive::<u32>("TIDINGS_RETRY_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(jitter) = vars.parse::<bool>("TIDINGS_RETRY_JITTER", "true or false")? {
            config.retry.jitter = jitter;
        }

        Ok(config)
    }
}

struct Vars<'a, L>(&'a L);

impl<L: Fn(&str) -> Option<String>> Vars<'_, L> {
    fn parse<T: std::str::FromStr>(
        &self,
        name: &str,
        expected: &str,
    ) -> Result<Option<T>, AppError> {
        let Some(raw) = (self.0)(name) else {
            return Ok(None);
        };
        raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': must be {expected}"))
        })
    }

    fn positive<T>(&self, name: &str) -> Result<Option<T>, AppError>
    where
        T: std::str::FromStr + PartialEq + Default,
    {
        let value: Option<T> = self.parse(name, "a positive integer")?;
        if value.as_ref() == Some(&T::default()) {
            return Err(AppError::ConfigError(format!("{name} must be at least 1")));
        }
        Ok(value)
    }

    fn positive_f64(&self, name: &str) -> Result<Option<f64>, AppError> {
        let value: Option<f64> = self.parse(name, "a positive number")?;
        match value {
            Some(v) if !(v.is_finite() && v > 0.0) => Err(AppError::ConfigError(format!(
                "{name} must be a positive number, got {v}"
            ))),
            other => Ok(other),
        }
    }
}
