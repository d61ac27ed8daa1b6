//! Retry-then-skip execution.
//!
//! [`RetryExecutor`] retries transient failures with exponential backoff
//! and turns anything it gives up on into a [`SkipRecord`] instead of an
//! error. [`UrlFallbackExecutor`] runs the same policy over a list of
//! candidate endpoints and only skips once every one of them failed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{AppError, ErrorKind};
use crate::skip::{Outcome, SkipRecord, SkipTracker};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 50% random extra delay to each backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff after the given failed attempt (1-indexed), before jitter.
    ///
    /// - Attempt 1: base
    /// - Attempt 2: base * 2
    /// - Attempt n: base * 2^(n-1), capped by max_delay
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Where a retry loop currently stands. Lives for one `execute` call.
#[derive(Debug)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub last_error: Option<AppError>,
}

#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    skips: Arc<SkipTracker>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, skips: Arc<SkipTracker>) -> Self {
        Self { config, skips }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn skips(&self) -> &Arc<SkipTracker> {
        &self.skips
    }

    /// Same policy, recording into `skips`.
    pub fn with_skips(&self, skips: Arc<SkipTracker>) -> Self {
        Self {
            config: self.config.clone(),
            skips,
        }
    }

    /// Run `operation` with the configured attempt budget.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: F,
        operation_name: &str,
        source_id: &str,
    ) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.execute_with_attempts(operation, operation_name, source_id, self.config.max_attempts)
            .await
    }

    /// Run `operation` up to `max_attempts` times.
    ///
    /// Only retryable errors are retried. The final failure is recorded in
    /// the skip tracker and returned as [`Outcome::Skipped`].
    pub async fn execute_with_attempts<T, F, Fut>(
        &self,
        operation: F,
        operation_name: &str,
        source_id: &str,
        max_attempts: u32,
    ) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        match self
            .attempt_all(operation, operation_name, source_id, max_attempts)
            .await
        {
            Ok(value) => Outcome::Completed(value),
            Err(record) => {
                self.skips.record(record.clone());
                Outcome::Skipped(record)
            }
        }
    }

    /// The retry loop without recording the final skip.
    async fn attempt_all<T, F, Fut>(
        &self,
        mut operation: F,
        operation_name: &str,
        source_id: &str,
        max_attempts: u32,
    ) -> Result<T, SkipRecord>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut state = RetryAttempt {
            attempt_number: 0,
            max_attempts: max_attempts.max(1),
            last_error: None,
        };

        loop {
            state.attempt_number += 1;
            let error = match operation().await {
                Ok(value) => {
                    if let Some(previous) = &state.last_error {
                        tracing::info!(
                            source_id = %source_id,
                            operation = %operation_name,
                            attempt = state.attempt_number,
                            previous_error = %previous,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let retryable = error.is_retryable();
            tracing::warn!(
                source_id = %source_id,
                operation = %operation_name,
                attempt = state.attempt_number,
                max_attempts = state.max_attempts,
                retryable,
                error = %error,
                "Attempt failed"
            );

            if !retryable || state.attempt_number >= state.max_attempts {
                return Err(SkipRecord::new(
                    source_id,
                    operation_name,
                    &error,
                    state.attempt_number,
                ));
            }

            let delay = self.backoff(state.attempt_number);
            tracing::debug!(
                source_id = %source_id,
                sleep_ms = %delay.as_millis(),
                "Retry backoff"
            );
            tokio::time::sleep(delay).await;
            state.last_error = Some(error);
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.config.delay_for_attempt(attempt);
        if !self.config.jitter {
            return delay;
        }
        let max_extra = (delay.as_millis() / 2) as u64;
        let extra = if max_extra == 0 {
            0
        } else {
            rand::rng().random_range(0..=max_extra)
        };
        delay + Duration::from_millis(extra)
    }
}

/// Applies a [`RetryExecutor`] to each candidate endpoint in turn.
#[derive(Clone)]
pub struct UrlFallbackExecutor {
    retry: RetryExecutor,
}

impl UrlFallbackExecutor {
    pub fn new(retry: RetryExecutor) -> Self {
        Self { retry }
    }

    /// Try `operation` on each URL in order, with the full retry policy
    /// per URL. One skip is recorded if all of them fail.
    ///
    /// An open circuit ends the walk early: the breaker is per source, so
    /// the remaining URLs would be rejected the same way.
    pub async fn execute<T, F, Fut>(
        &self,
        urls: &[String],
        mut operation: F,
        operation_name: &str,
        source_id: &str,
    ) -> Outcome<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.retry.config.max_attempts;
        let mut total_attempts = 0;
        let mut tried = 0;
        let mut last_failure: Option<SkipRecord> = None;

        for (index, url) in urls.iter().enumerate() {
            let result = self
                .retry
                .attempt_all(
                    || operation(url.clone()),
                    operation_name,
                    source_id,
                    max_attempts,
                )
                .await;

            match result {
                Ok(value) => {
                    if index > 0 {
                        tracing::info!(
                            source_id = %source_id,
                            url = %url,
                            position = index + 1,
                            "Fallback endpoint succeeded"
                        );
                    }
                    return Outcome::Completed(value);
                }
                Err(record) => {
                    tried += 1;
                    total_attempts += record.attempts_made;
                    let circuit_open = record.error_kind == ErrorKind::CircuitOpen;
                    tracing::info!(
                        source_id = %source_id,
                        url = %url,
                        remaining = urls.len() - index - 1,
                        reason = %record.reason,
                        "Endpoint exhausted"
                    );
                    last_failure = Some(record);
                    if circuit_open {
                        break;
                    }
                }
            }
        }

        let record = match last_failure {
            Some(last) => SkipRecord {
                reason: format!(
                    "{tried} of {} endpoint(s) failed, last: {}",
                    urls.len(),
                    last.reason
                ),
                attempts_made: total_attempts,
                ..last
            },
            None => SkipRecord::new(
                source_id,
                operation_name,
                &AppError::ConfigError("no endpoints to try".to_string()),
                0,
            ),
        };
        self.retry.skips.record(record.clone());
        Outcome::Skipped(record)
    }
}
