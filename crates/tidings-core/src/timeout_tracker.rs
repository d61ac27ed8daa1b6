//! Adaptive per-source timeouts.
//!
//! Keeps a bounded window of successful response times per source and
//! recommends a timeout from a high percentile of that window. Purely
//! advisory: callers fall back to the configured timeout whenever no
//! recommendation is available.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Samples kept per source; the oldest is evicted beyond this.
    pub window_size: usize,
    /// Percentile of the window the recommendation is based on, in `0.0..=1.0`.
    pub percentile: f64,
    /// Multiplier applied on top of the percentile.
    pub margin: f64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    /// Samples required before anything is recommended.
    pub min_samples: usize,
    /// Used when a source has neither a recommendation nor its own timeout.
    pub default_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            percentile: 0.95,
            margin: 1.5,
            min_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(120),
            min_samples: 10,
            default_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeoutStats {
    pub samples: usize,
    pub mean_ms: u128,
    pub p95_ms: u128,
    pub recommended_ms: Option<u128>,
}

pub struct TimeoutTracker {
    config: TimeoutConfig,
    history: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl TimeoutTracker {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    fn lock_history(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Duration>>> {
        self.history.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned timeout history");
            poisoned.into_inner()
        })
    }

    pub fn record_response_time(&self, source_id: &str, duration: Duration) {
        let mut history = self.lock_history();
        let window = history.entry(source_id.to_string()).or_default();
        if window.len() >= self.config.window_size.max(1) {
            window.pop_front();
        }
        window.push_back(duration);
    }

    /// Recommendation using the configured minimum sample count.
    pub fn recommended_timeout(&self, source_id: &str) -> Option<Duration> {
        self.get_recommended_timeout(source_id, self.config.min_samples)
    }

    /// `None` until at least `min_samples` durations have been recorded.
    pub fn get_recommended_timeout(
        &self,
        source_id: &str,
        min_samples: usize,
    ) -> Option<Duration> {
        let history = self.lock_history();
        let window = history.get(source_id)?;
        self.recommend(window, min_samples)
    }

    fn recommend(&self, window: &VecDeque<Duration>, min_samples: usize) -> Option<Duration> {
        if window.len() < min_samples.max(1) {
            return None;
        }
        let base_ms = percentile(window, self.config.percentile).as_millis() as f64;
        let recommended =
            Duration::from_millis((base_ms * self.config.margin.max(1.0)).round() as u64);
        Some(recommended.clamp(self.config.min_timeout, self.config.max_timeout))
    }

    /// Timeout to use for the next request: recommendation, else the
    /// source's own setting, else the default.
    pub fn timeout_for(&self, source_id: &str, configured: Option<Duration>) -> Duration {
        self.recommended_timeout(source_id)
            .or(configured)
            .unwrap_or(self.config.default_timeout)
    }

    pub fn stats(&self) -> BTreeMap<String, TimeoutStats> {
        let history = self.lock_history();
        history
            .iter()
            .map(|(id, window)| {
                let total: Duration = window.iter().sum();
                let stats = TimeoutStats {
                    samples: window.len(),
                    mean_ms: total.as_millis() / window.len().max(1) as u128,
                    p95_ms: percentile(window, 0.95).as_millis(),
                    recommended_ms: self
                        .recommend(window, self.config.min_samples)
                        .map(|d| d.as_millis()),
                };
                (id.clone(), stats)
            })
            .collect()
    }
}

impl Default for TimeoutTracker {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

/// Nearest-rank percentile. `samples` must be non-empty.
fn percentile(samples: &VecDeque<Duration>, p: f64) -> Duration {
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = (p.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
