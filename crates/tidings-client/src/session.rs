use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use tidings_core::error::AppError;
use tidings_core::traits::TransportProvider;

use crate::transport::ReqwestTransport;

/// Browser-like identification headers, handed out in turn.
pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) \
     Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0 Safari/537.36",
];

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_agents: Vec<String>,
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 4,
        }
    }
}

/// One pooled HTTP session per source id, created on first request and
/// reused afterwards. Each new session takes the next user agent.
pub struct SessionPool {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, ReqwestTransport>>,
    next_agent: AtomicUsize,
}

impl SessionPool {
    pub fn new(config: SessionConfig) -> Result<Self, AppError> {
        if config.user_agents.is_empty() {
            return Err(AppError::ConfigError(
                "Session pool needs at least one user agent".into(),
            ));
        }
        Ok(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            next_agent: AtomicUsize::new(0),
        })
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, ReqwestTransport>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned session pool");
            poisoned.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_sessions().is_empty()
    }

    fn build(&self, source_id: &str) -> Result<ReqwestTransport, AppError> {
        let n = self.next_agent.fetch_add(1, Ordering::Relaxed);
        let user_agent = &self.config.user_agents[n % self.config.user_agents.len()];

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .user_agent(user_agent.as_str())
            .default_headers(headers)
            .connect_timeout(self.config.connect_timeout)
            .pool_idle_timeout(self.config.pool_idle_timeout)
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .build()
            .map_err(|e| AppError::HttpError(format!("Failed to build HTTP client: {e}")))?;

        tracing::debug!(source_id = %source_id, user_agent = %user_agent, "New HTTP session");
        Ok(ReqwestTransport::new(client, user_agent.clone()))
    }
}

impl TransportProvider for SessionPool {
    type Transport = ReqwestTransport;

    fn session(&self, source_id: &str) -> Result<ReqwestTransport, AppError> {
        let mut sessions = self.lock_sessions();
        if let Some(existing) = sessions.get(source_id) {
            return Ok(existing.clone());
        }
        let transport = self.build(source_id)?;
        sessions.insert(source_id.to_string(), transport.clone());
        Ok(transport)
    }
}
