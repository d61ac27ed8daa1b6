use std::time::Duration;

use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use tidings_core::error::AppError;
use tidings_core::policy::parse_retry_after;
use tidings_core::traits::{HttpResponse, Transport};

/// One GET over a pooled reqwest client.
///
/// Any status comes back as a response; only failures to get one at all are
/// errors. Throttling and retries happen above this layer.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(client: Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }

    /// The identification header this session sends.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, AppError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let body = response
            .text()
            .await
            .map_err(|e| classify_body(e, timeout))?;

        tracing::trace!(url = %url, status, bytes = body.len(), "GET");
        let mut response = HttpResponse::new(status, final_url, body);
        response.retry_after = retry_after;
        Ok(response)
    }
}

fn classify(error: reqwest::Error, timeout: Duration) -> AppError {
    if error.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if error.is_connect() {
        AppError::NetworkError(format!("Connection failed: {error}"))
    } else {
        AppError::HttpError(error.to_string())
    }
}

/// Headers already arrived, so a failed body read is the connection
/// dropping mid-transfer.
fn classify_body(error: reqwest::Error, timeout: Duration) -> AppError {
    if error.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else {
        AppError::NetworkError(format!("Failed to read response body: {error}"))
    }
}
