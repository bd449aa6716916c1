use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

/// Retry schedule for idempotent-enough POST requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    /// Delay before each retry, in milliseconds.
    pub delays_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays_ms: vec![500, 1000, 2000],
        }
    }
}

impl RetryConfig {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delays_ms: Vec::new(),
        }
    }

    fn delay(&self, attempt: usize) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let ms = self
            .delays_ms
            .get(attempt)
            .or(self.delays_ms.last())
            .copied()
            .unwrap_or(0);
        Some(Duration::from_millis(ms))
    }
}

/// POST a JSON body, retrying on transport errors and 5xx responses.
///
/// 4xx responses are returned immediately; the last 5xx is returned as-is
/// once retries run out.
pub async fn retry_post<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    auth_token: Option<&str>,
    body: &T,
    config: &RetryConfig,
) -> Result<reqwest::Response> {
    let mut attempt = 0;
    loop {
        let mut req = client.post(url).json(body);
        if let Some(token) = auth_token {
            req = req.bearer_auth(token);
        }

        let Some(delay) = config.delay(attempt) else {
            return req.send().await.context("request failed after retries");
        };
        let reason = match req.send().await {
            Ok(resp) if !resp.status().is_server_error() => return Ok(resp),
            Ok(resp) => format!("HTTP {}", resp.status()),
            Err(e) => e.to_string(),
        };
        attempt += 1;
        warn!(
            "POST {url} attempt {attempt}/{} failed ({reason}), retrying in {}ms",
            config.max_retries + 1,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}
