//! Feed fetching with retry.
//!
//! One shared HTTP client, a per-request timeout, and the transient-error
//! retry loop every feed fetch goes through. Transient failures (timeouts,
//! connection errors, and the retryable status codes) back off and retry;
//! anything else surfaces to the feed caller as a permanent error.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retries after the initial attempt.
pub const FETCH_RETRIES: u32 = 3;

/// HTTP statuses treated as transient.
pub const RETRYABLE_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

const JITTER_MAX_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Connect(_) => true,
            FetchError::Status(code) => RETRYABLE_STATUSES.contains(code),
            _ => false,
        }
    }

    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout
        } else if error.is_connect() {
            FetchError::Connect(error.to_string())
        } else if error.is_decode() {
            FetchError::Decode(error.to_string())
        } else {
            FetchError::Other(error.to_string())
        }
    }
}

pub struct FeedFetcher {
    client: reqwest::Client,
    retries: u32,
    backoff_base: Duration,
}

impl FeedFetcher {
    /// Build a fetcher with the service user-agent and a per-request timeout.
    pub fn new(request_timeout: Duration, retries: u32, backoff_base: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            retries,
            backoff_base,
        }
    }

    /// Fetch a feed URL as JSON, retrying transient failures.
    pub async fn fetch_json(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            debug!(url = %url, attempt = attempt, "Fetching feed");
            match self.fetch_once(url, cancel).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        url = %url,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient fetch failure, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, url: &str, cancel: &CancellationToken) -> Result<Value, FetchError> {
        let request = self
            .client
            .get(url)
            .header("accept", "application/json")
            .send();

        let response = tokio::select! {
            result = request => result.map_err(FetchError::from_reqwest)?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        tokio::select! {
            result = response.json::<Value>() => {
                result.map_err(|e| FetchError::Decode(e.to_string()))
            }
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }

    /// Exponential backoff with uniform jitter: `base * 2^attempt + 0..250ms`.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base * 2u32.saturating_pow(attempt);
        let jitter = rand::thread_rng().gen_range(0..JITTER_MAX_MS);
        exp + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for code in [408u16, 425, 429, 500, 502, 503, 504] {
            assert!(FetchError::Status(code).is_retryable(), "{} should retry", code);
        }
        for code in [400u16, 401, 403, 404, 410] {
            assert!(!FetchError::Status(code).is_retryable(), "{} must not retry", code);
        }
    }

    #[test]
    fn test_timeout_and_connect_are_retryable() {
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::Connect("reset".to_string()).is_retryable());
    }

    #[test]
    fn test_decode_is_permanent() {
        assert!(!FetchError::Decode("not json".to_string()).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let fetcher = FeedFetcher::new(Duration::from_secs(75), 3, Duration::from_millis(100));
        let jitter = Duration::from_millis(JITTER_MAX_MS);

        let b0 = fetcher.backoff_for(0);
        let b2 = fetcher.backoff_for(2);
        assert!(b0 >= Duration::from_millis(100) && b0 < Duration::from_millis(100) + jitter);
        assert!(b2 >= Duration::from_millis(400) && b2 < Duration::from_millis(400) + jitter);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fetcher = FeedFetcher::new(Duration::from_secs(5), 0, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fetcher.fetch_json("http://127.0.0.1:1/feed", &cancel).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
