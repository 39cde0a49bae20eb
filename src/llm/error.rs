//! Host call failures and the retry loop shared by the HTTP clients.
//!
//! Rate limits, 5xx responses and dropped connections are transient and are
//! retried with backoff; every other failure surfaces on the first attempt.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Longest single backoff, whatever the attempt number.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Error from a model host call.
#[derive(Debug, Error)]
#[error("{}{}: {}", .kind, http_suffix(.status_code), .message)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// `Retry-After` sent by the host
    pub retry_after: Option<Duration>,
}

fn http_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|code| format!(" (HTTP {})", code))
        .unwrap_or_default()
}

impl LlmError {
    fn new(kind: LlmErrorKind, message: String) -> Self {
        Self {
            kind,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Error for a non-success HTTP status. `retry_after` is kept for 429 only.
    pub fn from_status(status_code: u16, message: String, retry_after: Option<Duration>) -> Self {
        let kind = classify_http_status(status_code);
        Self {
            kind,
            status_code: Some(status_code),
            message,
            retry_after: retry_after.filter(|_| kind == LlmErrorKind::RateLimited),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Parse, message.into())
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// The host's `Retry-After` wins; otherwise the per-kind base doubles
    /// each attempt, plus a small deterministic jitter, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base = match self.kind {
            LlmErrorKind::RateLimited => 4,
            LlmErrorKind::Server => 2,
            _ => 1,
        };
        let secs = base * 2u64.saturating_pow(attempt.min(16));
        let jitter_ms = (u64::from(attempt) * 379) % 1000;
        (Duration::from_secs(secs) + Duration::from_millis(jitter_ms)).min(MAX_BACKOFF)
    }
}

/// Classification of host errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429
    RateLimited,
    /// 5xx and anything unexpected
    Server,
    /// Other 4xx: bad key, bad model, bad request
    Client,
    /// Connection failed or timed out
    Network,
    /// Body did not have the expected shape
    Parse,
}

impl LlmErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Server | Self::Network)
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RateLimited => "Rate limited",
            Self::Server => "Host error",
            Self::Client => "Request rejected",
            Self::Network => "Network error",
            Self::Parse => "Unexpected response",
        })
    }
}

/// Error kind for an HTTP status.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::Client,
        _ => LlmErrorKind::Server,
    }
}

/// How hard the clients retry transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Wall-clock budget for all attempts of one request
    pub max_elapsed: Duration,
    pub retry_rate_limits: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_elapsed: Duration::from_secs(120),
            retry_rate_limits: true,
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, error: &LlmError) -> bool {
        match error.kind {
            LlmErrorKind::RateLimited => self.retry_rate_limits,
            kind => kind.is_transient(),
        }
    }
}

/// Run `attempt` until it succeeds, fails permanently, or the budget is spent.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut attempt: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let start = Instant::now();
    let mut retries = 0;

    loop {
        let error = match attempt().await {
            Ok(value) => {
                if retries > 0 {
                    tracing::info!(
                        what,
                        retries,
                        elapsed = ?start.elapsed(),
                        "Request succeeded after retrying"
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let remaining = config.max_elapsed.saturating_sub(start.elapsed());
        let delay = error.backoff(retries).min(remaining);
        if retries >= config.max_retries || !config.should_retry(&error) || delay.is_zero() {
            tracing::error!(what, retries, %error, "Request failed");
            return Err(error);
        }

        tracing::warn!(what, attempt = retries + 1, ?delay, %error, "Transient failure, retrying");
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}
