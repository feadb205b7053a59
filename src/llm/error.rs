//! Chat API errors with retry classification.
//!
//! Transient errors (rate limits, 5xx, network) are retried with backoff;
//! everything else is returned to the caller immediately.

use std::time::Duration;

/// Error from a chat completion call.
#[derive(Debug)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    pub message: String,
    /// Delay requested by the provider via `Retry-After`
    pub retry_after: Option<Duration>,
}

impl LlmError {
    fn new(kind: LlmErrorKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_status(status_code: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut error = Self::new(classify_http_status(status_code), Some(status_code), body);
        if error.kind == LlmErrorKind::RateLimited {
            error.retry_after = retry_after;
        }
        error
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, None, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidResponse, None, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Delay before the retry following `attempt` (0-based).
    ///
    /// Honors `Retry-After` when present, otherwise doubles a per-kind base
    /// delay each attempt, capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base_secs: u64 = match self.kind {
            LlmErrorKind::RateLimited => 5,
            LlmErrorKind::Server => 2,
            _ => 1,
        };

        Duration::from_secs(base_secs.saturating_mul(2u64.saturating_pow(attempt)).min(60))
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of chat API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429
    RateLimited,
    /// 5xx
    Server,
    /// Other 4xx: auth, bad request, unknown model
    Client,
    /// Connection failure or timeout
    Network,
    /// The body could not be understood
    InvalidResponse,
}

impl LlmErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::Server | LlmErrorKind::Network
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::Server => write!(f, "Server error"),
            LlmErrorKind::Client => write!(f, "Client error"),
            LlmErrorKind::Network => write!(f, "Network error"),
            LlmErrorKind::InvalidResponse => write!(f, "Invalid response"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Maximum total time to spend retrying
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// Check if another attempt should follow a failure on `attempt` (0-based).
    pub fn should_retry(&self, error: &LlmError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_retries
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        400..=499 => LlmErrorKind::Client,
        _ => LlmErrorKind::Server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), LlmErrorKind::RateLimited);
        assert_eq!(classify_http_status(502), LlmErrorKind::Server);
        assert_eq!(classify_http_status(401), LlmErrorKind::Client);
        assert!(LlmErrorKind::Network.is_transient());
        assert!(!LlmErrorKind::InvalidResponse.is_transient());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let error = LlmError::from_status(503, "busy", None);
        assert_eq!(error.suggested_delay(0), Duration::from_secs(2));
        assert_eq!(error.suggested_delay(1), Duration::from_secs(4));
        assert_eq!(error.suggested_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        let limited = LlmError::from_status(429, "slow down", Some(Duration::from_secs(30)));
        assert_eq!(limited.suggested_delay(4), Duration::from_secs(30));

        let client = LlmError::from_status(400, "bad", Some(Duration::from_secs(30)));
        assert!(client.retry_after.is_none());
        assert!(!RetryConfig::default().should_retry(&client, 0));
    }

    #[test]
    fn test_retry_budget() {
        let config = RetryConfig::default();
        let error = LlmError::network("reset");
        assert!(config.should_retry(&error, 2));
        assert!(!config.should_retry(&error, 3));
    }
}
