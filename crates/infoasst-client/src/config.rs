use std::time::Duration;

use crate::errors::ClientError;

/// Default base URL of a locally running backend.
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";

/// Fixed-attempt, fixed-delay retry policy for whole-request calls.
///
/// Token-level streams are never retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Whether another attempt is allowed after `attempts_done` attempts.
    pub fn can_retry(&self, attempts_done: u32) -> bool {
        attempts_done < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

/// Configuration for [`crate::InfoAssistClient`] and the pieces it builds.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the backend (no trailing slash needed).
    pub base_url: String,
    /// HTTP timeout applied to whole requests.
    pub timeout: Duration,
    /// Retry policy for opaque REST calls.
    pub retry: RetryPolicy,
    /// Interval between typewriter ticks.
    pub reveal_interval: Duration,
    /// Number of leading `/` segments stripped from a source path to build a
    /// citation label (scheme, empty, host, container).
    pub citation_prefix_segments: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl ClientConfig {
    /// Creates a config with defaults for everything except the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            reveal_interval: Duration::from_millis(30),
            citation_prefix_segments: 4,
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `INFOASST_BASE_URL`: backend URL (default `http://localhost:5000`).
    /// - `INFOASST_TIMEOUT_SECS`: request timeout in seconds.
    /// - `INFOASST_REVEAL_INTERVAL_MS`: typewriter tick interval.
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = std::env::var("INFOASST_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(base_url);
        if let Some(secs) = parse_env_u64("INFOASST_TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_env_u64("INFOASST_REVEAL_INTERVAL_MS")? {
            config.reveal_interval = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the base URL.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the retry policy for opaque REST calls.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the typewriter tick interval.
    pub fn reveal_interval(mut self, interval: Duration) -> Self {
        self.reveal_interval = interval;
        self
    }

    /// Overrides how many leading path segments citation labels drop.
    pub fn citation_prefix_segments(mut self, segments: usize) -> Self {
        self.citation_prefix_segments = segments;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        let trimmed = self.base_url.trim();
        if trimmed.is_empty() {
            return Err(ClientError::Config("base_url must not be empty".into()));
        }
        if reqwest::Url::parse(trimmed).is_err() {
            return Err(ClientError::Config(format!(
                "base_url is not a valid URL: {trimmed}"
            )));
        }
        if self.reveal_interval.is_zero() {
            return Err(ClientError::Config(
                "reveal_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn parse_env_u64(key: &str) -> Result<Option<u64>, ClientError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("invalid {key}: {e}"))),
        _ => Ok(None),
    }
}
