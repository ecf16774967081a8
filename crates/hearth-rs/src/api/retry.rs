//! Automatic retry with exponential backoff and jitter.
//!
//! Retries transient provider errors (429, 500, 502, 503, 504, transport
//! failures, timeouts) with configurable exponential backoff. Never retries
//! 400 (bad request) or 401 (auth) errors.

use std::time::Duration;

use super::provider::ProviderError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (0 = no retries, just fail immediately).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential backoff).
    pub multiplier: f64,
    /// Whether to add jitter to prevent thundering herd.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given number of retries. Uses sensible defaults.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            // Deterministic jitter keyed on the attempt number; no rand dependency.
            let jitter_factor = match attempt % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * jitter_factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Whether another attempt should follow a failed `attempt` (0-indexed).
    pub fn should_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        attempt < self.max_retries && is_transient(error)
    }
}

/// Whether a provider error indicates a transient (retryable) failure.
pub fn is_transient(error: &ProviderError) -> bool {
    match error {
        ProviderError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
        ProviderError::Transport(_) | ProviderError::Timeout(_) => true,
        ProviderError::Malformed(_) | ProviderError::Api(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ProviderError {
        ProviderError::Http {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn default_config_no_retries() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 0);
        assert!(!config.should_retry(&http(503), 0));
    }

    #[test]
    fn delay_grows_and_caps() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::with_retries(5)
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn jitter_never_exceeds_base_delay() {
        let config = RetryConfig::with_retries(3);
        for attempt in 0..8 {
            let jittered = config.delay_for_attempt(attempt);
            assert!(jittered <= Duration::from_secs(8));
        }
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&http(429)));
        assert!(is_transient(&http(502)));
        assert!(is_transient(&ProviderError::Transport("reset".into())));
        assert!(is_transient(&ProviderError::Timeout(Duration::from_secs(1))));
        assert!(!is_transient(&http(400)));
        assert!(!is_transient(&http(401)));
        assert!(!is_transient(&ProviderError::Malformed("bad json".into())));
    }

    #[test]
    fn should_retry_respects_budget() {
        let config = RetryConfig::with_retries(2);
        assert!(config.should_retry(&http(500), 0));
        assert!(config.should_retry(&http(500), 1));
        assert!(!config.should_retry(&http(500), 2));
        assert!(!config.should_retry(&http(401), 0));
    }
}
