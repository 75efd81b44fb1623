//! Retry policy for tracker calls.

use crate::errors::TrackerError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Jitter applied to backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact exponential delays.
    None,
    /// Uniform in `0..=delay`.
    #[default]
    Full,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// Exponential backoff for transient tracker failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry))
            .min(self.max_delay_ms);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay == 0 => 0,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
        };
        Duration::from_millis(jittered)
    }

    /// Runs `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, TrackerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TrackerError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = %operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Tracker call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable() -> TrackerError {
        TrackerError::Status {
            endpoint: "engagements/".to_string(),
            status: 503,
            body: String::new(),
        }
    }

    #[test]
    fn test_exponential_delays_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 250,
            jitter: JitterStrategy::None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(250));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = RetryPolicy::default().with_base_delay_ms(100);
        for retry in 0..5 {
            assert!(policy.delay_for(retry) <= Duration::from_millis(policy.max_delay_ms));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let policy = RetryPolicy::default().with_base_delay_ms(1);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = policy
            .run("find", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::default().with_base_delay_ms(1);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = policy
            .run("create", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TrackerError::Status {
                    endpoint: "engagements/".to_string(),
                    status: 400,
                    body: "bad".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::default()
            .with_base_delay_ms(1)
            .with_max_attempts(2);
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = policy
            .run("import", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
