//! Retry policy for offset commits
//!
//! Commits that fail with a transient broker error (see
//! [`crate::error::BrokerError::is_retryable`]) are retried with capped exponential backoff.
//! Terminal errors are returned immediately.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::BrokerResult;
#[cfg(test)]
use crate::error::BrokerError;

const MAX_RETRY_ATTEMPTS: u32 = 100;
const MAX_BACKOFF_SECONDS: u64 = 300;

fn bounded_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "max_retries {value} exceeds maximum allowed value {MAX_RETRY_ATTEMPTS}"
        )));
    }
    Ok(value)
}

fn bounded_backoff<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let duration = Duration::deserialize(deserializer)?;
    if duration.as_secs() > MAX_BACKOFF_SECONDS {
        return Err(serde::de::Error::custom(format!(
            "backoff {duration:?} exceeds maximum allowed {MAX_BACKOFF_SECONDS} seconds"
        )));
    }
    Ok(duration)
}

/// Backoff schedule for retriable commit failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(deserialize_with = "bounded_retries")]
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(deserialize_with = "bounded_backoff")]
    pub initial_backoff: Duration,
    /// Upper bound for any delay
    #[serde(deserialize_with = "bounded_backoff")]
    pub max_backoff: Duration,
    /// Fraction of the delay added as random jitter, 0.0 to 1.0
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Fixed delay between attempts, no jitter
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: backoff,
            max_backoff: backoff,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        let base = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
        let jitter = self.jitter_factor.clamp(0.0, 1.0) * rand::random::<f64>();
        base.mul_f64(1.0 + jitter)
    }

    /// Run `operation` until it succeeds, fails terminally, or retries run out
    ///
    /// Returns the number of retries that were needed.
    pub async fn run<F>(&self, what: &str, mut operation: F) -> BrokerResult<u32>
    where
        F: FnMut() -> BrokerResult<()>,
    {
        let mut attempt = 0;
        loop {
            match operation() {
                Ok(()) => {
                    if attempt > 0 {
                        debug!(what, retries = attempt, "Succeeded after retries");
                    }
                    return Ok(attempt);
                }
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = self.next_backoff(attempt);
                    warn!(what, attempt, ?backoff, %error, "Transient failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(10, 1000)]
    fn test_backoff_doubles_up_to_cap(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter_factor: 0.0,
        };
        assert_eq!(policy.next_backoff(attempt), Duration::from_millis(expected_ms));
    }

    #[tokio::test]
    async fn test_retries_transient_errors_only() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));

        let mut calls = 0;
        let retries = policy
            .run("commit", || {
                calls += 1;
                if calls < 3 {
                    Err(BrokerError::Timeout("coordinator".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(retries, 2);

        let mut calls = 0;
        let result = policy
            .run("commit", || {
                calls += 1;
                Err(BrokerError::Commit("fenced".into()))
            })
            .await;
        assert!(matches!(result, Err(BrokerError::Commit(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));
        let mut calls = 0;
        let result = policy
            .run("commit", || {
                calls += 1;
                Err(BrokerError::Connection("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_rejects_excessive_retries() {
        let result: Result<RetryPolicy, _> = serde_yaml::from_str("max_retries: 5000");
        assert!(result.is_err());
    }
}
