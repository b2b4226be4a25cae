//! Bounded retries with exponential backoff and a per-attempt timeout.
//!
//! Only errors for which [`AgentError::is_transient`] holds are retried.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry configuration for calls to the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    pub max_attempts: u32,

    #[serde(with = "secs_f64")]
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,

    /// Cap on the delay between attempts.
    #[serde(with = "secs_f64")]
    pub max_delay: Duration,

    /// Upper bound on one attempt, including reading the body.
    #[serde(with = "secs_f64")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts. Used in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next = (delay.as_secs_f64() * self.backoff_factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(next).unwrap_or(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;

    for attempt in 1..=max_attempts {
        let err = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    tracing::info!(attempt, "generation succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_) => AgentError::Unavailable {
                reason: format!("attempt timed out after {:?}", policy.attempt_timeout),
            },
        };

        if !err.is_transient() {
            tracing::warn!(attempt, error = %err, "generation failed permanently");
            return Err(err);
        }

        if attempt == max_attempts {
            tracing::warn!(attempt, error = %err, "generation retries exhausted");
            return Err(AgentError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        tracing::warn!(attempt, max_attempts, delay = ?delay, error = %err, "generation attempt failed, retrying");
        tokio::time::sleep(delay).await;
        delay = policy.next_delay(delay);
    }

    Err(AgentError::Internal("retry loop exited without a result".into()))
}

/// Serde helper: durations as fractional seconds in config files.
mod secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!("invalid duration {secs} seconds: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(&RetryPolicy::immediate(3), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AgentError::Unavailable { reason: "503".into() })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = with_retry(&RetryPolicy::immediate(5), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AgentError::InvalidRequest { status: 401, reason: "bad key".into() }) }
        })
        .await;

        assert!(matches!(result, Err(AgentError::InvalidRequest { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_wraps_last_error() {
        let result: Result<()> = with_retry(&RetryPolicy::immediate(2), || async {
            Err(AgentError::RateLimited { reason: "429".into() })
        })
        .await;

        match result {
            Err(AgentError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, AgentError::RateLimited { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy {
            max_attempts: 1,
            attempt_timeout: Duration::from_secs(2),
            ..RetryPolicy::immediate(1)
        };

        let result: Result<()> = with_retry(&policy, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result.unwrap_err().root(),
            AgentError::Unavailable { .. }
        ));
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let huge = serde_json::from_str::<RetryPolicy>(r#"{"initial_delay": 1e30}"#);
        assert!(huge.is_err());
        let negative = serde_json::from_str::<RetryPolicy>(r#"{"max_delay": -1.0}"#);
        assert!(negative.is_err());

        let policy: RetryPolicy = serde_json::from_str(r#"{"attempt_timeout": 2.5}"#).unwrap();
        assert_eq!(policy.attempt_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn negative_backoff_factor_falls_back_to_the_cap() {
        let policy = RetryPolicy {
            backoff_factor: -2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_delay(Duration::from_secs(1)), policy.max_delay);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        let mut delay = policy.initial_delay;
        for _ in 0..10 {
            delay = policy.next_delay(delay);
        }
        assert_eq!(delay, policy.max_delay);
    }
}
