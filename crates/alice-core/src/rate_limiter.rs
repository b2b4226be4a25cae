//! Per-owner minimum-interval gate.
//!
//! Independent of the credit ledger. A refused attempt changes nothing. If
//! the counter store fails the limiter admits the message: keeping the
//! conversation available matters more than strict throttling.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alice_store::CounterStore;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Admit `owner` if at least `min_interval` passed since its last
    /// admitted message, recording now as the new mark.
    pub async fn try_acquire(&self, owner: i64, min_interval: Duration) -> bool {
        self.try_acquire_at(owner, min_interval, now_ms()).await
    }

    /// [`Self::try_acquire`] at an explicit instant (ms since the epoch).
    pub async fn try_acquire_at(&self, owner: i64, min_interval: Duration, now_ms: u64) -> bool {
        match self
            .store
            .stamp_if_elapsed(&key(owner), now_ms, min_interval)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!(owner, "message refused by rate limiter");
                false
            }
            Err(e) => {
                warn!(owner, error = %e, "counter store unavailable, admitting message");
                true
            }
        }
    }

    /// Time left until `owner` would be admitted again; zero if now.
    pub async fn remaining(&self, owner: i64, min_interval: Duration) -> Duration {
        self.remaining_at(owner, min_interval, now_ms()).await
    }

    pub async fn remaining_at(&self, owner: i64, min_interval: Duration, now_ms: u64) -> Duration {
        match self.store.last_stamp(&key(owner)).await {
            Ok(Some(last)) => {
                let elapsed = Duration::from_millis(now_ms.saturating_sub(last));
                min_interval.saturating_sub(elapsed)
            }
            Ok(None) => Duration::ZERO,
            Err(e) => {
                warn!(owner, error = %e, "counter store unavailable");
                Duration::ZERO
            }
        }
    }
}

fn key(owner: i64) -> String {
    format!("rate:{owner}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use alice_store::{MokaCounterStore, StoreError, StoreResult};
    use async_trait::async_trait;

    use super::*;

    const INTERVAL: Duration = Duration::from_secs(3);

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MokaCounterStore::new(1_000, Duration::from_secs(60))))
    }

    /// A counter store that is always down.
    struct Unreachable;

    #[async_trait]
    impl CounterStore for Unreachable {
        async fn stamp_if_elapsed(&self, _: &str, _: u64, _: Duration) -> StoreResult<bool> {
            Err(StoreError::Cache("connection refused".into()))
        }

        async fn last_stamp(&self, _: &str) -> StoreResult<Option<u64>> {
            Err(StoreError::Cache("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn second_attempt_within_interval_is_refused() {
        let limiter = limiter();
        let t0 = 1_700_000_000_000;
        assert!(limiter.try_acquire_at(1, INTERVAL, t0).await);
        assert!(!limiter.try_acquire_at(1, INTERVAL, t0 + 1_000).await);
        assert!(limiter.try_acquire_at(1, INTERVAL, t0 + 4_000).await);
    }

    #[tokio::test]
    async fn refusal_does_not_push_the_window() {
        let limiter = limiter();
        let t0 = 1_700_000_000_000;
        assert!(limiter.try_acquire_at(1, INTERVAL, t0).await);
        assert!(!limiter.try_acquire_at(1, INTERVAL, t0 + 2_999).await);
        // Measured from t0, not from the refused attempt.
        assert!(limiter.try_acquire_at(1, INTERVAL, t0 + 3_000).await);
    }

    #[tokio::test]
    async fn owners_are_independent() {
        let limiter = limiter();
        let t0 = 1_700_000_000_000;
        assert!(limiter.try_acquire_at(1, INTERVAL, t0).await);
        assert!(limiter.try_acquire_at(2, INTERVAL, t0).await);
    }

    #[tokio::test]
    async fn remaining_counts_down() {
        let limiter = limiter();
        let t0 = 1_700_000_000_000;
        assert_eq!(limiter.remaining_at(1, INTERVAL, t0).await, Duration::ZERO);
        limiter.try_acquire_at(1, INTERVAL, t0).await;
        assert_eq!(
            limiter.remaining_at(1, INTERVAL, t0 + 1_000).await,
            Duration::from_secs(2)
        );
        assert_eq!(limiter.remaining_at(1, INTERVAL, t0 + 5_000).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn unreachable_store_degrades_open() {
        let limiter = RateLimiter::new(Arc::new(Unreachable));
        assert!(limiter.try_acquire(1, INTERVAL).await);
        assert!(limiter.try_acquire(1, INTERVAL).await);
        assert_eq!(limiter.remaining(1, INTERVAL).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn wall_clock_path_refuses_immediate_repeat() {
        let limiter = limiter();
        assert!(limiter.try_acquire(9, INTERVAL).await);
        assert!(!limiter.try_acquire(9, INTERVAL).await);
    }
}
