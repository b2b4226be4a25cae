//! Volatile counter store backing the rate limiter.
//!
//! [`CounterStore`] is the seam: the bot uses the in-process
//! [`MokaCounterStore`], tests plug in failing fakes to exercise the
//! limiter's fail-open path. Values are "last accepted" instants in
//! milliseconds since the Unix epoch.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use tracing::debug;

use crate::error::StoreResult;

// ── trait ────────────────────────────────────────────────────────────

/// A shared, possibly volatile, key/value store of millisecond stamps.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically store `now_ms` under `key` if the key is absent or its
    /// stamp is at least `min_interval` old. Returns whether it stored.
    ///
    /// A `false` result leaves the stored stamp untouched.
    async fn stamp_if_elapsed(
        &self,
        key: &str,
        now_ms: u64,
        min_interval: Duration,
    ) -> StoreResult<bool>;

    /// The stored stamp for `key`, if any.
    async fn last_stamp(&self, key: &str) -> StoreResult<Option<u64>>;
}

// ── stats ────────────────────────────────────────────────────────────

/// Admission counters.
#[derive(Debug, Default)]
pub struct CounterStats {
    stamped: AtomicU64,
    refused: AtomicU64,
}

impl CounterStats {
    pub fn stamped(&self) -> u64 {
        self.stamped.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    /// Share of refused attempts, 0.0 when nothing was attempted.
    pub fn refusal_rate(&self) -> f64 {
        let total = self.stamped() + self.refused();
        if total == 0 {
            return 0.0;
        }
        self.refused() as f64 / total as f64
    }
}

impl fmt::Display for CounterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stamped={} refused={} refusal_rate={:.2}%",
            self.stamped(),
            self.refused(),
            self.refusal_rate() * 100.0,
        )
    }
}

// ── moka implementation ──────────────────────────────────────────────

/// In-process [`CounterStore`] on `moka::future::Cache`.
///
/// Entries expire after the configured TTL, which must be at least the
/// longest interval the limiter asks about.
#[derive(Clone)]
pub struct MokaCounterStore {
    inner: Cache<String, u64>,
    stats: Arc<CounterStats>,
}

impl MokaCounterStore {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        debug!(max_capacity, ttl_secs = ttl.as_secs(), "counter store created");
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            stats: Arc::new(CounterStats::default()),
        }
    }

    pub fn stats(&self) -> &CounterStats {
        &self.stats
    }
}

#[async_trait]
impl CounterStore for MokaCounterStore {
    async fn stamp_if_elapsed(
        &self,
        key: &str,
        now_ms: u64,
        min_interval: Duration,
    ) -> StoreResult<bool> {
        let interval_ms = min_interval.as_millis() as u64;

        // `and_compute_with` holds the entry lock for the duration of the
        // closure, so two racing callers cannot both stamp.
        let result = self
            .inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let op = match current.map(|entry| entry.into_value()) {
                    Some(last) if now_ms.saturating_sub(last) < interval_ms => Op::Nop,
                    _ => Op::Put(now_ms),
                };
                std::future::ready(op)
            })
            .await;

        let stamped = matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_));
        if stamped {
            self.stats.stamped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.refused.fetch_add(1, Ordering::Relaxed);
        }
        Ok(stamped)
    }

    async fn last_stamp(&self, key: &str) -> StoreResult<Option<u64>> {
        Ok(self.inner.get(key).await)
    }
}

// ── tests ────────────────────────────────────────────────────────────
