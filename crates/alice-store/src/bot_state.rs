//! Small persistent key-value table for process-level state.
//!
//! Holds the Telegram long-poll offset and the day marker of the last
//! replenishment sweep, both of which must survive restarts.

use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;

/// Well-known keys.
pub mod keys {
    /// Next `getUpdates` offset.
    pub const TELEGRAM_OFFSET: &str = "telegram.offset";
    /// Day key (`YYYY-MM-DD`) of the last applied replenishment.
    pub const LAST_REPLENISH_DAY: &str = "ledger.last_replenish_day";
}

#[derive(Clone)]
pub struct StateStore {
    db: Database,
}

impl StateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM bot_state WHERE key = ?1",
                        rusqlite::params![key],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await
    }

    /// Insert or overwrite.
    #[instrument(skip(self, value))]
    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO bot_state (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )?;
                debug!(key = %key, "state updated");
                Ok(())
            })
            .await
    }

    /// Saved polling offset, or 0 when absent or unparseable.
    pub async fn telegram_offset(&self) -> StoreResult<i64> {
        Ok(self
            .get(keys::TELEGRAM_OFFSET)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn set_telegram_offset(&self, offset: i64) -> StoreResult<()> {
        self.set(keys::TELEGRAM_OFFSET, &offset.to_string()).await
    }

    /// Day key of the last replenishment, if any ran.
    pub async fn last_replenish_day(&self) -> StoreResult<Option<String>> {
        self.get(keys::LAST_REPLENISH_DAY).await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> StateStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        StateStore::new(db)
    }

    #[tokio::test]
    async fn offset_defaults_to_zero() {
        let state = setup().await;
        assert_eq!(state.telegram_offset().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn offset_round_trips_and_overwrites() {
        let state = setup().await;
        state.set_telegram_offset(41).await.unwrap();
        state.set_telegram_offset(42).await.unwrap();
        assert_eq!(state.telegram_offset().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn garbage_offset_reads_as_zero() {
        let state = setup().await;
        state.set(keys::TELEGRAM_OFFSET, "garbage").await.unwrap();
        assert_eq!(state.telegram_offset().await.unwrap(), 0);
        assert!(state.last_replenish_day().await.unwrap().is_none());
    }
}
