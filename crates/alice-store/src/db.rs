//! SQLite connection handle, pragmas, and transaction helpers.
//!
//! The [`Database`] struct wraps a single `rusqlite::Connection` behind an
//! `Arc<Mutex<>>`. Every call is dispatched onto the blocking pool with
//! `tokio::task::spawn_blocking`, so no async task ever holds the lock across
//! an `.await`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Thread-safe handle to the Alice SQLite database.
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path` and apply pragmas.
    ///
    /// Blocks on file I/O. Call during startup or from `spawn_blocking`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database. Used by unit tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and run all pending migrations.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run a closure against the connection on the blocking pool.
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     Ok(conn.query_row("SELECT count(*) FROM accounts", [], |row| row.get(0))?)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Run a closure inside an `IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so a concurrent writer in another
    /// process waits on `busy_timeout` instead of failing at commit time.
    /// The transaction commits only when the closure returns `Ok`; any error
    /// (including [`StoreError::InsufficientCredit`]) rolls it back.
    pub async fn transaction<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await?
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite pragmas");

        // WAL: readers never block the single writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // Safe with WAL; a power loss can drop the last commit, never corrupt.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 64 MiB of mmap is plenty for chat logs.
        conn.pragma_update(None, "mmap_size", 67_108_864_i64)?;

        // Negative value is KiB: ~16 MiB page cache.
        conn.pragma_update(None, "cache_size", -16_000_i32)?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // messages.owner_id must reference a real account.
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        info!("database pragmas applied (WAL, mmap 64MiB, cache 16MiB)");
        Ok(())
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
///
/// Microsecond resolution keeps back-to-back appends distinguishable; the
/// per-owner monotonic bump in [`crate::conversation`] covers the rest.
pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .execute(|conn| Ok(conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory().unwrap();
        let enabled: i64 = db
            .execute(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let result: StoreResult<()> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO accounts (owner_id, credit_balance, created_at, updated_at) \
                     VALUES (1, 10, 0, 0)",
                    [],
                )?;
                Err(StoreError::InvalidArgument("abort".into()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .execute(|conn| {
                Ok(conn.query_row("SELECT count(*) FROM accounts", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn transaction_commits_on_ok() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        db.transaction(|tx| {
            tx.execute(
                "INSERT INTO accounts (owner_id, credit_balance, created_at, updated_at) \
                 VALUES (7, 3, 0, 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let balance: i64 = db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT credit_balance FROM accounts WHERE owner_id = 7",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(balance, 3);
    }
}
