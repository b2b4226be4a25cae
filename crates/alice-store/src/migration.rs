//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number. Applied
//! versions are recorded in `_migrations`, so running them is idempotent.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    /// Strictly increasing (1, 2, 3, ...).
    version: u32,
    description: &'static str,
    /// May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "accounts and append-only message log",
        sql: r#"
            CREATE TABLE accounts (
                owner_id            INTEGER PRIMARY KEY,
                credit_balance      INTEGER NOT NULL CHECK(credit_balance >= 0),
                preferences         TEXT NOT NULL DEFAULT '',
                reset_cutoff        INTEGER NOT NULL DEFAULT 0,
                age_verified        BOOLEAN NOT NULL DEFAULT 0,
                last_replenished_at INTEGER,
                created_at          INTEGER NOT NULL,
                updated_at          INTEGER NOT NULL
            );
            CREATE INDEX idx_accounts_balance ON accounts(credit_balance);

            CREATE TABLE messages (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id   INTEGER NOT NULL REFERENCES accounts(owner_id),
                role       TEXT NOT NULL CHECK(role IN ('user','assistant')),
                content    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX idx_messages_owner_created ON messages(owner_id, created_at);
        "#,
    },
    Migration {
        version: 2,
        description: "bot_state key-value table (polling offset, replenish day)",
        sql: r#"
            CREATE TABLE bot_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 3,
        description: "promo codes and per-owner redemptions",
        sql: r#"
            CREATE TABLE promo_codes (
                code         TEXT PRIMARY KEY,
                reward       INTEGER NOT NULL CHECK(reward > 0),
                active       BOOLEAN NOT NULL DEFAULT 1,
                max_uses     INTEGER,
                current_uses INTEGER NOT NULL DEFAULT 0,
                expires_at   INTEGER,
                created_at   INTEGER NOT NULL
            );

            CREATE TABLE promo_redemptions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                code        TEXT NOT NULL REFERENCES promo_codes(code),
                owner_id    INTEGER NOT NULL REFERENCES accounts(owner_id),
                reward      INTEGER NOT NULL,
                redeemed_at INTEGER NOT NULL,
                UNIQUE(code, owner_id)
            );
            CREATE INDEX idx_promo_redemptions_owner ON promo_redemptions(owner_id);
        "#,
    },
    Migration {
        version: 4,
        description: "payments confirmed by the gateway webhook",
        sql: r#"
            CREATE TABLE payments (
                order_id     TEXT PRIMARY KEY,
                owner_id     INTEGER NOT NULL REFERENCES accounts(owner_id),
                units        INTEGER NOT NULL CHECK(units > 0),
                status       TEXT NOT NULL CHECK(status IN ('pending','paid','failed')),
                created_at   INTEGER NOT NULL,
                completed_at INTEGER
            );
            CREATE INDEX idx_payments_owner ON payments(owner_id);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// Synchronous; call it through [`crate::Database::run_migrations`].
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    Ok(())
}

/// Latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

/// Latest version known to this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

/// Apply one migration inside a manual `BEGIN IMMEDIATE` block.
///
/// `conn.transaction()` needs `&mut Connection`, which `Database::execute`
/// does not hand out.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let fail = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail(format!("failed to begin transaction: {e}")))?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| fail(format!("SQL execution failed: {e}")))?;
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp()
            ],
        )
        .map_err(|e| fail(format!("failed to record migration: {e}")))?;
        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| fail(format!("failed to commit: {e}")))?;
            info!(version = migration.version, "migration applied");
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(window[1].version > window[0].version);
        }
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());
        assert_eq!(latest_version(), 4);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' \
                 AND name NOT LIKE '\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(
            tables,
            vec![
                "accounts",
                "bot_state",
                "messages",
                "payments",
                "promo_codes",
                "promo_redemptions"
            ]
        );
    }

    #[test]
    fn negative_balance_is_rejected_by_schema() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let err = conn.execute(
            "INSERT INTO accounts (owner_id, credit_balance, created_at, updated_at) \
             VALUES (1, -1, 0, 0)",
            [],
        );
        assert!(err.is_err());
    }

    #[test]
    fn message_requires_existing_account() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let err = conn.execute(
            "INSERT INTO messages (owner_id, role, content, created_at) VALUES (99, 'user', 'hi', 1)",
            [],
        );
        assert!(err.is_err());
    }
}
