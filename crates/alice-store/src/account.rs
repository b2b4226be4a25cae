//! User accounts: identity, profile preferences, and the age gate.
//!
//! Balance mutations live in [`crate::ledger`]; this module owns the
//! user-editable parts of the row.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::{Database, now_micros};
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// One Telegram chat's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    /// Stable per-chat identifier.
    pub owner_id: i64,
    /// Remaining credits. Never negative.
    pub credit_balance: i64,
    /// Free text included verbatim in the generation context.
    pub preferences: String,
    /// Messages at or before this instant (µs) are outside the current window.
    pub reset_cutoff: i64,
    pub age_verified: bool,
    pub last_replenished_at: Option<i64>,
    /// Set once at first contact (µs).
    pub created_at: i64,
    pub updated_at: i64,
}

pub(crate) const ACCOUNT_COLUMNS: &str = "owner_id, credit_balance, preferences, reset_cutoff, \
     age_verified, last_replenished_at, created_at, updated_at";

pub(crate) fn row_to_account(row: &Row<'_>) -> rusqlite::Result<UserAccount> {
    Ok(UserAccount {
        owner_id: row.get(0)?,
        credit_balance: row.get(1)?,
        preferences: row.get(2)?,
        reset_cutoff: row.get(3)?,
        age_verified: row.get(4)?,
        last_replenished_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

pub(crate) fn load_account(conn: &Connection, owner: i64) -> StoreResult<Option<UserAccount>> {
    let account = conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner_id = ?1"),
            rusqlite::params![owner],
            row_to_account,
        )
        .optional()?;
    Ok(account)
}

pub(crate) fn account_not_found(owner: i64) -> StoreError {
    StoreError::NotFound {
        entity: "account",
        id: owner.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  AccountStore
// ═══════════════════════════════════════════════════════════════════════

/// Profile operations on [`UserAccount`] rows.
#[derive(Clone)]
pub struct AccountStore {
    db: Database,
}

impl AccountStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch an account, or `None` if the owner never interacted.
    #[instrument(skip(self))]
    pub async fn get(&self, owner: i64) -> StoreResult<Option<UserAccount>> {
        self.db.execute(move |conn| load_account(conn, owner)).await
    }

    /// Replace the owner's free-text preferences.
    #[instrument(skip(self, preferences), fields(len = preferences.len()))]
    pub async fn set_preferences(&self, owner: i64, preferences: &str) -> StoreResult<()> {
        let preferences = preferences.trim().to_string();
        self.update(owner, move |conn, now| {
            Ok(conn.execute(
                "UPDATE accounts SET preferences = ?1, updated_at = ?2 WHERE owner_id = ?3",
                rusqlite::params![preferences, now, owner],
            )?)
        })
        .await?;
        debug!(owner, "preferences updated");
        Ok(())
    }

    /// Remove the owner's preferences.
    #[instrument(skip(self))]
    pub async fn clear_preferences(&self, owner: i64) -> StoreResult<()> {
        self.set_preferences(owner, "").await
    }

    /// Record that the owner confirmed the age gate.
    #[instrument(skip(self))]
    pub async fn set_age_verified(&self, owner: i64) -> StoreResult<()> {
        self.update(owner, move |conn, now| {
            Ok(conn.execute(
                "UPDATE accounts SET age_verified = 1, updated_at = ?1 WHERE owner_id = ?2",
                rusqlite::params![now, owner],
            )?)
        })
        .await
    }

    /// Number of accounts ever created.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM accounts", [], |r| r.get(0))?))
            .await
    }

    async fn update<F>(&self, owner: i64, f: F) -> StoreResult<()>
    where
        F: FnOnce(&Connection, i64) -> StoreResult<usize> + Send + 'static,
    {
        self.db
            .execute(move |conn| match f(conn, now_micros())? {
                0 => Err(account_not_found(owner)),
                _ => Ok(()),
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
