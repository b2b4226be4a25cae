//! Credit ledger: the authoritative balance of generation replies per owner.
//!
//! Every balance change is a single conditional `UPDATE`, never a
//! read-modify-write, so concurrent debits and the daily sweep cannot lose
//! each other's writes. The balance column also carries a
//! `CHECK(credit_balance >= 0)` constraint as a last line.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::account::{UserAccount, account_not_found, load_account};
use crate::bot_state::keys;
use crate::db::{Database, now_micros};
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Result counters of one replenishment sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplenishStats {
    pub accounts_checked: i64,
    pub accounts_replenished: i64,
    pub credits_added: i64,
}

/// Outcome of [`CreditLedger::replenish_for_day`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplenishOutcome {
    /// The sweep ran for this day.
    Ran(ReplenishStats),
    /// A sweep for this day was already recorded; nothing changed.
    AlreadyRan,
}

/// Distribution of balances relative to a floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub accounts: i64,
    pub at_zero: i64,
    pub below_floor: i64,
    pub at_or_above_floor: i64,
    pub credits_outstanding: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared SQL (also used by exchange, promo, and payment transactions)
// ═══════════════════════════════════════════════════════════════════════

/// Take one credit from `owner`, returning the new balance.
pub(crate) fn debit_in(conn: &Connection, owner: i64, now: i64) -> StoreResult<i64> {
    let balance: Option<i64> = conn
        .query_row(
            "UPDATE accounts SET credit_balance = credit_balance - 1, updated_at = ?1 \
             WHERE owner_id = ?2 AND credit_balance > 0 \
             RETURNING credit_balance",
            rusqlite::params![now, owner],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(balance) = balance {
        return Ok(balance);
    }
    if load_account(conn, owner)?.is_some() {
        Err(StoreError::InsufficientCredit { owner })
    } else {
        Err(account_not_found(owner))
    }
}

/// Add `amount` credits to `owner`, returning the new balance.
pub(crate) fn credit_in(conn: &Connection, owner: i64, amount: i64, now: i64) -> StoreResult<i64> {
    if amount <= 0 {
        return Err(StoreError::InvalidArgument(format!(
            "credit amount must be positive, got {amount}"
        )));
    }

    conn.query_row(
        "UPDATE accounts SET credit_balance = credit_balance + ?1, updated_at = ?2 \
         WHERE owner_id = ?3 RETURNING credit_balance",
        rusqlite::params![amount, now, owner],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| account_not_found(owner))
}

fn replenish_in(conn: &Connection, floor: i64, now: i64) -> StoreResult<ReplenishStats> {
    let (accounts_checked, credits_added): (i64, i64) = conn.query_row(
        "SELECT count(*), \
                COALESCE(SUM(CASE WHEN credit_balance < ?1 THEN ?1 - credit_balance ELSE 0 END), 0) \
         FROM accounts",
        rusqlite::params![floor],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    // Floor-to, not additive: accounts at or above the floor keep what they have.
    let replenished = conn.execute(
        "UPDATE accounts SET credit_balance = ?1, last_replenished_at = ?2, updated_at = ?2 \
         WHERE credit_balance < ?1",
        rusqlite::params![floor, now],
    )?;

    Ok(ReplenishStats {
        accounts_checked,
        accounts_replenished: replenished as i64,
        credits_added,
    })
}

fn check_floor(floor: i64) -> StoreResult<()> {
    if floor < 0 {
        return Err(StoreError::InvalidArgument(format!(
            "replenish floor must not be negative, got {floor}"
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  CreditLedger
// ═══════════════════════════════════════════════════════════════════════

/// Balance operations over the `accounts` table.
#[derive(Clone)]
pub struct CreditLedger {
    db: Database,
    /// Credits granted to a brand-new account.
    baseline: i64,
}

impl CreditLedger {
    /// Create a ledger that grants `baseline` credits on first contact.
    pub fn new(db: Database, baseline: i64) -> Self {
        Self {
            db,
            baseline: baseline.max(0),
        }
    }

    pub fn baseline(&self) -> i64 {
        self.baseline
    }

    /// Create the account with the baseline allotment unless it exists.
    ///
    /// Calling this for an existing owner returns the stored account as is.
    #[instrument(skip(self))]
    pub async fn initialize_if_absent(&self, owner: i64) -> StoreResult<UserAccount> {
        let baseline = self.baseline;
        self.db
            .execute(move |conn| {
                let now = now_micros();
                let inserted = conn.execute(
                    "INSERT INTO accounts (owner_id, credit_balance, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?3) ON CONFLICT(owner_id) DO NOTHING",
                    rusqlite::params![owner, baseline, now],
                )?;
                if inserted > 0 {
                    info!(owner, baseline, "account created");
                }
                load_account(conn, owner)?.ok_or_else(|| account_not_found(owner))
            })
            .await
    }

    /// Current balance. Fails with `NotFound` for an unknown owner.
    #[instrument(skip(self))]
    pub async fn get_balance(&self, owner: i64) -> StoreResult<i64> {
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT credit_balance FROM accounts WHERE owner_id = ?1",
                    rusqlite::params![owner],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| account_not_found(owner))
            })
            .await
    }

    /// Atomically take one credit.
    ///
    /// Returns the new balance, or [`StoreError::InsufficientCredit`] when
    /// the balance is already zero. Concurrent callers for the same owner
    /// each see a distinct outcome; the balance never goes below zero.
    #[instrument(skip(self))]
    pub async fn debit_one(&self, owner: i64) -> StoreResult<i64> {
        let balance = self
            .db
            .execute(move |conn| debit_in(conn, owner, now_micros()))
            .await?;
        debug!(owner, balance, "credit debited");
        Ok(balance)
    }

    /// Atomically add `amount` credits. Used by purchases and promo grants.
    #[instrument(skip(self))]
    pub async fn credit(&self, owner: i64, amount: i64) -> StoreResult<i64> {
        let balance = self
            .db
            .execute(move |conn| credit_in(conn, owner, amount, now_micros()))
            .await?;
        info!(owner, amount, balance, "credits added");
        Ok(balance)
    }

    /// Raise every balance below `floor` to exactly `floor`.
    ///
    /// Runs unconditionally. The scheduled job goes through
    /// [`replenish_for_day`](Self::replenish_for_day) instead.
    #[instrument(skip(self))]
    pub async fn daily_replenish_floor(&self, floor: i64) -> StoreResult<ReplenishStats> {
        check_floor(floor)?;
        let stats = self
            .db
            .transaction(move |tx| replenish_in(tx, floor, now_micros()))
            .await?;
        info!(
            floor,
            checked = stats.accounts_checked,
            replenished = stats.accounts_replenished,
            added = stats.credits_added,
            "replenishment sweep finished"
        );
        Ok(stats)
    }

    /// Run the floor sweep at most once per `day_key` (e.g. `2026-10-16`).
    ///
    /// The day marker and the balance update commit in one transaction, so a
    /// crash can neither skip a day nor apply it twice.
    #[instrument(skip(self))]
    pub async fn replenish_for_day(&self, day_key: &str, floor: i64) -> StoreResult<ReplenishOutcome> {
        check_floor(floor)?;
        let day_key = day_key.to_string();
        let outcome = self
            .db
            .transaction(move |tx| {
                let last: Option<String> = tx
                    .query_row(
                        "SELECT value FROM bot_state WHERE key = ?1",
                        rusqlite::params![keys::LAST_REPLENISH_DAY],
                        |row| row.get(0),
                    )
                    .optional()?;
                if last.as_deref() == Some(day_key.as_str()) {
                    return Ok(ReplenishOutcome::AlreadyRan);
                }

                let stats = replenish_in(tx, floor, now_micros())?;
                tx.execute(
                    "INSERT INTO bot_state (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![keys::LAST_REPLENISH_DAY, day_key],
                )?;
                Ok(ReplenishOutcome::Ran(stats))
            })
            .await?;

        match outcome {
            ReplenishOutcome::Ran(stats) => info!(
                floor,
                replenished = stats.accounts_replenished,
                added = stats.credits_added,
                "daily replenishment applied"
            ),
            ReplenishOutcome::AlreadyRan => debug!("daily replenishment already applied today"),
        }
        Ok(outcome)
    }

    /// Balance distribution relative to `floor`.
    pub async fn stats(&self, floor: i64) -> StoreResult<LedgerStats> {
        self.db
            .execute(move |conn| {
                Ok(conn.query_row(
                    "SELECT count(*), \
                            COALESCE(SUM(credit_balance = 0), 0), \
                            COALESCE(SUM(credit_balance < ?1), 0), \
                            COALESCE(SUM(credit_balance >= ?1), 0), \
                            COALESCE(SUM(credit_balance), 0) \
                     FROM accounts",
                    rusqlite::params![floor],
                    |row| {
                        Ok(LedgerStats {
                            accounts: row.get(0)?,
                            at_zero: row.get(1)?,
                            below_floor: row.get(2)?,
                            at_or_above_floor: row.get(3)?,
                            credits_outstanding: row.get(4)?,
                        })
                    },
                )?)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
