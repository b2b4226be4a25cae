//! Promotional codes that grant credits once per owner.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::db::{Database, now_micros};
use crate::error::{StoreError, StoreResult};
use crate::ledger::credit_in;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A redeemable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoCode {
    /// Normalized: trimmed, upper case.
    pub code: String,
    pub reward: i64,
    pub active: bool,
    /// `None` means unlimited.
    pub max_uses: Option<i64>,
    pub current_uses: i64,
    /// Microseconds since the epoch; `None` never expires.
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

/// Parameters for [`PromoStore::create`].
#[derive(Debug, Clone)]
pub struct NewPromoCode {
    pub code: String,
    pub reward: i64,
    pub max_uses: Option<i64>,
    pub expires_at: Option<i64>,
}

/// Result of a redemption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoOutcome {
    Redeemed { reward: i64, balance: i64 },
    UnknownCode,
    Inactive,
    Exhausted,
    Expired,
    AlreadyUsed,
}

/// One past redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoRedemption {
    pub code: String,
    pub reward: i64,
    pub redeemed_at: i64,
}

/// Canonical form of a user-typed code.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn row_to_promo(row: &Row<'_>) -> rusqlite::Result<PromoCode> {
    Ok(PromoCode {
        code: row.get(0)?,
        reward: row.get(1)?,
        active: row.get(2)?,
        max_uses: row.get(3)?,
        current_uses: row.get(4)?,
        expires_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn load_promo(conn: &Connection, code: &str) -> StoreResult<Option<PromoCode>> {
    Ok(conn
        .query_row(
            "SELECT code, reward, active, max_uses, current_uses, expires_at, created_at \
             FROM promo_codes WHERE code = ?1",
            rusqlite::params![code],
            row_to_promo,
        )
        .optional()?)
}

// ═══════════════════════════════════════════════════════════════════════
//  PromoStore
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct PromoStore {
    db: Database,
}

impl PromoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new code. Fails if the normalized code already exists.
    #[instrument(skip(self), fields(code = %new.code))]
    pub async fn create(&self, new: NewPromoCode) -> StoreResult<PromoCode> {
        let code = normalize_code(&new.code);
        if code.is_empty() {
            return Err(StoreError::InvalidArgument("promo code must not be empty".into()));
        }
        if new.reward <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "promo reward must be positive, got {}",
                new.reward
            )));
        }

        let promo = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO promo_codes (code, reward, max_uses, expires_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![code, new.reward, new.max_uses, new.expires_at, now_micros()],
                )?;
                load_promo(conn, &code)?.ok_or_else(|| StoreError::NotFound {
                    entity: "promo code",
                    id: code.clone(),
                })
            })
            .await?;
        info!(code = %promo.code, reward = promo.reward, "promo code created");
        Ok(promo)
    }

    /// Look up a code (case-insensitive).
    pub async fn get(&self, code: &str) -> StoreResult<Option<PromoCode>> {
        let code = normalize_code(code);
        self.db.execute(move |conn| load_promo(conn, &code)).await
    }

    /// Disable a code without deleting its history.
    pub async fn deactivate(&self, code: &str) -> StoreResult<()> {
        let code = normalize_code(code);
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE promo_codes SET active = 0 WHERE code = ?1",
                    rusqlite::params![code],
                )?;
                if changed == 0 {
                    return Err(StoreError::NotFound {
                        entity: "promo code",
                        id: code,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Redeem `code` for `owner`.
    ///
    /// Validation, the credit, the usage counter, and the redemption record
    /// commit together.
    #[instrument(skip(self))]
    pub async fn redeem(&self, owner: i64, code: &str) -> StoreResult<PromoOutcome> {
        let code = normalize_code(code);
        let outcome = self
            .db
            .transaction(move |tx| {
                let now = now_micros();
                let Some(promo) = load_promo(tx, &code)? else {
                    return Ok(PromoOutcome::UnknownCode);
                };
                if !promo.active {
                    return Ok(PromoOutcome::Inactive);
                }
                if promo.max_uses.is_some_and(|max| promo.current_uses >= max) {
                    return Ok(PromoOutcome::Exhausted);
                }
                if promo.expires_at.is_some_and(|at| at <= now) {
                    return Ok(PromoOutcome::Expired);
                }

                let used: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM promo_redemptions WHERE code = ?1 AND owner_id = ?2)",
                    rusqlite::params![code, owner],
                    |row| row.get(0),
                )?;
                if used {
                    return Ok(PromoOutcome::AlreadyUsed);
                }

                let balance = credit_in(tx, owner, promo.reward, now)?;
                tx.execute(
                    "INSERT INTO promo_redemptions (code, owner_id, reward, redeemed_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![code, owner, promo.reward, now],
                )?;
                tx.execute(
                    "UPDATE promo_codes SET current_uses = current_uses + 1 WHERE code = ?1",
                    rusqlite::params![code],
                )?;
                Ok(PromoOutcome::Redeemed {
                    reward: promo.reward,
                    balance,
                })
            })
            .await?;

        info!(owner, ?outcome, "promo redemption attempted");
        Ok(outcome)
    }

    /// The owner's most recent redemptions, newest first.
    pub async fn history(&self, owner: i64, limit: u32) -> StoreResult<Vec<PromoRedemption>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT code, reward, redeemed_at FROM promo_redemptions \
                     WHERE owner_id = ?1 ORDER BY redeemed_at DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![owner, limit], |row| {
                        Ok(PromoRedemption {
                            code: row.get(0)?,
                            reward: row.get(1)?,
                            redeemed_at: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
