//! Purchase records and exactly-once crediting of confirmed payments.
//!
//! The gateway may deliver the same confirmation several times; only the
//! first transition from `pending` to `paid` credits the owner.

use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::db::{Database, now_micros};
use crate::error::{StoreError, StoreResult};
use crate::ledger::credit_in;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown payment status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub order_id: String,
    pub owner_id: i64,
    pub units: i64,
    pub status: PaymentStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Result of [`PaymentStore::confirm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// First confirmation: the owner was credited.
    Credited { units: i64, balance: i64 },
    /// Already paid; nothing changed.
    AlreadyPaid,
    /// The order was marked failed earlier; nothing changed.
    PreviouslyFailed,
}

fn row_to_payment(row: &Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get(3)?;
    let status = status.parse::<PaymentStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Payment {
        order_id: row.get(0)?,
        owner_id: row.get(1)?,
        units: row.get(2)?,
        status,
        created_at: row.get(4)?,
        completed_at: row.get(5)?,
    })
}

const PAYMENT_COLUMNS: &str = "order_id, owner_id, units, status, created_at, completed_at";

fn load_payment(conn: &Connection, order_id: &str) -> StoreResult<Payment> {
    conn.query_row(
        &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = ?1"),
        rusqlite::params![order_id],
        row_to_payment,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound {
        entity: "payment",
        id: order_id.to_string(),
    })
}

#[derive(Clone)]
pub struct PaymentStore {
    db: Database,
}

impl PaymentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a pending order for `units` credits.
    #[instrument(skip(self))]
    pub async fn record(&self, order_id: &str, owner: i64, units: i64) -> StoreResult<Payment> {
        if units <= 0 {
            return Err(StoreError::InvalidArgument(format!(
                "payment units must be positive, got {units}"
            )));
        }
        let order_id = order_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO payments (order_id, owner_id, units, status, created_at) \
                     VALUES (?1, ?2, ?3, 'pending', ?4)",
                    rusqlite::params![order_id, owner, units, now_micros()],
                )?;
                load_payment(conn, &order_id)
            })
            .await
    }

    pub async fn get(&self, order_id: &str) -> StoreResult<Payment> {
        let order_id = order_id.to_string();
        self.db.execute(move |conn| load_payment(conn, &order_id)).await
    }

    /// Mark the order paid and credit its owner, at most once.
    #[instrument(skip(self))]
    pub async fn confirm(&self, order_id: &str) -> StoreResult<ConfirmOutcome> {
        let order_id = order_id.to_string();
        let outcome = self
            .db
            .transaction(move |tx| {
                let now = now_micros();
                let changed = tx.execute(
                    "UPDATE payments SET status = 'paid', completed_at = ?1 \
                     WHERE order_id = ?2 AND status = 'pending'",
                    rusqlite::params![now, order_id],
                )?;

                let payment = load_payment(tx, &order_id)?;
                if changed == 0 {
                    return Ok(match payment.status {
                        PaymentStatus::Failed => ConfirmOutcome::PreviouslyFailed,
                        _ => ConfirmOutcome::AlreadyPaid,
                    });
                }

                let balance = credit_in(tx, payment.owner_id, payment.units, now)?;
                Ok(ConfirmOutcome::Credited {
                    units: payment.units,
                    balance,
                })
            })
            .await?;

        match outcome {
            ConfirmOutcome::Credited { units, balance } => {
                info!(units, balance, "payment confirmed and credited")
            }
            other => warn!(?other, "duplicate or stale payment confirmation ignored"),
        }
        Ok(outcome)
    }

    /// Mark a pending order failed. Paid orders are left untouched.
    #[instrument(skip(self))]
    pub async fn fail(&self, order_id: &str) -> StoreResult<Payment> {
        let order_id = order_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE payments SET status = 'failed', completed_at = ?1 \
                     WHERE order_id = ?2 AND status = 'pending'",
                    rusqlite::params![now_micros(), order_id],
                )?;
                load_payment(conn, &order_id)
            })
            .await
    }

    /// The owner's orders, newest first.
    pub async fn list_for_owner(&self, owner: i64, limit: u32) -> StoreResult<Vec<Payment>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments WHERE owner_id = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![owner, limit], row_to_payment)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
