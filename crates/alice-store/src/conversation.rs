//! Append-only conversation log with a logical reset cutoff.
//!
//! Messages are never updated or deleted. `reset` only moves the owner's
//! `reset_cutoff` forward; the current window is everything newer than it.
//! Timestamps are microseconds and strictly increasing per owner, which
//! keeps "newer than the cutoff" well defined even for same-instant writes.

use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::account::account_not_found;
use crate::db::{Database, now_micros};
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Who authored a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(StoreError::InvalidArgument(format!(
                "unknown message role: {other}"
            ))),
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub owner_id: i64,
    pub role: MessageRole,
    pub content: String,
    /// Microseconds since the Unix epoch.
    pub created_at: i64,
}

const MESSAGE_COLUMNS: &str = "m.id, m.owner_id, m.role, m.content, m.created_at";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    let role = role.parse::<MessageRole>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(StoredMessage {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Shared SQL
// ═══════════════════════════════════════════════════════════════════════

/// Next timestamp for `owner`: wall clock, bumped past both the newest
/// message and the reset cutoff.
pub(crate) fn next_timestamp(conn: &Connection, owner: i64) -> StoreResult<i64> {
    let high_water: Option<i64> = conn
        .query_row(
            "SELECT MAX(a.reset_cutoff, \
                        COALESCE((SELECT MAX(created_at) FROM messages WHERE owner_id = ?1), 0)) \
             FROM accounts a WHERE a.owner_id = ?1",
            rusqlite::params![owner],
            |row| row.get(0),
        )
        .optional()?;

    let high_water = high_water.ok_or_else(|| account_not_found(owner))?;
    Ok(now_micros().max(high_water + 1))
}

/// Insert one message and return `(id, created_at)`.
pub(crate) fn insert_message(
    conn: &Connection,
    owner: i64,
    role: MessageRole,
    content: &str,
) -> StoreResult<(i64, i64)> {
    let created_at = next_timestamp(conn, owner)?;
    conn.execute(
        "INSERT INTO messages (owner_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![owner, role.as_str(), content, created_at],
    )?;
    Ok((conn.last_insert_rowid(), created_at))
}

// ═══════════════════════════════════════════════════════════════════════
//  ConversationStore
// ═══════════════════════════════════════════════════════════════════════

/// Per-owner message log.
#[derive(Clone)]
pub struct ConversationStore {
    pub(crate) db: Database,
}

impl ConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one message and return its id.
    ///
    /// The owner must already have an account.
    #[instrument(skip(self, content), fields(len = content.len()))]
    pub async fn append(&self, owner: i64, role: MessageRole, content: &str) -> StoreResult<i64> {
        let content = content.to_string();
        let (id, created_at) = self
            .db
            .execute(move |conn| insert_message(conn, owner, role, &content))
            .await?;
        debug!(owner, id, %role, created_at, "message appended");
        Ok(id)
    }

    /// Messages newer than the reset cutoff, oldest first.
    #[instrument(skip(self))]
    pub async fn current_window(&self, owner: i64) -> StoreResult<Vec<StoredMessage>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m \
                     JOIN accounts a ON a.owner_id = m.owner_id \
                     WHERE m.owner_id = ?1 AND m.created_at > a.reset_cutoff \
                     ORDER BY m.created_at ASC, m.id ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![owner], row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Every message the owner ever exchanged, oldest first.
    #[instrument(skip(self))]
    pub async fn full_history(&self, owner: i64) -> StoreResult<Vec<StoredMessage>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages m \
                     WHERE m.owner_id = ?1 ORDER BY m.created_at ASC, m.id ASC"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![owner], row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Total stored messages for `owner`, including those before the cutoff.
    pub async fn count_all(&self, owner: i64) -> StoreResult<i64> {
        self.db
            .execute(move |conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM messages WHERE owner_id = ?1",
                    rusqlite::params![owner],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    /// Messages in the current window for `owner`.
    pub async fn count_current(&self, owner: i64) -> StoreResult<i64> {
        self.db
            .execute(move |conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM messages m JOIN accounts a ON a.owner_id = m.owner_id \
                     WHERE m.owner_id = ?1 AND m.created_at > a.reset_cutoff",
                    rusqlite::params![owner],
                    |row| row.get(0),
                )?)
            })
            .await
    }

    /// Move the cutoff to now, hiding all existing messages from the window.
    ///
    /// Returns the new cutoff. Nothing is deleted.
    #[instrument(skip(self))]
    pub async fn reset(&self, owner: i64) -> StoreResult<i64> {
        let cutoff = self
            .db
            .execute(move |conn| {
                let now = now_micros();
                conn.query_row(
                    "UPDATE accounts SET \
                        reset_cutoff = MAX(?1, reset_cutoff, \
                            COALESCE((SELECT MAX(created_at) FROM messages WHERE owner_id = ?2), 0)), \
                        updated_at = ?1 \
                     WHERE owner_id = ?2 RETURNING reset_cutoff",
                    rusqlite::params![now, owner],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| account_not_found(owner))
            })
            .await?;
        info!(owner, cutoff, "conversation reset");
        Ok(cutoff)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CreditLedger;

    async fn setup() -> ConversationStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let ledger = CreditLedger::new(db.clone(), 10);
        ledger.initialize_if_absent(1).await.unwrap();
        ledger.initialize_if_absent(2).await.unwrap();
        ConversationStore::new(db)
    }

    #[test]
    fn role_parses_and_displays() {
        assert_eq!("user".parse::<MessageRole>().unwrap(), MessageRole::User);
        assert_eq!(MessageRole::Assistant.to_string(), "assistant");
        assert!("system".parse::<MessageRole>().is_err());
    }

    #[tokio::test]
    async fn window_is_oldest_first_and_per_owner() {
        let store = setup().await;
        store.append(1, MessageRole::User, "hi").await.unwrap();
        store.append(2, MessageRole::User, "other chat").await.unwrap();
        store.append(1, MessageRole::Assistant, "hello").await.unwrap();
        store.append(1, MessageRole::User, "how are you").await.unwrap();

        let window = store.current_window(1).await.unwrap();
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello", "how are you"]);
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let store = setup().await;
        for i in 0..50 {
            store.append(1, MessageRole::User, &i.to_string()).await.unwrap();
        }
        let history = store.full_history(1).await.unwrap();
        for pair in history.windows(2) {
            assert!(pair[1].created_at > pair[0].created_at);
        }
    }

    #[tokio::test]
    async fn reset_hides_but_keeps_history() {
        let store = setup().await;
        store.append(1, MessageRole::User, "a").await.unwrap();
        store.append(1, MessageRole::Assistant, "b").await.unwrap();

        store.reset(1).await.unwrap();

        assert!(store.current_window(1).await.unwrap().is_empty());
        assert_eq!(store.count_all(1).await.unwrap(), 2);
        assert_eq!(store.count_current(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn append_right_after_reset_is_visible() {
        let store = setup().await;
        store.append(1, MessageRole::User, "before").await.unwrap();
        store.reset(1).await.unwrap();
        store.append(1, MessageRole::User, "after").await.unwrap();

        let window = store.current_window(1).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "after");
    }

    #[tokio::test]
    async fn window_is_a_suffix_of_history() {
        let store = setup().await;
        for i in 0..4 {
            store.append(1, MessageRole::User, &format!("old {i}")).await.unwrap();
        }
        store.reset(1).await.unwrap();
        for i in 0..3 {
            store.append(1, MessageRole::User, &format!("new {i}")).await.unwrap();
        }

        let history = store.full_history(1).await.unwrap();
        let window = store.current_window(1).await.unwrap();
        assert_eq!(history.len(), 7);
        assert_eq!(&history[history.len() - window.len()..], window.as_slice());
    }

    #[tokio::test]
    async fn append_for_unknown_owner_fails() {
        let store = setup().await;
        let err = store.append(99, MessageRole::User, "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "account", .. }));
        assert!(store.reset(99).await.is_err());
    }
}
