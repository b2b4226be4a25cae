//! # alice-store
//!
//! Storage engine for the Alice bot.
//!
//! SQLite (WAL) holds accounts, the append-only message log, promo codes,
//! and payments. A `moka` cache backs the per-owner rate-limit stamps.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  MokaCounterStore (rate-limit stamps)       │
//! ├─────────────────────────────────────────────┤
//! │  CreditLedger      (balances, replenish)    │
//! │  ConversationStore (log, reset, exchange)   │
//! │  AccountStore / PromoStore / PaymentStore   │
//! │  StateStore        (offset, day marker)     │
//! ├─────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, spawn_blocking)    │
//! │  Migrations (versioned, transactional)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use alice_store::{ConversationStore, CreditLedger, Database, MessageRole};
//!
//! let db = Database::open_and_migrate("data/alice.db").await?;
//! let ledger = CreditLedger::new(db.clone(), 10);
//! let log = ConversationStore::new(db);
//!
//! ledger.initialize_if_absent(chat_id).await?;
//! let receipt = log.commit_exchange(chat_id, "hi", "hello!").await?;
//! ```

pub mod account;
pub mod bot_state;
pub mod cache;
pub mod conversation;
pub mod db;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod migration;
pub mod payment;
pub mod promo;

// ── re-exports ───────────────────────────────────────────────────────

pub use account::{AccountStore, UserAccount};
pub use bot_state::StateStore;
pub use cache::{CounterStats, CounterStore, MokaCounterStore};
pub use conversation::{ConversationStore, MessageRole, StoredMessage};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use exchange::ExchangeReceipt;
pub use ledger::{CreditLedger, LedgerStats, ReplenishOutcome, ReplenishStats};
pub use payment::{ConfirmOutcome, Payment, PaymentStatus, PaymentStore};
pub use promo::{NewPromoCode, PromoCode, PromoOutcome, PromoRedemption, PromoStore};
