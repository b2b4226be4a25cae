//! Atomic commit of one completed user/assistant exchange.
//!
//! A reply is only persisted together with the credit that pays for it:
//! the debit, the user message, and the assistant message share one
//! transaction. If the balance hit zero in the meantime nothing is written.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::conversation::{ConversationStore, MessageRole, insert_message};
use crate::db::now_micros;
use crate::error::StoreResult;
use crate::ledger::debit_in;

/// What a committed exchange wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeReceipt {
    pub user_message_id: i64,
    pub reply_message_id: i64,
    /// Balance after the debit.
    pub balance: i64,
}

impl ConversationStore {
    /// Debit one credit and append both sides of the exchange.
    ///
    /// Fails with [`crate::StoreError::InsufficientCredit`] (and writes
    /// nothing) if the owner has no credit left at commit time.
    #[instrument(skip(self, user_text, reply_text))]
    pub async fn commit_exchange(
        &self,
        owner: i64,
        user_text: &str,
        reply_text: &str,
    ) -> StoreResult<ExchangeReceipt> {
        let user_text = user_text.to_string();
        let reply_text = reply_text.to_string();

        let receipt = self
            .db
            .transaction(move |tx| {
                let balance = debit_in(tx, owner, now_micros())?;
                let (user_message_id, _) = insert_message(tx, owner, MessageRole::User, &user_text)?;
                let (reply_message_id, _) =
                    insert_message(tx, owner, MessageRole::Assistant, &reply_text)?;
                Ok(ExchangeReceipt {
                    user_message_id,
                    reply_message_id,
                    balance,
                })
            })
            .await?;

        info!(owner, balance = receipt.balance, "exchange committed");
        Ok(receipt)
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ledger::CreditLedger;

    async fn setup(baseline: i64) -> (ConversationStore, CreditLedger) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let ledger = CreditLedger::new(db.clone(), baseline);
        ledger.initialize_if_absent(1).await.unwrap();
        (ConversationStore::new(db), ledger)
    }

    #[tokio::test]
    async fn commit_writes_both_messages_and_debits() {
        let (store, ledger) = setup(3).await;

        let receipt = store.commit_exchange(1, "hello", "hi there").await.unwrap();
        assert_eq!(receipt.balance, 2);
        assert!(receipt.reply_message_id > receipt.user_message_id);
        assert_eq!(ledger.get_balance(1).await.unwrap(), 2);

        let window = store.current_window(1).await.unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].role, MessageRole::User);
        assert_eq!(window[1].role, MessageRole::Assistant);
        assert_eq!(window[1].content, "hi there");
    }

    #[tokio::test]
    async fn commit_without_credit_writes_nothing() {
        let (store, ledger) = setup(0).await;

        let err = store.commit_exchange(1, "hello", "hi").await.unwrap_err();
        assert!(err.is_insufficient_credit());
        assert_eq!(store.count_all(1).await.unwrap(), 0);
        assert_eq!(ledger.get_balance(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_commits_respect_balance() {
        let (store, ledger) = setup(3).await;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .commit_exchange(1, &format!("q{i}"), &format!("a{i}"))
                        .await
                })
            })
            .collect();

        let mut committed = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                committed += 1;
            }
        }

        assert_eq!(committed, 3);
        assert_eq!(ledger.get_balance(1).await.unwrap(), 0);
        assert_eq!(store.count_all(1).await.unwrap(), 6);
    }
}
