//! Operator subcommands: migrations, credit grants, payments, promo codes,
//! manual replenishment, and status.

use std::path::Path;

use alice_core::ReplenishJob;
use alice_store::migration::{current_version, latest_version};
use alice_store::promo::normalize_code;
use alice_store::{
    AccountStore, ConfirmOutcome, CreditLedger, Database, NewPromoCode, PaymentStore, PromoStore,
    ReplenishOutcome, StateStore,
};
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};

use crate::cli::{PaymentAction, PromoAction};
use crate::config::AppConfig;
use crate::helpers::open_database;

fn ledger(config: &AppConfig, db: &Database) -> CreditLedger {
    CreditLedger::new(db.clone(), config.ledger.baseline_credits)
}

pub async fn cmd_migrate(config: &AppConfig) -> Result<()> {
    let db = open_database(&config.alice.database).await?;
    let version = db.execute(current_version).await?;
    println!(
        "Database {} is at schema version {version}.",
        config.alice.database.display()
    );
    Ok(())
}

pub async fn cmd_replenish(config: &AppConfig, force: bool) -> Result<()> {
    let db = open_database(&config.alice.database).await?;
    let job = ReplenishJob::new(
        ledger(config, &db),
        config.ledger.replenish_floor,
        config.utc_offset()?,
    );

    let stats = if force {
        job.force().await?
    } else {
        match job.run_once(Utc::now()).await? {
            ReplenishOutcome::Ran(stats) => stats,
            ReplenishOutcome::AlreadyRan => {
                println!(
                    "Replenishment for {} was already applied. Use --force to run again.",
                    job.day_key(Utc::now())
                );
                return Ok(());
            }
        }
    };

    println!(
        "Checked {} accounts, topped up {} to {} credits ({} credits added).",
        stats.accounts_checked,
        stats.accounts_replenished,
        job.floor(),
        stats.credits_added
    );
    Ok(())
}

pub async fn cmd_credit(config: &AppConfig, owner: i64, amount: i64) -> Result<()> {
    if amount <= 0 {
        bail!("amount must be positive, got {amount}");
    }
    let db = open_database(&config.alice.database).await?;
    let ledger = ledger(config, &db);
    ledger.initialize_if_absent(owner).await?;
    let balance = ledger.credit(owner, amount).await?;
    println!("Added {amount} credits to {owner}. New balance: {balance}.");
    Ok(())
}

pub async fn cmd_payment(config: &AppConfig, action: PaymentAction) -> Result<()> {
    let db = open_database(&config.alice.database).await?;
    let payments = PaymentStore::new(db.clone());

    match action {
        PaymentAction::Record {
            order_id,
            owner,
            units,
        } => {
            if units <= 0 {
                bail!("units must be positive, got {units}");
            }
            ledger(config, &db).initialize_if_absent(owner).await?;
            let payment = payments.record(&order_id, owner, units).await?;
            println!(
                "Recorded order {} for {} ({} credits, {}).",
                payment.order_id, payment.owner_id, payment.units, payment.status
            );
        }
        PaymentAction::Confirm { order_id } => match payments.confirm(&order_id).await? {
            ConfirmOutcome::Credited { units, balance } => {
                println!("Order {order_id} confirmed: +{units} credits, balance {balance}.");
            }
            ConfirmOutcome::AlreadyPaid => println!("Order {order_id} was already confirmed."),
            ConfirmOutcome::PreviouslyFailed => {
                bail!("order {order_id} was marked failed and cannot be confirmed")
            }
        },
        PaymentAction::Fail { order_id } => {
            let payment = payments.fail(&order_id).await?;
            println!("Order {} is now {}.", payment.order_id, payment.status);
        }
        PaymentAction::List { owner, limit } => {
            let list = payments.list_for_owner(owner, limit).await?;
            if list.is_empty() {
                println!("No orders for {owner}.");
            }
            for p in list {
                println!("  {:<24} {:>6} credits  {}", p.order_id, p.units, p.status);
            }
        }
    }
    Ok(())
}

pub async fn cmd_promo(config: &AppConfig, action: PromoAction) -> Result<()> {
    let db = open_database(&config.alice.database).await?;
    let promos = PromoStore::new(db);

    match action {
        PromoAction::Create {
            code,
            reward,
            max_uses,
            expires_in_days,
        } => {
            if reward <= 0 {
                bail!("reward must be positive, got {reward}");
            }
            let expires_at = expires_in_days
                .map(|days| (Utc::now() + chrono::Duration::days(days)).timestamp_micros());
            let promo = promos
                .create(NewPromoCode {
                    code,
                    reward,
                    max_uses,
                    expires_at,
                })
                .await?;
            println!("Created promo code {} worth {} credits.", promo.code, promo.reward);
        }
        PromoAction::Deactivate { code } => {
            promos.deactivate(&code).await?;
            println!("Promo code {} deactivated.", normalize_code(&code));
        }
        PromoAction::Show { code } => match promos.get(&code).await? {
            Some(promo) => {
                let limit = promo
                    .max_uses
                    .map_or_else(|| "unlimited".to_string(), |m| m.to_string());
                println!("  Code:      {}", promo.code);
                println!("  Reward:    {} credits", promo.reward);
                println!("  Active:    {}", promo.active);
                println!("  Uses:      {} / {limit}", promo.current_uses);
                match promo.expires_at.and_then(DateTime::<Utc>::from_timestamp_micros) {
                    Some(at) => println!("  Expires:   {}", at.format("%Y-%m-%d %H:%M UTC")),
                    None => println!("  Expires:   never"),
                }
            }
            None => bail!("no promo code {code}"),
        },
    }
    Ok(())
}

pub async fn cmd_status(config: &AppConfig, config_path: &Path) -> Result<()> {
    println!();
    println!("  Alice Status");
    println!("  ============");
    println!();

    if config_path.exists() {
        println!("  Config:           OK ({})", config_path.display());
    } else {
        println!("  Config:           MISSING, using defaults");
    }

    let db_path = &config.alice.database;
    if db_path.exists() {
        let db = open_database(db_path).await?;
        let version = db.execute(current_version).await?;
        println!(
            "  Database:         OK ({}, schema v{version}/{})",
            db_path.display(),
            latest_version()
        );

        let accounts = AccountStore::new(db.clone()).count().await?;
        let stats = ledger(config, &db).stats(config.ledger.replenish_floor).await?;
        let last_sweep = StateStore::new(db).last_replenish_day().await?;
        println!("  Accounts:         {accounts}");
        println!("    at zero:        {}", stats.at_zero);
        println!(
            "    below floor:    {} (floor {})",
            stats.below_floor, config.ledger.replenish_floor
        );
        println!("    at/above floor: {}", stats.at_or_above_floor);
        println!("  Credits held:     {}", stats.credits_outstanding);
        println!(
            "  Last replenish:   {}",
            last_sweep.as_deref().unwrap_or("never")
        );
    } else {
        println!(
            "  Database:         NOT INITIALIZED (run `alice migrate`), expected at {}",
            db_path.display()
        );
    }

    println!(
        "  Generation:       {} at {} (model {})",
        config.generation.api_format.as_str(),
        config.generation.base_url,
        config.generation.model
    );
    if config.generation.api_key.is_empty() {
        println!("  API key:          NOT SET");
    } else {
        println!("  API key:          CONFIGURED");
    }
    if config.bot.token.is_some() {
        println!("  Telegram token:   CONFIGURED");
    } else {
        println!("  Telegram token:   NOT SET");
    }
    println!(
        "  Replenish:        `{}` at UTC{:+}",
        config.ledger.replenish_cron, config.ledger.utc_offset_hours
    );
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &tempfile::TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.alice.database = dir.path().join("nested").join("alice.db");
        config
    }

    #[tokio::test]
    async fn migrate_creates_the_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        cmd_migrate(&config).await.unwrap();
        assert!(config.alice.database.exists());
    }

    #[tokio::test]
    async fn credit_rejects_non_positive_amounts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        assert!(cmd_credit(&config, 1, 0).await.is_err());
        cmd_credit(&config, 1, 15).await.unwrap();

        let db = open_database(&config.alice.database).await.unwrap();
        assert_eq!(ledger(&config, &db).get_balance(1).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn payment_confirmation_credits_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        cmd_payment(
            &config,
            PaymentAction::Record {
                order_id: "ord-1".into(),
                owner: 9,
                units: 100,
            },
        )
        .await
        .unwrap();
        for _ in 0..2 {
            cmd_payment(
                &config,
                PaymentAction::Confirm {
                    order_id: "ord-1".into(),
                },
            )
            .await
            .unwrap();
        }

        let db = open_database(&config.alice.database).await.unwrap();
        assert_eq!(ledger(&config, &db).get_balance(9).await.unwrap(), 110);
    }

    #[tokio::test]
    async fn failed_orders_cannot_be_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let record = PaymentAction::Record {
            order_id: "ord-2".into(),
            owner: 3,
            units: 50,
        };
        cmd_payment(&config, record).await.unwrap();
        cmd_payment(&config, PaymentAction::Fail { order_id: "ord-2".into() })
            .await
            .unwrap();
        let confirm = PaymentAction::Confirm {
            order_id: "ord-2".into(),
        };
        assert!(cmd_payment(&config, confirm).await.is_err());
    }

    #[tokio::test]
    async fn replenish_runs_once_per_day_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let db = open_database(&config.alice.database).await.unwrap();
        let ledger = ledger(&config, &db);
        ledger.initialize_if_absent(4).await.unwrap();
        ledger.debit_one(4).await.unwrap();

        cmd_replenish(&config, false).await.unwrap();
        assert_eq!(ledger.get_balance(4).await.unwrap(), 10);

        ledger.debit_one(4).await.unwrap();
        cmd_replenish(&config, false).await.unwrap();
        assert_eq!(ledger.get_balance(4).await.unwrap(), 9);

        cmd_replenish(&config, true).await.unwrap();
        assert_eq!(ledger.get_balance(4).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn promo_create_normalizes_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let create = PromoAction::Create {
            code: " welcome ".into(),
            reward: 20,
            max_uses: Some(5),
            expires_in_days: Some(3),
        };
        cmd_promo(&config, create).await.unwrap();

        let db = open_database(&config.alice.database).await.unwrap();
        let promo = PromoStore::new(db).get("WELCOME").await.unwrap().unwrap();
        assert_eq!(promo.max_uses, Some(5));
        assert!(promo.expires_at.unwrap() > Utc::now().timestamp_micros());
    }

    #[tokio::test]
    async fn status_works_before_and_after_migration() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        cmd_status(&config, &dir.path().join("missing.toml")).await.unwrap();
        cmd_migrate(&config).await.unwrap();
        cmd_status(&config, &dir.path().join("missing.toml")).await.unwrap();
    }
}
