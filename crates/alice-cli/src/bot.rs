//! Telegram long-poll gateway.
//!
//! One task per inbound update, so a slow generation for one chat never
//! holds up another. The update offset is persisted after each batch is
//! dispatched; a crash mid-batch drops those messages rather than charging
//! for them twice.

use std::sync::Arc;
use std::time::Duration;

use alice_agent::GenerationClient;
use alice_core::{ChatPipeline, CronScheduler, RateLimiter, ReplenishJob, start_daily_replenish};
use alice_store::{
    AccountStore, ConversationStore, CreditLedger, MokaCounterStore, PromoStore,
    ReplenishOutcome, StateStore,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::commands::{Outgoing, Services};
use crate::config::AppConfig;
use crate::helpers::{install_panic_hook, open_database};
use crate::messages::Messages;
use crate::telegram::{Incoming, TelegramApi, parse_update};

pub async fn cmd_bot(config: AppConfig, poll_timeout: Option<u64>) -> Result<()> {
    install_panic_hook();

    let token = config
        .bot
        .token
        .clone()
        .context("TELEGRAM_BOT_TOKEN is not set")?;
    let telegram = TelegramApi::new(&token);
    let username = telegram
        .get_me()
        .await
        .context("Telegram rejected the bot token")?;
    info!(username = %username, "connected to Telegram");

    let db = open_database(&config.alice.database).await?;
    let client = GenerationClient::new(config.generation_client_config())
        .context("failed to configure the generation client")?;

    // -- pipeline ----------------------------------------------------------

    let ledger = CreditLedger::new(db.clone(), config.ledger.baseline_credits);
    // Stamps only matter for `min_interval`; keep them a little longer.
    let stamp_ttl = config.min_interval().max(Duration::from_secs(60));
    let stamps = MokaCounterStore::new(config.rate_limit.max_tracked_owners, stamp_ttl);
    let limiter = RateLimiter::new(Arc::new(stamps.clone()));
    let pipeline = ChatPipeline::new(
        ledger.clone(),
        ConversationStore::new(db.clone()),
        limiter,
        Arc::new(client.clone()),
        config.token_counter(),
        config.pipeline_config(),
    );

    // -- daily replenishment -----------------------------------------------

    let offset_tz = config.utc_offset()?;
    let job = ReplenishJob::new(ledger, config.ledger.replenish_floor, offset_tz);
    // Catch up on a sweep missed while the bot was down.
    match job.run_once(Utc::now()).await {
        Ok(ReplenishOutcome::Ran(stats)) => info!(
            replenished = stats.accounts_replenished,
            added = stats.credits_added,
            "startup replenishment applied"
        ),
        Ok(ReplenishOutcome::AlreadyRan) => debug!("today's replenishment already applied"),
        Err(e) => warn!(error = %e, "startup replenishment failed"),
    }
    let mut scheduler = CronScheduler::new(offset_tz);
    let worker = start_daily_replenish(&mut scheduler, job, &config.ledger.replenish_cron)
        .await
        .context("failed to schedule replenishment")?;

    // -- polling -------------------------------------------------------------

    let state = StateStore::new(db.clone());
    let mut offset = state.telegram_offset().await?;
    if offset > 0 {
        info!(offset, "resuming from saved update offset");
    }

    let poll_timeout = poll_timeout.unwrap_or(config.bot.poll_timeout_secs);
    let typing_interval = Duration::from_secs(config.bot.typing_interval_secs.max(1));
    let services = Arc::new(Services {
        pipeline,
        accounts: AccountStore::new(db.clone()),
        promos: PromoStore::new(db),
        messages: Messages::from_table(&config.messages),
        health: Some(client),
        config,
    });

    info!(poll_timeout, "bot is running, press Ctrl+C to stop");

    loop {
        let polled = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            polled = telegram.get_updates(offset, poll_timeout) => polled,
        };

        let updates = match polled {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "getUpdates failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        if updates.is_empty() {
            continue;
        }

        for update in &updates {
            if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                offset = offset.max(id + 1);
            }
            let Some(incoming) = parse_update(update) else {
                continue;
            };
            let services = Arc::clone(&services);
            let telegram = telegram.clone();
            tokio::spawn(async move {
                process(&services, &telegram, incoming, typing_interval).await;
            });
        }

        if let Err(e) = state.set_telegram_offset(offset).await {
            error!(offset, error = %e, "failed to persist update offset");
        }
    }

    scheduler.stop().await;
    if let Err(e) = worker.await {
        error!(error = %e, "replenish worker panicked");
    }
    info!(rate_limit = %stamps.stats(), "bot stopped");
    Ok(())
}

async fn process(
    services: &Services,
    telegram: &TelegramApi,
    incoming: Incoming,
    typing_interval: Duration,
) {
    match incoming {
        Incoming::Callback {
            callback_id,
            chat_id,
            data,
        } => {
            if let Err(e) = telegram.answer_callback_query(&callback_id).await {
                warn!(chat_id, error = %e, "answerCallbackQuery failed");
            }
            if let Some(reply) = services.handle_callback(chat_id, &data).await {
                deliver(telegram, chat_id, reply).await;
            }
        }
        Incoming::Message {
            chat_id,
            text,
            first_name,
        } => {
            debug!(chat_id, chars = text.chars().count(), "message received");
            let typing = spawn_typing(telegram.clone(), chat_id, typing_interval);
            let reply = services
                .handle_text(chat_id, &text, first_name.as_deref())
                .await;
            typing.notify_one();
            deliver(telegram, chat_id, reply).await;
        }
    }
}

/// Delivery is at-most-once: a paid reply that Telegram rejects is logged
/// with enough detail to refund it, never re-sent.
async fn deliver(telegram: &TelegramApi, chat_id: i64, reply: Outgoing) {
    let Err(e) = telegram
        .send_message(chat_id, &reply.text, reply.keyboard.as_ref())
        .await
    else {
        return;
    };
    match reply.charge {
        Some(charge) => error!(
            owner = chat_id,
            balance = charge.balance,
            reply_message_id = charge.reply_message_id,
            error = %e,
            "charged reply was not delivered"
        ),
        None => error!(chat_id, error = %e, "failed to deliver reply"),
    }
}

/// Keep "typing..." visible until the returned handle is notified.
fn spawn_typing(telegram: TelegramApi, chat_id: i64, interval: Duration) -> Arc<Notify> {
    let stop = Arc::new(Notify::new());
    let stop_rx = Arc::clone(&stop);
    tokio::spawn(async move {
        loop {
            if let Err(e) = telegram.send_chat_action(chat_id, "typing").await {
                debug!(chat_id, error = %e, "sendChatAction failed");
            }
            tokio::select! {
                _ = stop_rx.notified() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });
    stop
}
