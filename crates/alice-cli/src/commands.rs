//! Slash commands, the age gate, and routing of plain text to the pipeline.
//!
//! Nothing here talks to Telegram: every handler returns an [`Outgoing`]
//! reply and the gateway in `bot.rs` delivers it.

use alice_agent::GenerationClient;
use alice_core::ChatPipeline;
use alice_core::InboundMessage;
use alice_store::{AccountStore, PromoOutcome, PromoStore};
use anyhow::Result;
use serde_json::Value;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::messages::{Messages, keys};
use crate::telegram::{CALLBACK_AGE_NO, CALLBACK_AGE_YES, inline_keyboard};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileAction {
    Show,
    Set(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start`, or `/start confirm` to pass the age gate without buttons.
    Start { confirm: bool },
    Help,
    About,
    Loans,
    Topup,
    Reset,
    Profile(ProfileAction),
    Promo(Option<String>),
    Health,
    Unknown(String),
}

/// Parse a slash command. `None` for ordinary text.
///
/// Accepts the `/cmd@BotName args` form Telegram uses in groups.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

    let command = match name.as_str() {
        "start" => Command::Start {
            confirm: args.eq_ignore_ascii_case("confirm"),
        },
        "help" => Command::Help,
        "about" => Command::About,
        "loans" | "balance" => Command::Loans,
        "topup" => Command::Topup,
        "reset" => Command::Reset,
        "profile" => Command::Profile(parse_profile(args)),
        "promo" => Command::Promo(Some(args).filter(|a| !a.is_empty()).map(str::to_string)),
        "health" => Command::Health,
        _ => Command::Unknown(name),
    };
    Some(command)
}

fn parse_profile(args: &str) -> ProfileAction {
    let (verb, rest) = match args.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (args, ""),
    };
    match verb.to_ascii_lowercase().as_str() {
        "set" if !rest.is_empty() => ProfileAction::Set(rest.to_string()),
        "clear" => ProfileAction::Clear,
        _ => ProfileAction::Show,
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// One reply to deliver, with an optional inline keyboard.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub text: String,
    pub keyboard: Option<Value>,
    /// Set when the reply was already paid for.
    pub charge: Option<Charge>,
}

/// What a generated reply cost, kept so a failed delivery can be refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charge {
    pub balance: i64,
    pub reply_message_id: i64,
}

impl Outgoing {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: None,
            charge: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Everything the handlers need, shared across update tasks.
pub struct Services {
    pub pipeline: ChatPipeline,
    pub accounts: AccountStore,
    pub promos: PromoStore,
    pub messages: Messages,
    pub config: AppConfig,
    /// Used by `/health`; absent in tests.
    pub health: Option<GenerationClient>,
}

impl Services {
    /// Route a text message: commands to their handler, anything else to
    /// the pipeline.
    pub async fn handle_text(&self, owner: i64, text: &str, display_name: Option<&str>) -> Outgoing {
        let result = match parse_command(text) {
            Some(command) => self.handle_command(owner, command, display_name).await,
            None => self.handle_chat(owner, text, display_name).await,
        };
        result.unwrap_or_else(|e| {
            error!(owner, error = %e, "handler failed");
            Outgoing::text(self.messages.get(keys::ERROR_GENERAL))
        })
    }

    /// Handle a button press. Unknown callback data is ignored.
    pub async fn handle_callback(&self, owner: i64, data: &str) -> Option<Outgoing> {
        let result = match data {
            CALLBACK_AGE_YES => self.confirm_age(owner).await,
            CALLBACK_AGE_NO => Ok(Outgoing::text(self.messages.get(keys::AGE_DECLINED))),
            _ => return None,
        };
        Some(result.unwrap_or_else(|e| {
            error!(owner, error = %e, "callback failed");
            Outgoing::text(self.messages.get(keys::ERROR_GENERAL))
        }))
    }

    async fn handle_chat(&self, owner: i64, text: &str, display_name: Option<&str>) -> Result<Outgoing> {
        if !self.age_ok(owner).await? {
            return Ok(Outgoing::text(self.messages.get(keys::AGE_REQUIRED)));
        }

        let mut inbound = InboundMessage::new(owner, text);
        if let Some(name) = display_name {
            inbound = inbound.with_display_name(name);
        }
        Ok(match self.pipeline.handle(&inbound).await {
            Ok(reply) => Outgoing {
                text: reply.text,
                keyboard: None,
                charge: Some(Charge {
                    balance: reply.balance,
                    reply_message_id: reply.reply_message_id,
                }),
            },
            Err(e) => Outgoing::text(self.messages.for_error(&e)),
        })
    }

    async fn handle_command(
        &self,
        owner: i64,
        command: Command,
        display_name: Option<&str>,
    ) -> Result<Outgoing> {
        let gated = !matches!(
            command,
            Command::Start { .. } | Command::Help | Command::About | Command::Unknown(_)
        );
        if gated && !self.age_ok(owner).await? {
            return Ok(Outgoing::text(self.messages.get(keys::AGE_REQUIRED)));
        }

        let msgs = &self.messages;
        let ledger = self.pipeline.ledger();

        let reply = match command {
            Command::Start { confirm } => {
                let account = ledger.initialize_if_absent(owner).await?;
                if confirm && !account.age_verified {
                    return self.confirm_age(owner).await;
                }
                if self.config.bot.require_age_verification && !account.age_verified {
                    self.age_gate()
                } else {
                    let name = display_name.unwrap_or(&self.config.persona.default_user_name);
                    Outgoing::text(msgs.get_with(keys::WELCOME, &[("name", name)]))
                }
            }
            Command::Help => Outgoing::text(msgs.get(keys::HELP)),
            Command::About => Outgoing::text(msgs.get(keys::ABOUT)),
            Command::Loans => {
                let account = ledger.initialize_if_absent(owner).await?;
                let balance = account.credit_balance.to_string();
                Outgoing::text(msgs.get_with(keys::LOANS, &[("balance", &balance)]))
            }
            Command::Topup => Outgoing::text(self.topup_text()),
            Command::Reset => {
                self.pipeline.reset(owner).await?;
                info!(owner, "conversation reset");
                Outgoing::text(msgs.get(keys::RESET_DONE))
            }
            Command::Profile(action) => self.profile(owner, action).await?,
            Command::Promo(None) => Outgoing::text(msgs.get(keys::PROMO_USAGE)),
            Command::Promo(Some(code)) => self.redeem(owner, &code).await?,
            Command::Health if self.config.alice.debug => Outgoing::text(self.health_text().await),
            Command::Health | Command::Unknown(_) => Outgoing::text(msgs.get(keys::UNKNOWN_COMMAND)),
        };
        Ok(reply)
    }

    // -- age gate --------------------------------------------------------

    async fn age_ok(&self, owner: i64) -> Result<bool> {
        if !self.config.bot.require_age_verification {
            return Ok(true);
        }
        Ok(self
            .accounts
            .get(owner)
            .await?
            .is_some_and(|account| account.age_verified))
    }

    fn age_gate(&self) -> Outgoing {
        let buttons = [
            (self.messages.get(keys::BUTTON_AGE_YES), CALLBACK_AGE_YES),
            (self.messages.get(keys::BUTTON_AGE_NO), CALLBACK_AGE_NO),
        ];
        Outgoing {
            text: self.messages.get(keys::AGE_GATE),
            keyboard: Some(inline_keyboard(&buttons)),
            charge: None,
        }
    }

    async fn confirm_age(&self, owner: i64) -> Result<Outgoing> {
        self.pipeline.ledger().initialize_if_absent(owner).await?;
        self.accounts.set_age_verified(owner).await?;
        info!(owner, "age verified");
        Ok(Outgoing::text(self.messages.get(keys::AGE_CONFIRMED)))
    }

    // -- individual commands ----------------------------------------------

    fn topup_text(&self) -> String {
        let msgs = &self.messages;
        let mut lines = vec![msgs.get(keys::TOPUP_HEADER)];
        for package in &self.config.payments.packages {
            lines.push(msgs.get_with(
                keys::TOPUP_ITEM,
                &[("credits", &package.credits.to_string()), ("price", &package.price)],
            ));
        }
        let contact = self.config.payments.contact.trim();
        if !contact.is_empty() {
            lines.push(String::new());
            lines.push(msgs.get_with(keys::TOPUP_FOOTER, &[("contact", contact)]));
        }
        lines.join("\n")
    }

    async fn profile(&self, owner: i64, action: ProfileAction) -> Result<Outgoing> {
        let msgs = &self.messages;
        self.pipeline.ledger().initialize_if_absent(owner).await?;

        let text = match action {
            ProfileAction::Show => {
                let preferences = self
                    .accounts
                    .get(owner)
                    .await?
                    .map(|a| a.preferences)
                    .unwrap_or_default();
                if preferences.trim().is_empty() {
                    msgs.get(keys::PROFILE_EMPTY)
                } else {
                    msgs.get_with(keys::PROFILE_WITH, &[("preferences", &preferences)])
                }
            }
            ProfileAction::Set(text) => {
                let max = self.config.bot.max_profile_chars;
                if text.chars().count() > max {
                    msgs.get_with(keys::PROFILE_TOO_LONG, &[("max", &max.to_string())])
                } else {
                    self.accounts.set_preferences(owner, &text).await?;
                    msgs.get(keys::PROFILE_SAVED)
                }
            }
            ProfileAction::Clear => {
                self.accounts.clear_preferences(owner).await?;
                msgs.get(keys::PROFILE_CLEARED)
            }
        };
        Ok(Outgoing::text(text))
    }

    async fn redeem(&self, owner: i64, code: &str) -> Result<Outgoing> {
        self.pipeline.ledger().initialize_if_absent(owner).await?;
        let msgs = &self.messages;
        let text = match self.promos.redeem(owner, code).await? {
            PromoOutcome::Redeemed { reward, balance } => msgs.get_with(
                keys::PROMO_REDEEMED,
                &[("reward", &reward.to_string()), ("balance", &balance.to_string())],
            ),
            PromoOutcome::UnknownCode => msgs.get(keys::PROMO_UNKNOWN),
            PromoOutcome::Inactive => msgs.get(keys::PROMO_INACTIVE),
            PromoOutcome::Exhausted => msgs.get(keys::PROMO_EXHAUSTED),
            PromoOutcome::Expired => msgs.get(keys::PROMO_EXPIRED),
            PromoOutcome::AlreadyUsed => msgs.get(keys::PROMO_ALREADY_USED),
        };
        Ok(Outgoing::text(text))
    }

    async fn health_text(&self) -> String {
        let status = match &self.health {
            Some(client) => match client.health_check().await {
                Ok(latency) => format!("ok ({} ms)", latency.as_millis()),
                Err(e) => format!("unavailable ({e})"),
            },
            None => "not configured".to_string(),
        };
        self.messages.get_with(keys::HEALTH, &[("status", &status)])
    }
}
