//! Typed application configuration.
//!
//! Read from `config/default.toml` (every field optional), then overridden
//! from the environment. `.env` is loaded by `main` before this runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use alice_agent::{
    ApiFormat, ContextBudget, GenerationClientConfig, Persona, ResponseCleaner, RetryPolicy,
    SamplingParams, TokenCounter, load_counter,
};
use alice_core::{PipelineConfig, parse_schedule};
use anyhow::{Context, Result, bail};
use chrono::FixedOffset;
use serde::Deserialize;

use crate::helpers::env_non_empty;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub alice: AliceSection,
    pub ledger: LedgerSection,
    pub context: ContextSection,
    pub generation: GenerationSection,
    pub sampling: SamplingParams,
    pub rate_limit: RateLimitSection,
    pub bot: BotSection,
    pub payments: PaymentsSection,
    pub persona: PersonaSection,
    /// Raw `[messages]` table; see [`crate::messages::Messages`].
    pub messages: toml::Table,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AliceSection {
    pub log_level: String,
    pub log_format: LogFormat,
    pub database: PathBuf,
    /// Enables `/health` and verbose error replies.
    pub debug: bool,
}

impl Default for AliceSection {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::Compact,
            database: PathBuf::from("data/alice.db"),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// Credits granted on first contact.
    pub baseline_credits: i64,
    /// Balances below this are topped up to it once a day.
    pub replenish_floor: i64,
    pub replenish_cron: String,
    /// Offset the cron expression and the day marker are evaluated in.
    pub utc_offset_hours: i32,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            baseline_credits: 10,
            replenish_floor: 10,
            replenish_cron: "0 0 * * *".into(),
            utc_offset_hours: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub max_context_tokens: usize,
    /// Defaults to `sampling.max_new_tokens + 100`.
    pub reply_reserve: Option<usize>,
    pub chars_per_token: usize,
    /// `tokenizer.json`; only used when built with `hf-tokenizer`.
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            reply_reserve: None,
            chars_per_token: 4,
            tokenizer_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub api_format: ApiFormat,
    pub base_url: String,
    pub model: String,
    /// Usually left empty and supplied through `ALICE_API_KEY`.
    pub api_key: String,
    pub retry: RetryPolicy,
}

impl Default for GenerationSection {
    fn default() -> Self {
        let client = GenerationClientConfig::default();
        Self {
            api_format: client.api_format,
            base_url: client.base_url,
            model: client.model,
            api_key: String::new(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub min_interval_secs: f64,
    /// Capacity of the in-process counter store.
    pub max_tracked_owners: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            min_interval_secs: 3.0,
            max_tracked_owners: 100_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotSection {
    pub poll_timeout_secs: u64,
    /// Require the age gate before chatting.
    pub require_age_verification: bool,
    /// Longest inbound message, in characters.
    pub max_message_chars: usize,
    /// Longest `/profile set` text, in characters.
    pub max_profile_chars: usize,
    pub typing_interval_secs: u64,
    /// From `TELEGRAM_BOT_TOKEN` only.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 30,
            require_age_verification: true,
            max_message_chars: 4000,
            max_profile_chars: 1000,
            typing_interval_secs: 4,
            token: None,
        }
    }
}

/// One purchasable bundle shown by `/topup`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreditPackage {
    pub credits: i64,
    /// Display price, e.g. `"5 EUR"`.
    pub price: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentsSection {
    /// Where users are sent to complete a purchase.
    pub contact: String,
    pub packages: Vec<CreditPackage>,
}

impl Default for PaymentsSection {
    fn default() -> Self {
        let package = |credits, price: &str| CreditPackage {
            credits,
            price: price.into(),
        };
        Self {
            contact: String::new(),
            packages: vec![
                package(100, "5 EUR"),
                package(200, "8 EUR"),
                package(300, "12 EUR"),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersonaSection {
    /// System text; `{{user}}` is replaced with the display name.
    pub text: String,
    pub default_user_name: String,
    /// Sent when the model returns nothing usable.
    pub fallback_reply: String,
    pub max_reply_chars: usize,
}

impl Default for PersonaSection {
    fn default() -> Self {
        Self {
            text: "You are Alice, a warm and witty companion chatting with {{user}} on Telegram. \
                   Keep replies short and conversational, stay in character, and never claim \
                   to be an AI model."
                .into(),
            default_user_name: "friend".into(),
            fallback_reply: "Hey there! 😊 What's on your mind?".into(),
            max_reply_chars: 2000,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Read `path`, apply environment overrides, and validate.
    ///
    /// A missing file is not an error: defaults plus environment are enough
    /// to run.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("invalid config {}", path.display()))?
        } else {
            // Tracing is not initialized yet; the caller reports this.
            Self::default()
        };
        config.apply_env(env_non_empty);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.bot.token = Some(token);
        }
        if let Some(key) = lookup("ALICE_API_KEY").or_else(|| lookup("HF_API_TOKEN")) {
            self.generation.api_key = key;
        }
        if let Some(url) = lookup("ALICE_API_BASE_URL") {
            self.generation.base_url = url;
        }
        if let Some(model) = lookup("ALICE_MODEL") {
            self.generation.model = model;
        }
        if let Some(db) = lookup("ALICE_DATABASE") {
            self.alice.database = PathBuf::from(db);
        }
        if let Some(debug) = lookup("ALICE_DEBUG") {
            self.alice.debug = matches!(
                debug.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.baseline_credits < 0 {
            bail!("ledger.baseline_credits must not be negative");
        }
        if self.ledger.replenish_floor < 0 {
            bail!("ledger.replenish_floor must not be negative");
        }
        if !(-12..=14).contains(&self.ledger.utc_offset_hours) {
            bail!(
                "ledger.utc_offset_hours must be within -12..=14, got {}",
                self.ledger.utc_offset_hours
            );
        }
        parse_schedule(&self.ledger.replenish_cron).context("ledger.replenish_cron")?;
        if Duration::try_from_secs_f64(self.rate_limit.min_interval_secs).is_err() {
            bail!(
                "rate_limit.min_interval_secs must be a non-negative number of seconds, got {}",
                self.rate_limit.min_interval_secs
            );
        }
        if self.context.max_context_tokens <= self.reply_reserve() {
            bail!(
                "context.max_context_tokens ({}) leaves no room next to the reply reserve ({})",
                self.context.max_context_tokens,
                self.reply_reserve()
            );
        }
        if let Some(bad) = self.payments.packages.iter().find(|p| p.credits <= 0) {
            bail!("payment package '{}' must grant a positive number of credits", bad.price);
        }
        Ok(())
    }

    // -- derived values --------------------------------------------------

    pub fn reply_reserve(&self) -> usize {
        self.context
            .reply_reserve
            .unwrap_or(self.sampling.max_new_tokens as usize + 100)
    }

    pub fn context_budget(&self) -> ContextBudget {
        ContextBudget::new(self.context.max_context_tokens, self.reply_reserve())
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.ledger.utc_offset_hours * 3600)
            .with_context(|| format!("invalid UTC offset {}h", self.ledger.utc_offset_hours))
    }

    /// Zero when the configured value is out of range; `validate` rejects those.
    pub fn min_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.rate_limit.min_interval_secs).unwrap_or_default()
    }

    pub fn token_counter(&self) -> Arc<dyn TokenCounter> {
        load_counter(
            self.context.tokenizer_path.as_deref(),
            self.context.chars_per_token,
        )
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            min_interval: self.min_interval(),
            max_message_chars: self.bot.max_message_chars,
            budget: self.context_budget(),
            sampling: self.sampling.clone(),
            persona: Persona::new(&self.persona.text, &self.persona.default_user_name),
            cleaner: ResponseCleaner::new(
                self.persona.max_reply_chars,
                &self.persona.fallback_reply,
            ),
        }
    }

    pub fn generation_client_config(&self) -> GenerationClientConfig {
        let base = match self.generation.api_format {
            ApiFormat::OpenAi => GenerationClientConfig::openai_compatible(
                &self.generation.api_key,
                &self.generation.base_url,
            ),
            ApiFormat::HfInference => GenerationClientConfig::hf_inference(
                &self.generation.api_key,
                &self.generation.base_url,
            ),
        };
        base.with_model(&self.generation.model)
            .with_retry(self.generation.retry.clone())
    }
}
