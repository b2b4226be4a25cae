//! Minimal Telegram Bot API client over `reqwest`.
//!
//! Only the handful of methods the bot needs. Updates stay as raw JSON until
//! [`parse_update`] picks out the parts we act on.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tracing::warn;

use crate::helpers::{TELEGRAM_MAX_CHARS, format_actions, split_telegram_message};

/// Callback data of the age gate buttons.
pub const CALLBACK_AGE_YES: &str = "age_verify_yes";
pub const CALLBACK_AGE_NO: &str = "age_verify_no";

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// The parts of an update the bot acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Message {
        chat_id: i64,
        text: String,
        first_name: Option<String>,
    },
    Callback {
        callback_id: String,
        chat_id: i64,
        data: String,
    },
}

impl Incoming {
    pub fn chat_id(&self) -> i64 {
        match self {
            Self::Message { chat_id, .. } | Self::Callback { chat_id, .. } => *chat_id,
        }
    }
}

/// Extract a text message or a button press. Everything else (stickers,
/// edits, joins) yields `None`.
pub fn parse_update(update: &Value) -> Option<Incoming> {
    if let Some(cb) = update.get("callback_query") {
        return Some(Incoming::Callback {
            callback_id: cb.get("id")?.as_str()?.to_string(),
            chat_id: cb.pointer("/message/chat/id")?.as_i64()?,
            data: cb.get("data")?.as_str()?.to_string(),
        });
    }

    let message = update.get("message")?;
    Some(Incoming::Message {
        chat_id: message.pointer("/chat/id")?.as_i64()?,
        text: message.get("text")?.as_str()?.to_string(),
        first_name: message
            .pointer("/from/first_name")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// An inline keyboard with one button per row.
pub fn inline_keyboard(buttons: &[(String, &str)]) -> Value {
    let rows: Vec<Value> = buttons
        .iter()
        .map(|(label, data)| json!([{ "text": label, "callback_data": data }]))
        .collect();
    json!({ "inline_keyboard": rows })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Self {
        Self::with_base_url(format!("https://api.telegram.org/bot{token}"))
    }

    /// Point at another server, e.g. a local Bot API instance or a mock.
    pub fn with_base_url(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    /// POST one method and return its `result`.
    async fn call(&self, method: &str, body: &Value, timeout: Duration) -> Result<Value> {
        let resp: Value = self
            .http
            .post(format!("{}/{method}", self.base))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("{method} returned invalid JSON"))?;

        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = resp
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("no description");
            bail!("{method} failed: {description}");
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    /// The bot's username; also proves the token works.
    pub async fn get_me(&self) -> Result<String> {
        let me = self.call("getMe", &json!({}), Duration::from_secs(10)).await?;
        Ok(me
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Value>> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        // The HTTP timeout must outlive the long poll.
        let result = self
            .call("getUpdates", &body, Duration::from_secs(timeout_secs + 10))
            .await?;
        Ok(match result {
            Value::Array(updates) => updates,
            _ => Vec::new(),
        })
    }

    /// Send `text` as HTML, split to fit. The keyboard rides on the last chunk.
    ///
    /// A chunk Telegram refuses to parse is resent as plain text.
    pub async fn send_message(&self, chat_id: i64, text: &str, keyboard: Option<&Value>) -> Result<()> {
        let chunks = split_telegram_message(text, TELEGRAM_MAX_CHARS);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.iter().enumerate() {
            let mut body = json!({
                "chat_id": chat_id,
                "text": format_actions(chunk),
                "parse_mode": "HTML",
            });
            if i == last
                && let Some(markup) = keyboard
            {
                body["reply_markup"] = markup.clone();
            }

            if let Err(e) = self.call("sendMessage", &body, Duration::from_secs(30)).await {
                warn!(chat_id, error = %e, "HTML send failed, retrying as plain text");
                body["text"] = Value::String(chunk.clone());
                if let Some(map) = body.as_object_mut() {
                    map.remove("parse_mode");
                }
                self.call("sendMessage", &body, Duration::from_secs(30)).await?;
            }
        }
        Ok(())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        self.call(
            "sendChatAction",
            &json!({ "chat_id": chat_id, "action": action }),
            Duration::from_secs(10),
        )
        .await?;
        Ok(())
    }

    pub async fn answer_callback_query(&self, callback_id: &str) -> Result<()> {
        self.call(
            "answerCallbackQuery",
            &json!({ "callback_query_id": callback_id }),
            Duration::from_secs(10),
        )
        .await?;
        Ok(())
    }
}
