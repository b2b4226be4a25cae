//! User-facing message templates.
//!
//! Built-in English defaults, overridden key by key from the `[messages]`
//! table of the config file. Nested tables flatten into dot-separated keys
//! (`[messages.commands] help = "..."` becomes `commands.help`).

use std::collections::HashMap;

use alice_core::ChatError;
use tracing::debug;

// ---------------------------------------------------------------------------
// Message keys (compile-time constants to avoid typos)
// ---------------------------------------------------------------------------

pub mod keys {
    // Onboarding
    pub const WELCOME: &str = "start.welcome";
    pub const AGE_GATE: &str = "start.age_gate";
    pub const AGE_CONFIRMED: &str = "start.age_confirmed";
    pub const AGE_DECLINED: &str = "start.age_declined";
    pub const AGE_REQUIRED: &str = "start.age_required";
    pub const BUTTON_AGE_YES: &str = "buttons.age_yes";
    pub const BUTTON_AGE_NO: &str = "buttons.age_no";

    // Commands
    pub const HELP: &str = "commands.help";
    pub const ABOUT: &str = "commands.about";
    pub const LOANS: &str = "commands.loans";
    pub const TOPUP_HEADER: &str = "commands.topup_header";
    pub const TOPUP_ITEM: &str = "commands.topup_item";
    pub const TOPUP_FOOTER: &str = "commands.topup_footer";
    pub const RESET_DONE: &str = "commands.reset_done";
    pub const PROFILE_WITH: &str = "commands.profile_with";
    pub const PROFILE_EMPTY: &str = "commands.profile_empty";
    pub const PROFILE_SAVED: &str = "commands.profile_saved";
    pub const PROFILE_CLEARED: &str = "commands.profile_cleared";
    pub const PROFILE_TOO_LONG: &str = "commands.profile_too_long";
    pub const PROMO_USAGE: &str = "commands.promo_usage";
    pub const HEALTH: &str = "commands.health";
    pub const UNKNOWN_COMMAND: &str = "commands.unknown";

    // Promo outcomes
    pub const PROMO_REDEEMED: &str = "promo.redeemed";
    pub const PROMO_UNKNOWN: &str = "promo.unknown";
    pub const PROMO_INACTIVE: &str = "promo.inactive";
    pub const PROMO_EXHAUSTED: &str = "promo.exhausted";
    pub const PROMO_EXPIRED: &str = "promo.expired";
    pub const PROMO_ALREADY_USED: &str = "promo.already_used";

    // Errors; the suffix is `ChatError::code()`.
    pub const ERROR_PREFIX: &str = "errors";
    pub const ERROR_GENERAL: &str = "errors.general";
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Messages {
    templates: HashMap<String, String>,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            templates: builtin_defaults(),
        }
    }
}

impl Messages {
    /// Built-in defaults overlaid with the strings found in `table`.
    pub fn from_table(table: &toml::Table) -> Self {
        let mut templates = builtin_defaults();
        let mut overrides = HashMap::new();
        flatten_toml(table, "", &mut overrides);
        debug!(count = overrides.len(), "message templates loaded from config");
        templates.extend(overrides);
        Self { templates }
    }

    /// Template for `key`; the key itself when unknown.
    pub fn get(&self, key: &str) -> String {
        self.templates
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// Template with `{name}` placeholders replaced.
    pub fn get_with(&self, key: &str, vars: &[(&str, &str)]) -> String {
        let mut msg = self.get(key);
        for (name, value) in vars {
            msg = msg.replace(&format!("{{{name}}}"), value);
        }
        msg
    }

    /// User-legible text for a pipeline error. Every kind has its own key.
    pub fn for_error(&self, err: &ChatError) -> String {
        let key = format!("{}.{}", keys::ERROR_PREFIX, err.code());
        match err {
            ChatError::RateLimited { retry_after } => {
                let seconds = retry_after.as_secs_f64().ceil().max(1.0).to_string();
                self.get_with(&key, &[("seconds", &seconds)])
            }
            ChatError::MessageTooLong { max, .. } => {
                self.get_with(&key, &[("max", &max.to_string())])
            }
            _ => self.get(&key),
        }
    }
}

/// Flatten nested tables into dot-separated keys. Non-string leaves are
/// ignored.
fn flatten_toml(table: &toml::Table, prefix: &str, out: &mut HashMap<String, String>) {
    for (key, value) in table {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match value {
            toml::Value::String(s) => {
                out.insert(full_key, s.clone());
            }
            toml::Value::Table(t) => flatten_toml(t, &full_key, out),
            _ => {}
        }
    }
}

fn builtin_defaults() -> HashMap<String, String> {
    let pairs: &[(&str, &str)] = &[
        (
            keys::WELCOME,
            "Hi {name}! I'm Alice 😊 Just write to me and we'll talk. \
             Type /help to see what else I can do.",
        ),
        (
            keys::AGE_GATE,
            "Before we start: this chat is meant for adults only. \
             Please confirm that you are 18 or older.",
        ),
        (keys::AGE_CONFIRMED, "Thanks for confirming! Say hi whenever you're ready."),
        (keys::AGE_DECLINED, "Sorry, this chat is only available to adults."),
        (keys::AGE_REQUIRED, "Please send /start and confirm your age first."),
        (keys::BUTTON_AGE_YES, "I'm 18 or older"),
        (keys::BUTTON_AGE_NO, "I'm under 18"),
        (
            keys::HELP,
            "Commands:\n\
             /loans - your remaining credits\n\
             /topup - buy more credits\n\
             /profile - what I know about you\n\
             /profile set <text> - tell me about yourself\n\
             /profile clear - forget your profile\n\
             /promo <code> - redeem a promo code\n\
             /reset - start a fresh conversation\n\
             /about - about this bot",
        ),
        (
            keys::ABOUT,
            "Alice is a companion chat bot. Every reply costs one credit; \
             balances below the daily floor are topped up every night.",
        ),
        (keys::LOANS, "You have {balance} credits left."),
        (keys::TOPUP_HEADER, "Credit packages:"),
        (keys::TOPUP_ITEM, "• {credits} credits for {price}"),
        (keys::TOPUP_FOOTER, "To buy a package, contact {contact}."),
        (
            keys::RESET_DONE,
            "Done, we're starting fresh. Your earlier messages are no longer part of our chat.",
        ),
        (keys::PROFILE_WITH, "Here's what you told me about yourself:\n\n{preferences}"),
        (
            keys::PROFILE_EMPTY,
            "Your profile is empty. Use /profile set <text> to tell me about yourself.",
        ),
        (keys::PROFILE_SAVED, "Got it, I'll keep that in mind."),
        (keys::PROFILE_CLEARED, "Your profile has been cleared."),
        (keys::PROFILE_TOO_LONG, "That's a bit long. Please keep it under {max} characters."),
        (keys::PROMO_USAGE, "Usage: /promo <code>"),
        (keys::HEALTH, "Generation service: {status}"),
        (keys::UNKNOWN_COMMAND, "I don't know that command. Try /help."),
        (
            keys::PROMO_REDEEMED,
            "Promo code applied: +{reward} credits. You now have {balance}.",
        ),
        (keys::PROMO_UNKNOWN, "That promo code doesn't exist."),
        (keys::PROMO_INACTIVE, "That promo code is no longer active."),
        (keys::PROMO_EXHAUSTED, "That promo code has been used up."),
        (keys::PROMO_EXPIRED, "That promo code has expired."),
        (keys::PROMO_ALREADY_USED, "You've already used that promo code."),
        (
            "errors.insufficient_credit",
            "You're out of credits. They refill every night, or see /topup to get more now.",
        ),
        ("errors.rate_limited", "Slow down a little! Try again in {seconds}s."),
        ("errors.empty_message", "Your message is empty."),
        (
            "errors.message_too_long",
            "That message is too long. Please keep it under {max} characters.",
        ),
        (
            "errors.message_too_large",
            "That message is too large for me to read in one go. Could you shorten it?",
        ),
        (
            "errors.context_overflow",
            "Your profile is too long for me to work with. Please shorten it with /profile set.",
        ),
        (
            "errors.generation_rejected",
            "I couldn't answer that one. Try rephrasing?",
        ),
        (
            "errors.generation_unavailable",
            "I'm having trouble thinking right now. Please try again in a minute. \
             No credit was used.",
        ),
        (
            "errors.persistence_failure",
            "Something went wrong saving our chat. Please try again.",
        ),
        ("errors.internal", "Something went wrong. Please try again."),
        (keys::ERROR_GENERAL, "Something went wrong. Please try again."),
    ];

    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alice_store::StoreError;

    use super::*;

    #[test]
    fn flatten_toml_works() {
        let table: toml::Table = r#"
            [commands]
            help = "Custom help"
            [errors]
            internal = "Oops"
            count = 3
        "#
        .parse()
        .unwrap();
        let mut out = HashMap::new();
        flatten_toml(&table, "", &mut out);

        assert_eq!(out.get("commands.help").unwrap(), "Custom help");
        assert_eq!(out.get("errors.internal").unwrap(), "Oops");
        assert!(!out.contains_key("errors.count"));
    }

    #[test]
    fn config_overrides_only_named_keys() {
        let table: toml::Table = "[commands]\nhelp = \"Custom help\"".parse().unwrap();
        let msgs = Messages::from_table(&table);
        assert_eq!(msgs.get(keys::HELP), "Custom help");
        assert_eq!(msgs.get(keys::RESET_DONE), Messages::default().get(keys::RESET_DONE));
    }

    #[test]
    fn unknown_key_falls_back_to_key() {
        assert_eq!(Messages::default().get("nope.missing"), "nope.missing");
    }

    #[test]
    fn placeholders_are_substituted() {
        let msgs = Messages::default();
        assert_eq!(
            msgs.get_with(keys::LOANS, &[("balance", "7")]),
            "You have 7 credits left."
        );
    }

    #[test]
    fn every_error_kind_has_its_own_text() {
        let msgs = Messages::default();
        let errors = [
            ChatError::InsufficientCredit { owner: 1 },
            ChatError::RateLimited {
                retry_after: Duration::from_millis(1200),
            },
            ChatError::EmptyMessage,
            ChatError::MessageTooLong { chars: 5000, max: 4000 },
            ChatError::MessageTooLarge {
                tokens: 900,
                available: 100,
            },
            ChatError::ContextOverflow {
                overhead: 9000,
                budget: 7388,
            },
            ChatError::GenerationRejected {
                reason: "400".into(),
            },
            ChatError::GenerationUnavailable {
                reason: "503".into(),
            },
            ChatError::PersistenceFailure(StoreError::InvalidArgument("x".into())),
            ChatError::Internal("boom".into()),
        ];

        let texts: Vec<String> = errors.iter().map(|e| msgs.for_error(e)).collect();
        for (err, text) in errors.iter().zip(&texts) {
            assert!(!text.starts_with("errors."), "no template for {}", err.code());
        }
        let unique: std::collections::HashSet<_> = texts.iter().collect();
        assert_eq!(unique.len(), texts.len());

        assert!(texts[1].contains("2s"));
        assert!(texts[3].contains("4000"));
    }
}
