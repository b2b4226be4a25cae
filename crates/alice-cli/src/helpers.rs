//! Shared helper functions used across CLI subcommands.
//!
//! Tracing setup, the panic hook, environment lookups, opening the database,
//! and the text shaping applied to replies before they go to Telegram.

use std::path::Path;
use std::sync::OnceLock;

use alice_store::Database;
use anyhow::{Context, Result};
use regex::Regex;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Telegram's hard limit for one message.
pub const TELEGRAM_MAX_CHARS: usize = 4096;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Route panics through tracing instead of bare stderr.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        tracing::error!(location = %location, payload = %payload, "panic in task");
    }));
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Read a non-empty environment variable, returning `None` if unset or empty.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Open the database at `path`, creating its directory and applying any
/// pending migrations.
pub async fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Database::open_and_migrate(path.to_path_buf())
        .await
        .with_context(|| format!("failed to open database {}", path.display()))
}

// ---------------------------------------------------------------------------
// Reply shaping
// ---------------------------------------------------------------------------

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Prefers newline, then space boundaries. Leading whitespace of each
/// following chunk is dropped.
pub fn split_telegram_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        // Byte offset just past the first `max_chars` characters.
        let Some((boundary, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_owned());
            break;
        };

        let head = &remaining[..boundary];
        let mut split_at = head
            .rfind('\n')
            .unwrap_or_else(|| head.rfind(' ').unwrap_or(boundary));
        if split_at == 0 {
            split_at = boundary;
        }

        chunks.push(remaining[..split_at].to_owned());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

/// Escape the three characters Telegram's HTML mode cares about.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn action_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\*([^*\n]+)\*").ok())
        .as_ref()
}

/// Escape `text` and render `*action*` as bold italics.
pub fn format_actions(text: &str) -> String {
    let escaped = escape_html(text);
    match action_pattern() {
        Some(pattern) => pattern
            .replace_all(&escaped, "<b><i>$1</i></b>")
            .into_owned(),
        None => escaped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_telegram_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn splits_prefer_newlines_then_spaces() {
        let chunks = split_telegram_message("first line\nsecond line", 15);
        assert_eq!(chunks, vec!["first line", "second line"]);

        let chunks = split_telegram_message("aaaa bbbb cccc", 9);
        assert_eq!(chunks, vec!["aaaa", "bbbb cccc"]);
    }

    #[test]
    fn unbroken_text_is_cut_at_the_limit() {
        let chunks = split_telegram_message(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn limit_counts_characters_not_bytes() {
        let text = "привет ".repeat(700);
        let chunks = split_telegram_message(&text, TELEGRAM_MAX_CHARS);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= TELEGRAM_MAX_CHARS));
    }

    #[test]
    fn actions_become_bold_italics() {
        assert_eq!(
            format_actions("*smiles* hi there *waves*"),
            "<b><i>smiles</i></b> hi there <b><i>waves</i></b>"
        );
    }

    #[test]
    fn html_is_escaped_before_formatting() {
        assert_eq!(
            format_actions("<script> & *grins*"),
            "&lt;script&gt; &amp; <b><i>grins</i></b>"
        );
    }

    #[test]
    fn lone_asterisks_are_left_alone() {
        assert_eq!(format_actions("2 * 3 = 6"), "2 * 3 = 6");
        assert_eq!(format_actions("**"), "**");
    }
}
