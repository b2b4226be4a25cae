//! Post-processing of raw model output before it is shown or stored.

/// ChatML markers that must never reach the user.
const CHAT_MARKERS: [&str; 2] = ["<|im_start|>", "<|im_end|>"];

/// A leaked next user turn; everything from here on is discarded.
const LEAKED_USER_TURN: &str = "<|im_start|>user";

/// Speaker labels some models prepend to their reply.
const SPEAKER_PREFIXES: [&str; 6] = ["Human:", "Assistant:", "Alice:", "Bot:", "AI:", "User:"];

/// Normalizes model output into a sendable reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCleaner {
    max_chars: usize,
    fallback: String,
}

impl Default for ResponseCleaner {
    fn default() -> Self {
        Self::new(2000, "Hey there! 😊 What's on your mind?")
    }
}

impl ResponseCleaner {
    pub fn new(max_chars: usize, fallback: impl Into<String>) -> Self {
        Self {
            max_chars: max_chars.max(4),
            fallback: fallback.into(),
        }
    }

    /// Strip markers and speaker labels, truncate, and substitute the
    /// fallback for empty output. Never returns an empty string.
    pub fn clean(&self, raw: &str) -> String {
        let mut text = match raw.find(LEAKED_USER_TURN) {
            Some(idx) => &raw[..idx],
            None => raw,
        }
        .to_string();

        for marker in CHAT_MARKERS {
            text = text.replace(marker, "");
        }

        let mut rest = text.trim();
        if let Some(stripped) = rest.strip_prefix("assistant\n") {
            rest = stripped.trim_start();
        }
        loop {
            let before = rest;
            for prefix in SPEAKER_PREFIXES {
                if let Some(stripped) = rest.strip_prefix(prefix) {
                    rest = stripped.trim_start();
                }
            }
            if before.len() == rest.len() {
                break;
            }
        }

        let rest = rest.trim();
        if rest.is_empty() {
            return self.fallback.clone();
        }

        if rest.chars().count() > self.max_chars {
            let mut out: String = rest.chars().take(self.max_chars - 3).collect();
            out.push_str("...");
            return out;
        }
        rest.to_string()
    }
}
