//! Token counting for budget arithmetic.
//!
//! [`CharRatioCounter`] is always available and deterministic. With the
//! `hf-tokenizer` feature a `tokenizer.json` can be loaded instead; when it
//! is missing or broken, [`load_counter`] falls back to the ratio so budget
//! checks never fail for want of a tokenizer.

use std::path::Path;
use std::sync::Arc;

use crate::llm::Message;

/// Tokens charged per message for the role header and end marker
/// (`<|im_start|>role\n` … `<|im_end|>\n`).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Measures text in model tokens.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    /// Size of a whole prompt turn, including framing.
    fn count_message(&self, message: &Message) -> usize {
        self.count(&message.content) + MESSAGE_OVERHEAD_TOKENS
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Character ratio fallback
// ---------------------------------------------------------------------------

/// Approximates tokens as `ceil(chars / chars_per_token)`.
///
/// Counts Unicode scalar values, not bytes, so Cyrillic text is not
/// over-charged twofold.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioCounter {
    chars_per_token: usize,
}

impl CharRatioCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioCounter {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenCounter for CharRatioCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }

    fn name(&self) -> &'static str {
        "char-ratio"
    }
}

// ---------------------------------------------------------------------------
// Hugging Face tokenizer
// ---------------------------------------------------------------------------

#[cfg(feature = "hf-tokenizer")]
pub use hf::HfTokenCounter;

#[cfg(feature = "hf-tokenizer")]
mod hf {
    use std::path::Path;

    use super::{CharRatioCounter, TokenCounter};
    use crate::error::{AgentError, Result};

    /// Exact counts from a `tokenizer.json`.
    pub struct HfTokenCounter {
        inner: tokenizers::Tokenizer,
        fallback: CharRatioCounter,
    }

    impl HfTokenCounter {
        pub fn from_file(path: &Path) -> Result<Self> {
            let inner =
                tokenizers::Tokenizer::from_file(path).map_err(|e| AgentError::Tokenizer {
                    reason: format!("failed to load {}: {e}", path.display()),
                })?;
            Ok(Self {
                inner,
                fallback: CharRatioCounter::default(),
            })
        }
    }

    impl TokenCounter for HfTokenCounter {
        fn count(&self, text: &str) -> usize {
            match self.inner.encode(text, false) {
                Ok(encoding) => encoding.len(),
                Err(e) => {
                    tracing::warn!(error = %e, "tokenizer failed, using character ratio");
                    self.fallback.count(text)
                }
            }
        }

        fn name(&self) -> &'static str {
            "hf-tokenizer"
        }
    }
}

/// Build the counter for `tokenizer_path`, falling back to the ratio.
pub fn load_counter(tokenizer_path: Option<&Path>, chars_per_token: usize) -> Arc<dyn TokenCounter> {
    let fallback = || -> Arc<dyn TokenCounter> { Arc::new(CharRatioCounter::new(chars_per_token)) };

    let Some(path) = tokenizer_path else {
        return fallback();
    };

    #[cfg(feature = "hf-tokenizer")]
    {
        match HfTokenCounter::from_file(path) {
            Ok(counter) => {
                tracing::info!(path = %path.display(), "tokenizer loaded");
                return Arc::new(counter);
            }
            Err(e) => tracing::warn!(error = %e, "tokenizer unavailable, using character ratio"),
        }
    }

    #[cfg(not(feature = "hf-tokenizer"))]
    tracing::warn!(
        path = %path.display(),
        "built without the hf-tokenizer feature, using character ratio"
    );

    fallback()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_rounds_up() {
        let counter = CharRatioCounter::default();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
    }

    #[test]
    fn ratio_counts_chars_not_bytes() {
        let counter = CharRatioCounter::default();
        // 8 Cyrillic letters = 16 bytes.
        assert_eq!(counter.count("приветик"), 2);
    }

    #[test]
    fn message_includes_framing() {
        let counter = CharRatioCounter::default();
        assert_eq!(
            counter.count_message(&Message::user("abcd")),
            1 + MESSAGE_OVERHEAD_TOKENS
        );
    }

    #[test]
    fn missing_tokenizer_falls_back() {
        let counter = load_counter(Some(Path::new("/nonexistent/tokenizer.json")), 4);
        assert_eq!(counter.name(), "char-ratio");
        assert_eq!(counter.count("abcdefgh"), 2);

        let counter = load_counter(None, 2);
        assert_eq!(counter.count("abcdefgh"), 4);
    }
}
