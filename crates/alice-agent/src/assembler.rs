//! Bounded prompt assembly.
//!
//! The persona system turn (with the user's preferences) is fixed overhead.
//! The remaining budget is filled from the newest message backward; the first
//! message that does not fit ends the scan, so what gets dropped is always a
//! contiguous oldest-first prefix of the window. Output is chronological.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::llm::Message;
use crate::persona::compose_system_prompt;
use crate::tokenizer::TokenCounter;

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Token limits of the generation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudget {
    /// The model's context window.
    pub max_context_tokens: usize,
    /// Kept free for the reply itself.
    pub reply_reserve: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_context_tokens: 8000,
            reply_reserve: 612,
        }
    }
}

impl ContextBudget {
    pub fn new(max_context_tokens: usize, reply_reserve: usize) -> Self {
        Self {
            max_context_tokens,
            reply_reserve,
        }
    }

    /// Tokens available to the prompt.
    pub fn budget(&self) -> usize {
        self.max_context_tokens.saturating_sub(self.reply_reserve)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledContext {
    /// System turn first, then the kept window in chronological order.
    pub messages: Vec<Message>,
    /// How many of the oldest window messages were left out.
    pub dropped: usize,
    /// Tokens used by `messages`.
    pub tokens_used: usize,
    pub budget: usize,
}

impl AssembledContext {
    /// Window messages that made it in.
    pub fn kept(&self) -> usize {
        self.messages.len().saturating_sub(1)
    }
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ContextAssembler {
    counter: Arc<dyn TokenCounter>,
    budget: ContextBudget,
}

impl ContextAssembler {
    pub fn new(counter: Arc<dyn TokenCounter>, budget: ContextBudget) -> Self {
        Self { counter, budget }
    }

    pub fn budget(&self) -> ContextBudget {
        self.budget
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    /// Build the prompt for `window` (oldest first, pending message last).
    ///
    /// Fails with [`AgentError::ContextOverflow`] when persona and preferences
    /// alone exceed the budget, and with [`AgentError::MessageTooLarge`] when
    /// the newest message cannot fit beside them.
    pub fn assemble(
        &self,
        persona: &str,
        preferences: &str,
        window: &[Message],
    ) -> Result<AssembledContext> {
        let budget = self.budget.budget();
        let system = Message::system(compose_system_prompt(persona, preferences));
        let overhead = self.counter.count_message(&system);

        if overhead > budget {
            tracing::error!(
                overhead,
                budget,
                counter = self.counter.name(),
                "persona and preferences exceed the context budget"
            );
            return Err(AgentError::ContextOverflow { overhead, budget });
        }

        let available = budget - overhead;
        let mut used = 0usize;
        let mut first_kept = window.len();

        for (idx, message) in window.iter().enumerate().rev() {
            let cost = self.counter.count_message(message);
            if used + cost > available {
                if first_kept == window.len() {
                    return Err(AgentError::MessageTooLarge {
                        tokens: cost,
                        available,
                    });
                }
                break;
            }
            used += cost;
            first_kept = idx;
        }

        let dropped = first_kept;
        let mut messages = Vec::with_capacity(window.len() - dropped + 1);
        messages.push(system);
        messages.extend_from_slice(&window[first_kept..]);

        if dropped > 0 {
            tracing::debug!(dropped, kept = window.len() - dropped, "history truncated to fit budget");
        }

        Ok(AssembledContext {
            messages,
            dropped,
            tokens_used: overhead + used,
            budget,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::tokenizer::{CharRatioCounter, MESSAGE_OVERHEAD_TOKENS};

    /// One token per char keeps the arithmetic readable.
    fn assembler(max_context: usize, reserve: usize) -> ContextAssembler {
        ContextAssembler::new(
            Arc::new(CharRatioCounter::new(1)),
            ContextBudget::new(max_context, reserve),
        )
    }

    /// Alternating turns of `len` chars each, tagged by index.
    fn window(n: usize, len: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let body = format!("{i:0>len$}");
                if i % 2 == 0 {
                    Message::user(body)
                } else {
                    Message::assistant(body)
                }
            })
            .collect()
    }

    #[test]
    fn empty_window_yields_persona_only() {
        let ctx = assembler(100, 0).assemble("persona", "", &[]).unwrap();
        assert_eq!(ctx.messages, vec![Message::system("persona")]);
        assert_eq!(ctx.dropped, 0);
        assert_eq!(ctx.tokens_used, 7 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn everything_fits_when_budget_allows() {
        let history = window(4, 6);
        let ctx = assembler(1000, 100).assemble("p", "", &history).unwrap();
        assert_eq!(ctx.dropped, 0);
        assert_eq!(&ctx.messages[1..], &history[..]);
        assert_eq!(ctx.messages[0].role, Role::System);
    }

    #[test]
    fn over_budget_keeps_newest_and_drops_contiguous_prefix() {
        // persona "p" costs 5; each message costs 10 + 4 = 14.
        // budget 50 → 45 left → three messages fit.
        let history = window(10, 10);
        let ctx = assembler(60, 10).assemble("p", "", &history).unwrap();

        assert_eq!(ctx.messages[0], Message::system("p"));
        assert_eq!(ctx.messages.last(), history.last());
        assert_eq!(ctx.dropped, 7);
        assert_eq!(&ctx.messages[1..], &history[7..]);
        assert!(ctx.tokens_used <= ctx.budget);
    }

    #[test]
    fn scan_stops_at_first_message_that_does_not_fit() {
        // A huge message in the middle blocks everything older than it,
        // even though the older ones would fit on their own.
        let history = vec![
            Message::user("aa"),
            Message::assistant("x".repeat(200)),
            Message::user("bb"),
        ];
        let ctx = assembler(100, 0).assemble("p", "", &history).unwrap();
        assert_eq!(ctx.dropped, 2);
        assert_eq!(&ctx.messages[1..], &history[2..]);
    }

    #[test]
    fn preferences_count_toward_overhead() {
        let history = window(20, 10);
        let plain = assembler(300, 0).assemble("p", "", &history).unwrap();
        let with_prefs = assembler(300, 0)
            .assemble("p", "likes long walks", &history)
            .unwrap();
        assert_eq!(plain.dropped, 0);
        assert!(with_prefs.dropped > 0);
        assert!(with_prefs.messages[0].content.contains("likes long walks"));
    }

    #[test]
    fn oversized_persona_is_context_overflow() {
        let err = assembler(20, 10).assemble(&"p".repeat(50), "", &[]).unwrap_err();
        assert!(matches!(err, AgentError::ContextOverflow { budget: 10, .. }));
    }

    #[test]
    fn oversized_newest_message_is_too_large() {
        let history = vec![Message::user("short"), Message::user("y".repeat(500))];
        let err = assembler(100, 0).assemble("p", "", &history).unwrap_err();
        assert!(matches!(err, AgentError::MessageTooLarge { tokens: 504, available: 95 }));
    }

    #[test]
    fn assembly_is_idempotent() {
        let history = window(30, 9);
        let asm = assembler(400, 5);
        let a = asm.assemble("persona {{x}}", "prefs", &history).unwrap();
        let b = asm.assemble("persona {{x}}", "prefs", &history).unwrap();
        assert!(a.dropped > 0);
        assert_eq!(a, b);
    }

    #[test]
    fn budget_saturates() {
        assert_eq!(ContextBudget::new(100, 500).budget(), 0);
        assert_eq!(ContextBudget::default().budget(), 7388);
    }
}
