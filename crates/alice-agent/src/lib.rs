//! Generation side of the Alice bot.
//!
//! Turns a user's persona, preferences, and current conversation window into
//! a bounded prompt, sends it to the text-generation service, and cleans up
//! what comes back.
//!
//! # Modules
//!
//! - [`llm`] -- wire types, the HTTP [`GenerationClient`], response cleaning.
//! - [`retry`] -- bounded retries with exponential backoff.
//! - [`tokenizer`] -- token counting with a deterministic fallback.
//! - [`persona`] -- persona rendering and the preferences section.
//! - [`assembler`] -- budget-bounded, recency-first prompt assembly.
//! - [`error`] -- the [`AgentError`] type.

pub mod assembler;
pub mod error;
pub mod llm;
pub mod persona;
pub mod retry;
pub mod tokenizer;

pub use assembler::{AssembledContext, ContextAssembler, ContextBudget};
pub use error::{AgentError, Result};
pub use llm::{
    ApiFormat, GenerationClient, GenerationClientConfig, GenerationRequest, Generator, Message,
    ResponseCleaner, Role, SamplingParams,
};
pub use persona::Persona;
pub use retry::{RetryPolicy, with_retry};
pub use tokenizer::{CharRatioCounter, TokenCounter, load_counter};
