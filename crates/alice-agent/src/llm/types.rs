//! Core types for talking to the generation service.
//!
//! Provider-agnostic; [`super::client`] translates them into the OpenAI
//! chat or Hugging Face inference wire formats.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persona and preferences.
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single turn in the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Operator-configured sampling parameters, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Upper bound on generated tokens; also sizes the reply reserve.
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub min_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub no_repeat_ngram_size: u32,
    pub do_sample: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 1.2,
            top_p: 0.75,
            top_k: 80,
            min_p: 0.02,
            repetition_penalty: 1.25,
            frequency_penalty: 0.6,
            presence_penalty: 0.4,
            no_repeat_ngram_size: 4,
            do_sample: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One bounded prompt ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Chronological, persona first.
    pub messages: Vec<Message>,
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>, sampling: SamplingParams) -> Self {
        Self { messages, sampling }
    }
}
