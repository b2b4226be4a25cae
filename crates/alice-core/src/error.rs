//! Request-boundary error taxonomy.
//!
//! Every failure of one chat turn surfaces as a [`ChatError`]. All variants
//! are recoverable: the bot maps each one to its own user-facing message via
//! [`ChatError::code`] and keeps serving other chats.

use std::time::Duration;

use alice_agent::AgentError;
use alice_store::StoreError;

/// Why a chat turn produced no reply.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    // -- Expected outcomes ---------------------------------------------------
    /// The owner has no credits left.
    #[error("owner {owner} has no credits left")]
    InsufficientCredit { owner: i64 },

    /// Messages arrive faster than the minimum interval allows.
    #[error("rate limited, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("message is empty")]
    EmptyMessage,

    #[error("message of {chars} characters exceeds the limit of {max}")]
    MessageTooLong { chars: usize, max: usize },

    /// The message alone does not fit next to the persona.
    #[error("message of {tokens} tokens does not fit the {available} tokens available")]
    MessageTooLarge { tokens: usize, available: usize },

    // -- Operator errors -----------------------------------------------------
    /// Persona and preferences exceed the token budget.
    #[error("persona overhead of {overhead} tokens exceeds the budget of {budget}")]
    ContextOverflow { overhead: usize, budget: usize },

    /// The generation service refused the request itself (auth, payload).
    #[error("generation request rejected: {reason}")]
    GenerationRejected { reason: String },

    // -- Upstream faults -----------------------------------------------------
    /// The generation service failed after retries.
    #[error("generation unavailable: {reason}")]
    GenerationUnavailable { reason: String },

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[source] StoreError),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable key for the user-facing message of this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientCredit { .. } => "insufficient_credit",
            Self::RateLimited { .. } => "rate_limited",
            Self::EmptyMessage => "empty_message",
            Self::MessageTooLong { .. } => "message_too_long",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::ContextOverflow { .. } => "context_overflow",
            Self::GenerationRejected { .. } => "generation_rejected",
            Self::GenerationUnavailable { .. } => "generation_unavailable",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this is a fault worth logging as one, as opposed to an
    /// ordinary outcome such as an empty balance.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            Self::InsufficientCredit { .. }
                | Self::RateLimited { .. }
                | Self::EmptyMessage
                | Self::MessageTooLong { .. }
                | Self::MessageTooLarge { .. }
        )
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredit { owner } => Self::InsufficientCredit { owner },
            other => Self::PersistenceFailure(other),
        }
    }
}

impl From<AgentError> for ChatError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::ContextOverflow { overhead, budget } => {
                Self::ContextOverflow { overhead, budget }
            }
            AgentError::MessageTooLarge { tokens, available } => {
                Self::MessageTooLarge { tokens, available }
            }
            AgentError::InvalidRequest { .. }
            | AgentError::MissingApiKey { .. }
            | AgentError::ConfigError { .. } => Self::GenerationRejected {
                reason: err.to_string(),
            },
            AgentError::RateLimited { .. }
            | AgentError::Unavailable { .. }
            | AgentError::ParseFailed { .. }
            | AgentError::RetriesExhausted { .. } => Self::GenerationUnavailable {
                reason: err.to_string(),
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Errors from the cron scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("scheduler is already running")]
    AlreadyRunning,
}
