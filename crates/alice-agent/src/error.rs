//! Agent error types.
//!
//! Generation, assembly, and configuration failures all surface through
//! [`AgentError`]. [`AgentError::is_transient`] decides what the retry loop
//! may try again.

/// Unified error type for the generation side.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Upstream generation service -----------------------------------------
    /// The service answered 429.
    #[error("generation service rate limited the request: {reason}")]
    RateLimited { reason: String },

    /// The service is down, overloaded, loading the model, or timed out.
    #[error("generation service unavailable: {reason}")]
    Unavailable { reason: String },

    /// The service rejected the request itself (bad auth, bad payload, 404).
    #[error("generation request rejected ({status}): {reason}")]
    InvalidRequest { status: u16, reason: String },

    /// The response body did not have the expected shape.
    #[error("generation response parse error: {reason}")]
    ParseFailed { reason: String },

    /// Retries ran out; `last` is the final attempt's error.
    #[error("generation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<AgentError>,
    },

    // -- Context assembly ----------------------------------------------------
    /// Persona and preferences alone do not fit the token budget.
    #[error("persona overhead of {overhead} tokens exceeds the context budget of {budget}")]
    ContextOverflow { overhead: usize, budget: usize },

    /// The newest message does not fit next to the persona overhead.
    #[error("message of {tokens} tokens exceeds the {available} tokens left after the persona")]
    MessageTooLarge { tokens: usize, available: usize },

    // -- Configuration -------------------------------------------------------
    /// An API key is required but was empty.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A tokenizer file could not be loaded or applied.
    #[error("tokenizer error: {reason}")]
    Tokenizer { reason: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable { .. })
    }

    /// The error behind a retry wrapper, or `self`.
    pub fn root(&self) -> &AgentError {
        match self {
            Self::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::ConfigError {
                reason: err.to_string(),
            };
        }
        // Timeouts, refused connections, and broken bodies are all worth
        // another attempt.
        Self::Unavailable {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AgentError::RateLimited { reason: "x".into() }.is_transient());
        assert!(AgentError::Unavailable { reason: "x".into() }.is_transient());
        assert!(!AgentError::InvalidRequest { status: 400, reason: "x".into() }.is_transient());
        assert!(!AgentError::ParseFailed { reason: "x".into() }.is_transient());
    }

    #[test]
    fn root_unwraps_retry_wrapper() {
        let err = AgentError::RetriesExhausted {
            attempts: 3,
            last: Box::new(AgentError::RateLimited { reason: "slow down".into() }),
        };
        assert!(matches!(err.root(), AgentError::RateLimited { .. }));
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
