//! Generation service integration.
//!
//! - [`types`] -- prompt messages, sampling parameters, requests.
//! - [`client`] -- HTTP client for OpenAI-compatible and Hugging Face endpoints.
//! - [`clean`] -- post-processing of raw model output.

pub mod clean;
pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use clean::ResponseCleaner;
pub use client::{ApiFormat, GenerationClient, GenerationClientConfig};
pub use types::{GenerationRequest, Message, Role, SamplingParams};

/// Something that turns a bounded prompt into reply text.
///
/// Implementations own their retry behaviour; a returned error means the
/// caller should give up on this turn.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}
