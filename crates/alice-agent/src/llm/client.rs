//! HTTP client for the text-generation service.
//!
//! Two wire formats are supported: the **OpenAI Chat Completions API**
//! (llama.cpp, vLLM, TGI and other compatible servers) and the **Hugging Face
//! inference API**, which takes a single ChatML-rendered prompt. Each call is
//! wrapped in [`with_retry`] so transient failures are retried with backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::llm::Generator;
use crate::llm::types::{GenerationRequest, Message, SamplingParams};
use crate::retry::{RetryPolicy, with_retry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default base URL for a local OpenAI-compatible server.
const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Model name sent when the server ignores it (llama.cpp, TGI).
const DEFAULT_MODEL: &str = "tgi";

/// Longest error body excerpt kept in error messages.
const ERROR_BODY_EXCERPT: usize = 300;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Which request/response shape the service speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiFormat {
    /// `POST {base}/v1/chat/completions` with a `messages` array.
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// `POST {base}` with a ChatML `inputs` string.
    #[serde(rename = "hf_inference")]
    HfInference,
}

impl ApiFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::HfInference => "hf_inference",
        }
    }
}

// ---------------------------------------------------------------------------
// Client configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GenerationClientConfig {
    pub api_format: ApiFormat,
    /// Bearer token for the service.
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub retry: RetryPolicy,
}

impl GenerationClientConfig {
    /// An OpenAI-compatible endpoint.
    pub fn openai_compatible(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_format: ApiFormat::OpenAi,
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: DEFAULT_MODEL.to_owned(),
            retry: RetryPolicy::default(),
        }
    }

    /// A Hugging Face inference endpoint URL.
    pub fn hf_inference(api_key: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            api_format: ApiFormat::HfInference,
            ..Self::openai_compatible(api_key, endpoint_url)
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for GenerationClientConfig {
    fn default() -> Self {
        Self::openai_compatible(String::new(), DEFAULT_BASE_URL)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Stateless client for the generation service; cheap to clone.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    config: Arc<GenerationClientConfig>,
    http: reqwest::Client,
}

impl GenerationClient {
    pub fn new(config: GenerationClientConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(AgentError::MissingApiKey {
                provider: config.api_format.as_str().into(),
            });
        }
        if config.base_url.trim().is_empty() {
            return Err(AgentError::ConfigError {
                reason: "generation base_url is empty".into(),
            });
        }

        // The per-attempt timeout in the retry loop is authoritative; this one
        // only stops a wedged connection from outliving it.
        let http = reqwest::Client::builder()
            .timeout(config.retry.attempt_timeout + Duration::from_secs(1))
            .build()
            .map_err(|e| AgentError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        tracing::info!(
            format = config.api_format.as_str(),
            base_url = %config.base_url,
            model = %config.model,
            "generation client ready"
        );

        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn config(&self) -> &GenerationClientConfig {
        &self.config
    }

    /// URL the request is posted to.
    pub fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.api_format {
            ApiFormat::OpenAi if base.ends_with("/v1") => format!("{base}/chat/completions"),
            ApiFormat::OpenAi => format!("{base}/v1/chat/completions"),
            ApiFormat::HfInference => base.to_owned(),
        }
    }

    /// One attempt, no retries.
    pub async fn generate_once(&self, request: &GenerationRequest) -> Result<String> {
        let body = match self.config.api_format {
            ApiFormat::OpenAi => build_openai_request_body(&self.config.model, request),
            ApiFormat::HfInference => build_hf_request_body(request),
        };

        let url = self.endpoint();
        tracing::debug!(
            url = %url,
            messages = request.messages.len(),
            max_new_tokens = request.sampling.max_new_tokens,
            "sending generation request"
        );

        let resp = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| AgentError::Unavailable {
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::ParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;

        match self.config.api_format {
            ApiFormat::OpenAi => parse_openai_response(&v),
            ApiFormat::HfInference => parse_hf_response(&v),
        }
    }

    /// Round-trip a one-token prompt and report the latency.
    pub async fn health_check(&self) -> Result<Duration> {
        let sampling = SamplingParams {
            max_new_tokens: 1,
            do_sample: false,
            ..SamplingParams::default()
        };
        let request = GenerationRequest::new(vec![Message::user("ping")], sampling);

        let started = Instant::now();
        self.generate_once(&request).await?;
        let elapsed = started.elapsed();
        tracing::info!(latency_ms = elapsed.as_millis() as u64, "generation service healthy");
        Ok(elapsed)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value).map_err(|e| AgentError::ConfigError {
                reason: format!("invalid authorization header: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl Generator for GenerationClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        with_retry(&self.config.retry, || self.generate_once(request)).await
    }
}

// ---------------------------------------------------------------------------
// Status mapping
// ---------------------------------------------------------------------------

/// Map a non-success status to the error the retry loop understands.
pub fn classify_status(status: StatusCode, body: &str) -> AgentError {
    let reason = format!("service returned {status}: {}", excerpt(body));
    match status {
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited { reason },
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            AgentError::Unavailable { reason }
        }
        s if s.is_server_error() => AgentError::Unavailable { reason },
        s => AgentError::InvalidRequest {
            status: s.as_u16(),
            reason,
        },
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= ERROR_BODY_EXCERPT {
        return body.to_owned();
    }
    let mut cut: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
    cut.push('…');
    cut
}

// ---------------------------------------------------------------------------
// OpenAI format
// ---------------------------------------------------------------------------

/// Build the JSON body for the Chat Completions API.
pub fn build_openai_request_body(model: &str, request: &GenerationRequest) -> Value {
    let s = &request.sampling;
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    json!({
        "model": model,
        "messages": messages,
        "max_tokens": s.max_new_tokens,
        "temperature": s.temperature,
        "top_p": s.top_p,
        "top_k": s.top_k,
        "min_p": s.min_p,
        "repetition_penalty": s.repetition_penalty,
        "frequency_penalty": s.frequency_penalty,
        "presence_penalty": s.presence_penalty,
        "no_repeat_ngram_size": s.no_repeat_ngram_size,
        "do_sample": s.do_sample,
        "stream": false,
    })
}

/// Extract `choices[0].message.content`.
pub fn parse_openai_response(v: &Value) -> Result<String> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(AgentError::ParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }
    // Some servers send `null` content for an empty completion.
    Ok(message["content"].as_str().unwrap_or_default().to_owned())
}

// ---------------------------------------------------------------------------
// Hugging Face inference format
// ---------------------------------------------------------------------------

/// Render messages as one ChatML prompt ending in an open assistant turn.
pub fn render_chatml(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for m in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(m.role.as_str());
        prompt.push('\n');
        prompt.push_str(&m.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

pub fn build_hf_request_body(request: &GenerationRequest) -> Value {
    let s = &request.sampling;
    json!({
        "inputs": render_chatml(&request.messages),
        "parameters": {
            "max_new_tokens": s.max_new_tokens,
            "temperature": s.temperature,
            "top_p": s.top_p,
            "top_k": s.top_k,
            "min_p": s.min_p,
            "repetition_penalty": s.repetition_penalty,
            "frequency_penalty": s.frequency_penalty,
            "presence_penalty": s.presence_penalty,
            "no_repeat_ngram_size": s.no_repeat_ngram_size,
            "do_sample": s.do_sample,
            "return_full_text": false,
        },
        "options": { "wait_for_model": true, "use_cache": false },
    })
}

/// Accepts `[{"generated_text": ..}]` or a bare `{"generated_text": ..}`.
pub fn parse_hf_response(v: &Value) -> Result<String> {
    let text = match v {
        Value::Array(items) => items.first().and_then(|item| item["generated_text"].as_str()),
        Value::Object(_) => v["generated_text"].as_str(),
        _ => None,
    };
    text.map(str::to_owned).ok_or_else(|| AgentError::ParseFailed {
        reason: "missing `generated_text` in response".into(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
