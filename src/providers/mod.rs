//! Provider adapters for embeddings and chat completion.
//!
//! Two capability traits ([`EmbeddingsClient`], [`ChatClient`]) hide the concrete LLM
//! provider from every consumer. Each supported family (OpenAI, Ollama) implements both
//! with direct `reqwest` calls. A factory builds the three configured roles (embeddings,
//! metadata enrichment, question answering) independently, so switching providers is a
//! configuration change only.
//!
//! Every outbound call first awaits a slot from the shared [`RateLimiter`] under a
//! `"<provider>_embeddings"` / `"<provider>_chat"` tag, then runs through a bounded
//! retry loop: up to 3 retries with exponential backoff on rate-limit responses,
//! 5xx errors, and transport timeouts. Other client errors surface immediately as typed
//! [`ProviderError`]s.

mod ollama;
mod openai;

pub use ollama::{OllamaChatClient, OllamaEmbeddingsClient};
pub use openai::{OpenAiChatClient, OpenAiEmbeddingsClient};

use crate::config::{Config, Provider};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const MAX_RETRIES: usize = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Errors surfaced by provider adapters after retry handling.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credentials were rejected by the provider.
    #[error("Provider rejected credentials: {0}")]
    Auth(String),
    /// The provider rejected the request payload.
    #[error("Provider rejected request: {0}")]
    BadRequest(String),
    /// The provider kept rate-limiting the request after all retries.
    #[error("Provider quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The provider stayed unreachable or erroring after all retries.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with something the adapter could not use.
    #[error("Provider error: {0}")]
    Other(String),
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingsClient: Send + Sync {
    /// Produce an embedding vector for each supplied text, in input order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Produce an embedding vector for a single query string.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Dimensionality of the vectors this client produces.
    fn dimension(&self) -> usize;
}

/// Interface implemented by chat completion backends.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Run one completion over a system and user prompt pair.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, ProviderError>;

    /// Model identifier reported in responses.
    fn model(&self) -> &str;
}

/// Outcome of a single outbound attempt, before retry classification.
#[derive(Debug)]
pub(crate) enum CallError {
    /// 408/429 from the provider; retried, exhausts to `QuotaExceeded`.
    RateLimited(String),
    /// 5xx from the provider; retried, exhausts to `Unavailable`.
    Upstream(String),
    /// Transport failure or timeout; retried, exhausts to `Unavailable`.
    Transport(String),
    /// Non-retryable failure surfaced as-is.
    Fatal(ProviderError),
}

impl CallError {
    /// Map a transport-level reqwest error into a retry class.
    pub(crate) fn from_transport(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }

    /// Classify an HTTP error status with its body.
    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Fatal(ProviderError::Auth(format!("{status}: {body}"))),
            408 | 429 => Self::RateLimited(format!("{status}: {body}")),
            400..=499 => Self::Fatal(ProviderError::BadRequest(format!("{status}: {body}"))),
            _ => Self::Upstream(format!("{status}: {body}")),
        }
    }
}

/// Run `call` with rate limiting and the shared retry policy.
///
/// A limiter slot is acquired before every attempt because each attempt is a real
/// outbound request.
pub(crate) async fn with_retries<T, F, Fut>(
    limiter: &RateLimiter,
    service: &str,
    backoff_base: Duration,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CallError>>,
{
    let mut last: Option<CallError> = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let backoff = backoff_base * (1 << (attempt - 1));
            tracing::debug!(
                service,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying provider call"
            );
            tokio::time::sleep(backoff).await;
        }
        limiter.acquire(service).await;
        match call().await {
            Ok(value) => return Ok(value),
            Err(CallError::Fatal(error)) => return Err(error),
            Err(retryable) => {
                tracing::warn!(service, attempt, error = ?retryable, "Provider call failed");
                last = Some(retryable);
            }
        }
    }

    Err(match last {
        Some(CallError::RateLimited(detail)) => ProviderError::QuotaExceeded(detail),
        Some(CallError::Upstream(detail)) | Some(CallError::Transport(detail)) => {
            ProviderError::Unavailable(detail)
        }
        _ => ProviderError::Other("provider call failed without diagnostics".into()),
    })
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("ragpipe/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
        .expect("Failed to construct reqwest::Client for provider adapter")
}

/// Build the embeddings client for the configured provider.
pub fn build_embeddings_client(
    config: &Config,
    limiter: Arc<RateLimiter>,
) -> Arc<dyn EmbeddingsClient> {
    let timeout = Duration::from_secs(config.http_timeout_seconds);
    match config.embeddings_provider {
        Provider::OpenAI => Arc::new(OpenAiEmbeddingsClient::new(
            http_client(timeout),
            openai_base_url(config),
            config.openai_api_key.clone().unwrap_or_default(),
            config.openai_embedding_model.clone(),
            config.embedding_dimension,
            limiter,
        )),
        Provider::Ollama => Arc::new(OllamaEmbeddingsClient::new(
            http_client(timeout),
            ollama_base_url(config),
            config.ollama_embedding_model.clone(),
            config.embedding_dimension,
            limiter,
        )),
    }
}

/// Build a chat client for the given provider selection (metadata or QA role).
pub fn build_chat_client(
    provider: Provider,
    config: &Config,
    limiter: Arc<RateLimiter>,
) -> Arc<dyn ChatClient> {
    let timeout = Duration::from_secs(config.http_timeout_seconds);
    match provider {
        Provider::OpenAI => Arc::new(OpenAiChatClient::new(
            http_client(timeout),
            openai_base_url(config),
            config.openai_api_key.clone().unwrap_or_default(),
            config.openai_chat_model.clone(),
            limiter,
        )),
        Provider::Ollama => Arc::new(OllamaChatClient::new(
            http_client(timeout),
            ollama_base_url(config),
            config.ollama_chat_model.clone(),
            limiter,
        )),
    }
}

fn openai_base_url(config: &Config) -> String {
    config
        .openai_base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string())
}

fn ollama_base_url(config: &Config) -> String {
    config
        .ollama_url
        .clone()
        .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string())
}
