//! OpenAI adapters for embeddings and chat completion.
//!
//! Both adapters speak the plain HTTP API via `reqwest` (`/v1/embeddings`,
//! `/v1/chat/completions`) so that any OpenAI-compatible endpoint works through the
//! `OPENAI_BASE_URL` override.

use super::{
    CallError, ChatClient, DEFAULT_BACKOFF_BASE, EmbeddingsClient, ProviderError, with_retries,
};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Embeddings adapter backed by the OpenAI embeddings API.
pub struct OpenAiEmbeddingsClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) dimension: usize,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) backoff_base: Duration,
}

impl OpenAiEmbeddingsClient {
    /// Construct an adapter for the given endpoint and model.
    pub fn new(
        http: Client,
        base_url: String,
        api_key: String,
        model: String,
        dimension: usize,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key,
            model,
            dimension,
            limiter,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }

    async fn call_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CallError> {
        let payload = json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(CallError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(status, body));
        }

        let body: EmbeddingsResponse = response.json().await.map_err(|error| {
            CallError::Fatal(ProviderError::Other(format!(
                "failed to decode embeddings response: {error}"
            )))
        })?;

        let mut data = body.data;
        data.sort_by_key(|item| item.index);
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingsClient for OpenAiEmbeddingsClient {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = with_retries(
            &self.limiter,
            "openai_embeddings",
            self.backoff_base,
            || self.call_once(texts),
        )
        .await?;

        if vectors.len() != texts.len() {
            return Err(ProviderError::Other(format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_documents(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::Other("provider returned no embedding".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Chat adapter backed by the OpenAI chat completions API.
pub struct OpenAiChatClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) backoff_base: Duration,
}

impl OpenAiChatClient {
    /// Construct an adapter for the given endpoint and model.
    pub fn new(
        http: Client,
        base_url: String,
        api_key: String,
        model: String,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key,
            model,
            limiter,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn call_once(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, CallError> {
        let mut payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "temperature": temperature,
        });
        if let Some(max_tokens) = max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(CallError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(status, body));
        }

        let body: ChatResponse = response.json().await.map_err(|error| {
            CallError::Fatal(ProviderError::Other(format!(
                "failed to decode chat response: {error}"
            )))
        })?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                CallError::Fatal(ProviderError::Other(
                    "chat response contained no choices".into(),
                ))
            })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, ProviderError> {
        with_retries(&self.limiter, "openai_chat", self.backoff_base, || {
            self.call_once(system_prompt, user_prompt, temperature, max_tokens)
        })
        .await
        .map(|text| text.trim().to_string())
    }

    fn model(&self) -> &str {
        &self.model
    }
}
