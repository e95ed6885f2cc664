//! Ollama adapters for embeddings and chat completion.
//!
//! The adapters issue HTTP requests directly to the local runtime (`/api/embed`,
//! `/api/chat`) and validate that non-streaming responses arrived complete.

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

/// Embeddings adapter backed by a local Ollama runtime.
pub struct OllamaEmbeddingsClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    pub(crate) model: String,
    pub(crate) dimension: usize,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) backoff_base: Duration,
}

impl OllamaEmbeddingsClient {
    /// Construct an adapter for the given runtime URL and model.
    pub fn new(
        http: Client,
        base_url: String,
        model: String,
        dimension: usize,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            http,
            base_url,
            model,
            dimension,
            limiter,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }

    async fn call_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CallError> {
        let payload = json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(CallError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(status, body));
        }

        let body: EmbedResponse = response.json().await.map_err(|error| {
            CallError::Fatal(ProviderError::Other(format!(
                "failed to decode Ollama embed response: {error}"
            )))
        })?;
        Ok(body.embeddings)
    }
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingsClient for OllamaEmbeddingsClient {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = with_retries(
            &self.limiter,
            "ollama_embeddings",
            self.backoff_base,
            || self.call_once(texts),
        )
        .await?;

        if vectors.len() != texts.len() {
            return Err(ProviderError::Other(format!(
                "Ollama returned {} embeddings for {} inputs",
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
            .ok_or_else(|| ProviderError::Other("Ollama returned no embedding".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Chat adapter backed by a local Ollama runtime.
pub struct OllamaChatClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    pub(crate) model: String,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) backoff_base: Duration,
}

impl OllamaChatClient {
    /// Construct an adapter for the given runtime URL and model.
    pub fn new(http: Client, base_url: String, model: String, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            base_url,
            model,
            limiter,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    async fn call_once(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, CallError> {
        let mut options = json!({ "temperature": temperature });
        if let Some(max_tokens) = max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "stream": false,
            "options": options,
        });

        let response = self
            .http
            .post(self.endpoint())
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
                "failed to decode Ollama chat response: {error}"
            )))
        })?;

        if !body.done {
            return Err(CallError::Fatal(ProviderError::Other(
                "Ollama chat response incomplete (streaming not supported)".into(),
            )));
        }

        Ok(body.message.content)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
    done: bool,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait]
impl ChatClient for OllamaChatClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, ProviderError> {
        with_retries(&self.limiter, "ollama_chat", self.backoff_base, || {
            self.call_once(system_prompt, user_prompt, temperature, max_tokens)
        })
        .await
        .map(|text| text.trim().to_string())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn embed_returns_vectors_in_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(serde_json::json!({
                    "embeddings": [[0.1, 0.2], [0.3, 0.4]]
                }));
            })
            .await;

        let client = OllamaEmbeddingsClient {
            http: Client::builder()
                .user_agent("ragpipe-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            model: "nomic-embed-text".into(),
            dimension: 2,
            limiter: Arc::new(RateLimiter::new(1000)),
            backoff_base: Duration::from_millis(1),
        };

        let vectors = client
            .embed_documents(&["a".into(), "b".into()])
            .await
            .expect("embeddings");

        mock.assert();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn incomplete_chat_response_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).json_body(serde_json::json!({
                    "message": { "role": "assistant", "content": "partial" },
                    "done": false
                }));
            })
            .await;

        let client = OllamaChatClient {
            http: Client::builder()
                .user_agent("ragpipe-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            model: "llama3.1".into(),
            limiter: Arc::new(RateLimiter::new(1000)),
            backoff_base: Duration::from_millis(1),
        };

        let error = client
            .complete("system", "user", 0.1, None)
            .await
            .expect_err("incomplete response");
        assert!(matches!(error, ProviderError::Other(_)));
    }

    #[tokio::test]
    async fn chat_returns_trimmed_content() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).json_body(serde_json::json!({
                    "message": { "role": "assistant", "content": "An answer.\n" },
                    "done": true
                }));
            })
            .await;

        let client = OllamaChatClient {
            http: Client::builder()
                .user_agent("ragpipe-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            model: "llama3.1".into(),
            limiter: Arc::new(RateLimiter::new(1000)),
            backoff_base: Duration::from_millis(1),
        };

        let text = client
            .complete("system", "user", 0.1, None)
            .await
            .expect("completion");
        mock.assert();
        assert_eq!(text, "An answer.");
    }
}
