//! Question answering: retrieve relevant chunks, then generate an answer.
//!
//! The service lazily binds itself to a collection. A cold process answering its first
//! question probes the configured default collection and binds a retriever on the fly;
//! if the collection is absent the caller gets a `ServiceUnavailable`-shaped error with
//! an actionable suggestion instead of a crash. Each query type selects its own
//! retrieval recipe and prompt template; every template instructs the model to answer
//! only from the supplied context and to say so when the context is insufficient.

use crate::pipeline::{
    IngestionError, IngestionPipeline, IngestionRequest, IngestionSummary, ProgressHandle,
};
use crate::providers::{ChatClient, EmbeddingsClient, ProviderError};
use crate::vectorstore::{
    CollectionStats, MmrParams, QueryType, Retriever, ScoredPoint, VectorStoreClient,
    VectorStoreError,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Longest snippet returned per source, in characters.
const SNIPPET_CHARS: usize = 200;
/// Questions answered concurrently by `batch_answer`.
const BATCH_CONCURRENCY: usize = 4;

/// Errors surfaced by the question-answering service.
#[derive(Debug, Error)]
pub enum QaError {
    /// No collection is bound and auto-initialization failed.
    #[error("service not initialized: {detail}")]
    Uninitialized {
        /// What went wrong while probing the default collection.
        detail: String,
    },
    /// The vector store failed during retrieval.
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] VectorStoreError),
    /// The embeddings provider failed on the query text.
    #[error("query embedding failed: {0}")]
    QueryEmbedding(ProviderError),
    /// The chat provider failed while generating the answer.
    #[error("generation failed: {0}")]
    Generation(ProviderError),
}

impl QaError {
    /// Stage label attached to error responses.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Uninitialized { .. } => "initialization",
            Self::Retrieval(_) | Self::QueryEmbedding(_) => "retrieval",
            Self::Generation(_) => "generation",
        }
    }
}

/// One retrieved source reference inside a [`QaResponse`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    /// Source label stored with the chunk.
    pub source: String,
    /// Similarity score reported by the store.
    pub relevance_score: f32,
    /// Bounded excerpt of the chunk text.
    pub snippet: String,
    /// Remaining payload fields (enrichment, section, custom attributes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Answer payload returned by [`QaService::answer`].
#[derive(Debug, Clone, Serialize)]
pub struct QaResponse {
    /// Generated answer text.
    pub answer: String,
    /// Query type the retrieval recipe was chosen for.
    pub query_type: QueryType,
    /// Number of retrieved chunks fed into generation.
    pub documents_used: usize,
    /// Milliseconds spent embedding the query and searching.
    pub retrieval_time_ms: u64,
    /// Milliseconds spent on the chat completion.
    pub generation_time_ms: u64,
    /// End-to-end milliseconds for the question.
    pub total_time_ms: u64,
    /// Retrieved chunks with scores and snippets.
    pub sources: Vec<SourceRef>,
    /// Chat model that produced the answer.
    pub model: String,
}

/// Retrieval-only result returned by [`QaService::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    /// Query type the retrieval recipe was chosen for.
    pub query_type: QueryType,
    /// Number of retrieved chunks.
    pub documents_used: usize,
    /// Milliseconds spent embedding the query and searching.
    pub retrieval_time_ms: u64,
    /// Retrieved chunks with scores and snippets.
    pub sources: Vec<SourceRef>,
}

/// Retrieve-then-generate service with lazy collection binding.
pub struct QaService {
    embeddings: Arc<dyn EmbeddingsClient>,
    chat: Arc<dyn ChatClient>,
    store: Arc<VectorStoreClient>,
    pipeline: Arc<IngestionPipeline>,
    default_collection: String,
    mmr: MmrParams,
    bound_collection: Mutex<Option<String>>,
}

impl QaService {
    /// Assemble the service over the shared component graph.
    pub fn new(
        embeddings: Arc<dyn EmbeddingsClient>,
        chat: Arc<dyn ChatClient>,
        store: Arc<VectorStoreClient>,
        pipeline: Arc<IngestionPipeline>,
        default_collection: String,
        mmr: MmrParams,
    ) -> Self {
        Self {
            embeddings,
            chat,
            store,
            pipeline,
            default_collection,
            mmr,
            bound_collection: Mutex::new(None),
        }
    }

    /// Ingest documents synchronously and bind the service to the target collection.
    pub async fn initialize_from_documents(
        &self,
        request: IngestionRequest,
        cancel: CancellationToken,
    ) -> Result<IngestionSummary, IngestionError> {
        let collection = request.collection_name.clone();
        let summary = self
            .pipeline
            .run(request, ProgressHandle::detached(), cancel)
            .await?;
        *self.bound_collection.lock().await = Some(collection);
        Ok(summary)
    }

    /// Probe an existing collection and bind to it.
    pub async fn initialize_from_existing_collection(
        &self,
        collection: &str,
    ) -> Result<CollectionStats, QaError> {
        let stats = self
            .store
            .collection_stats(collection)
            .await
            .map_err(|error| match error {
                VectorStoreError::NotFound(name) => QaError::Uninitialized {
                    detail: format!("collection '{name}' does not exist"),
                },
                other => QaError::Retrieval(other),
            })?;
        tracing::info!(
            collection,
            points = stats.points,
            "Bound question answering to existing collection"
        );
        *self.bound_collection.lock().await = Some(collection.to_string());
        Ok(stats)
    }

    /// Answer one question.
    ///
    /// `collection` rebinds retrieval for this call only; the service-level binding is
    /// untouched. `k` overrides the adaptive result count when within 1..=20.
    pub async fn answer(
        &self,
        question: &str,
        query_type: QueryType,
        k: Option<usize>,
        collection: Option<String>,
    ) -> Result<QaResponse, QaError> {
        let started = Instant::now();
        let (sources, retrieval_time_ms) =
            self.retrieve(question, query_type, k, collection).await?;

        let context = build_context(&sources);
        let (system_prompt, template) = prompt_for(query_type);
        let user_prompt = template
            .replace("{context}", &context)
            .replace("{question}", question);

        let generation_started = Instant::now();
        let answer = self
            .chat
            .complete(system_prompt, &user_prompt, 0.2, Some(1024))
            .await
            .map_err(QaError::Generation)?;
        let generation_time_ms = generation_started.elapsed().as_millis() as u64;

        Ok(QaResponse {
            answer,
            query_type,
            documents_used: sources.len(),
            retrieval_time_ms,
            generation_time_ms,
            total_time_ms: started.elapsed().as_millis() as u64,
            sources,
            model: self.chat.model().to_string(),
        })
    }

    /// Answer several questions with a small bounded fan-out, preserving input order.
    pub async fn batch_answer(
        &self,
        questions: &[String],
        query_type: QueryType,
        k: Option<usize>,
    ) -> Vec<Result<QaResponse, QaError>> {
        use futures_util::StreamExt;

        let mut results: Vec<Option<Result<QaResponse, QaError>>> =
            (0..questions.len()).map(|_| None).collect();
        let indexed_questions: Vec<(usize, String)> = questions
            .iter()
            .cloned()
            .enumerate()
            .collect();
        let mut completions = futures_util::stream::iter(indexed_questions.into_iter().map(
            |(index, question)| async move {
                (index, self.answer(&question, query_type, k, None).await)
            },
        ))
        .buffer_unordered(BATCH_CONCURRENCY);

        while let Some((index, outcome)) = completions.next().await {
            results[index] = Some(outcome);
        }
        drop(completions);

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or(Err(QaError::Uninitialized {
                    detail: "question was not processed".into(),
                }))
            })
            .collect()
    }

    /// Retrieval without generation.
    pub async fn search(
        &self,
        query: &str,
        query_type: QueryType,
        k: Option<usize>,
        collection: Option<String>,
    ) -> Result<SearchResponse, QaError> {
        let (sources, retrieval_time_ms) =
            self.retrieve(query, query_type, k, collection).await?;
        Ok(SearchResponse {
            query_type,
            documents_used: sources.len(),
            retrieval_time_ms,
            sources,
        })
    }

    async fn retrieve(
        &self,
        question: &str,
        query_type: QueryType,
        k: Option<usize>,
        collection: Option<String>,
    ) -> Result<(Vec<SourceRef>, u64), QaError> {
        let collection = match collection {
            Some(explicit) => explicit,
            None => self.ensure_ready().await?,
        };

        let mut retriever = Retriever::adaptive(collection, query_type, None)
            .with_mmr_params(self.mmr);
        if let Some(k) = k {
            retriever = retriever.with_k(k);
        }

        let started = Instant::now();
        let query_vector = self
            .embeddings
            .embed_query(question)
            .await
            .map_err(QaError::QueryEmbedding)?;
        let hits = retriever.retrieve(&self.store, &query_vector).await?;
        let retrieval_time_ms = started.elapsed().as_millis() as u64;

        Ok((hits.into_iter().map(to_source_ref).collect(), retrieval_time_ms))
    }

    async fn ensure_ready(&self) -> Result<String, QaError> {
        {
            let bound = self.bound_collection.lock().await;
            if let Some(collection) = bound.as_ref() {
                return Ok(collection.clone());
            }
        }
        tracing::info!(
            collection = %self.default_collection,
            "Cold start; auto-initializing from existing collection"
        );
        self.initialize_from_existing_collection(&self.default_collection)
            .await?;
        Ok(self.default_collection.clone())
    }
}

fn to_source_ref(point: ScoredPoint) -> SourceRef {
    let mut payload = point.payload;
    let text = payload
        .remove("text")
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    let source = payload
        .remove("source")
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    let metadata = if payload.is_empty() {
        None
    } else {
        Some(Value::Object(payload))
    };

    SourceRef {
        source,
        relevance_score: point.score,
        snippet: snippet_of(&text),
        metadata,
    }
}

fn snippet_of(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(SNIPPET_CHARS).collect();
    format!("{}…", clipped.trim_end())
}

fn build_context(sources: &[SourceRef]) -> String {
    if sources.is_empty() {
        return "No documents were retrieved.".to_string();
    }
    sources
        .iter()
        .map(|source| format!("[Source: {}]\n{}", source.source, source.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System prompt plus user template (with `{context}` and `{question}` holes) per query
/// type. Every template forbids answering beyond the supplied context.
fn prompt_for(query_type: QueryType) -> (&'static str, &'static str) {
    match query_type {
        QueryType::General => (
            "You are a helpful assistant answering questions from provided document \
             excerpts. Use only the context below. If the context does not contain the \
             answer, say that the provided documents are insufficient.",
            "Context:\n{context}\n\nQuestion: {question}\n\nAnswer concisely.",
        ),
        QueryType::Research => (
            "You are a research assistant synthesizing findings across several document \
             excerpts. Use only the context below; cite the source labels you draw from. \
             If the context is insufficient, state what is missing.",
            "Context:\n{context}\n\nResearch question: {question}\n\nProvide a structured \
             synthesis covering every relevant source.",
        ),
        QueryType::Specific => (
            "You are a precise assistant extracting exact facts from document excerpts. \
             Use only the context below. If the exact fact is not present, say so \
             explicitly instead of guessing.",
            "Context:\n{context}\n\nQuestion: {question}\n\nAnswer with the specific fact \
             and its source label.",
        ),
        QueryType::Complex => (
            "You are an analytical assistant reasoning over multiple document excerpts. \
             Use only the context below. Break the question into parts, answer each from \
             the context, and note any part the context cannot answer.",
            "Context:\n{context}\n\nQuestion: {question}\n\nWork through the question \
             step by step, then give a final answer.",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::DocumentChunker;
    use crate::enrichment::MetadataEnricher;
    use crate::metrics::PipelineMetrics;
    use async_trait::async_trait;
    use httpmock::{Method::GET, Method::POST, MockServer};
    use serde_json::json;
    use std::time::Duration;

    struct StubEmbeddings;

    #[async_trait]
    impl EmbeddingsClient for StubEmbeddings {
        async fn embed_documents(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }

        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![0.1, 0.2, 0.3])
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    struct StubChat;

    #[async_trait]
    impl ChatClient for StubChat {
        async fn complete(
            &self,
            _system_prompt: &str,
            user_prompt: &str,
            _temperature: f32,
            _max_tokens: Option<u32>,
        ) -> Result<String, ProviderError> {
            assert!(user_prompt.contains("Context:"), "prompt must embed context");
            Ok("A grounded answer.".into())
        }

        fn model(&self) -> &str {
            "stub-chat"
        }
    }

    fn service(server: &MockServer) -> QaService {
        let embeddings: Arc<dyn EmbeddingsClient> = Arc::new(StubEmbeddings);
        let chat: Arc<dyn ChatClient> = Arc::new(StubChat);
        let store = Arc::new(
            VectorStoreClient::new(&server.base_url(), None, 100, Duration::from_secs(5))
                .expect("store client"),
        );
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::new(DocumentChunker::new(64, 0, "cl100k_base").expect("chunker")),
            Arc::new(MetadataEnricher::new(Arc::clone(&chat))),
            Arc::clone(&embeddings),
            Arc::clone(&store),
            Arc::new(PipelineMetrics::new()),
            2,
            100,
        ));
        QaService::new(
            embeddings,
            chat,
            store,
            pipeline,
            "rag_documents".into(),
            MmrParams::default(),
        )
    }

    fn collection_info(points: u64) -> serde_json::Value {
        json!({
            "result": {
                "points_count": points,
                "config": { "params": { "vectors": { "size": 3 } } }
            }
        })
    }

    fn search_result() -> serde_json::Value {
        json!({
            "result": [
                {
                    "score": 0.88,
                    "payload": {
                        "text": "X is a retrieval system.",
                        "source": "intro.md",
                        "topic": "systems"
                    }
                }
            ]
        })
    }

    #[tokio::test]
    async fn first_answer_auto_initializes_from_default_collection() {
        let server = MockServer::start_async().await;
        let probe = server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/rag_documents");
                then.status(200).json_body(collection_info(12));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/rag_documents/points/query");
                then.status(200).json_body(search_result());
            })
            .await;

        let service = service(&server);
        let response = service
            .answer("What is X?", QueryType::General, Some(3), None)
            .await
            .expect("cold-start answer");

        probe.assert();
        assert_eq!(response.answer, "A grounded answer.");
        assert_eq!(response.documents_used, 1);
        assert_eq!(response.sources[0].source, "intro.md");
        assert_eq!(response.model, "stub-chat");

        // Second question skips the probe (binding is cached).
        service
            .answer("What else?", QueryType::General, None, None)
            .await
            .expect("warm answer");
        assert_eq!(probe.hits_async().await, 1);
    }

    #[tokio::test]
    async fn missing_default_collection_yields_uninitialized() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/rag_documents");
                then.status(404).body("not found");
            })
            .await;

        let service = service(&server);
        let error = service
            .answer("What is X?", QueryType::General, None, None)
            .await
            .expect_err("cold start without collection");
        assert!(matches!(error, QaError::Uninitialized { .. }));
        assert_eq!(error.stage(), "initialization");
    }

    #[tokio::test]
    async fn collection_override_rebinds_for_one_call_only() {
        let server = MockServer::start_async().await;
        let override_search = server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/other/points/query");
                then.status(200).json_body(search_result());
            })
            .await;

        let service = service(&server);
        let response = service
            .answer(
                "What is X?",
                QueryType::General,
                Some(2),
                Some("other".into()),
            )
            .await
            .expect("override answer");

        override_search.assert();
        assert_eq!(response.documents_used, 1);
        // The service-level binding stayed empty; no probe of the default happened.
    }

    #[tokio::test]
    async fn zero_retrieved_documents_still_generate() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/rag_documents");
                then.status(200).json_body(collection_info(0));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/rag_documents/points/query");
                then.status(200).json_body(json!({ "result": [] }));
            })
            .await;

        let service = service(&server);
        let response = service
            .answer("Anything?", QueryType::Specific, None, None)
            .await
            .expect("empty-context answer");
        assert_eq!(response.documents_used, 0);
        assert!(!response.answer.is_empty());
    }

    #[tokio::test]
    async fn batch_answers_preserve_question_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/rag_documents");
                then.status(200).json_body(collection_info(5));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/rag_documents/points/query");
                then.status(200).json_body(search_result());
            })
            .await;

        let service = service(&server);
        let questions: Vec<String> = (0..6).map(|i| format!("question {i}")).collect();
        let answers = service
            .batch_answer(&questions, QueryType::General, Some(2))
            .await;

        assert_eq!(answers.len(), 6);
        for answer in answers {
            answer.expect("every question answered");
        }
    }

    #[test]
    fn snippets_are_bounded_and_marked() {
        let long = "x".repeat(500);
        let snippet = snippet_of(&long);
        assert!(snippet.chars().count() <= SNIPPET_CHARS + 1);
        assert!(snippet.ends_with('…'));
        assert_eq!(snippet_of("short"), "short");
    }

    #[test]
    fn every_prompt_template_has_both_holes() {
        for query_type in [
            QueryType::General,
            QueryType::Research,
            QueryType::Specific,
            QueryType::Complex,
        ] {
            let (system, template) = prompt_for(query_type);
            assert!(!system.is_empty());
            assert!(template.contains("{context}"));
            assert!(template.contains("{question}"));
        }
    }

    #[test]
    fn empty_retrieval_produces_placeholder_context() {
        assert_eq!(build_context(&[]), "No documents were retrieved.");
    }
}
