//! Staged ingestion: chunk, enrich, embed, index.
//!
//! One pipeline run owns a single upload end to end. Stages publish progress through a
//! [`ProgressHandle`], which is bound to the tracker for background uploads and detached
//! for the synchronous initialization path, so the pipeline drains identically whether
//! or not anyone is watching.
//!
//! Failure policy: a chunk whose enrichment call fails falls back to empty metadata and
//! the upload continues; any embedding or indexing failure is fatal. Duplicate chunks
//! (by content hash) are dropped before enrichment so provider budget is not spent on
//! repeats. Cancellation stops scheduling promptly and terminates the upload in
//! `failed`.

use crate::chunking::{Chunk, ChunkingError, Document, DocumentChunker};
use crate::config::ChunkingStrategy;
use crate::enrichment::{ChunkMetadata, MetadataEnricher};
use crate::metrics::PipelineMetrics;
use crate::progress::{ProgressTracker, ProgressUpdate, UploadStatus};
use crate::providers::{EmbeddingsClient, ProviderError};
use crate::vectorstore::{IndexedPoint, VectorStoreClient, VectorStoreError};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Rough unit prices used for the per-upload cost estimate.
const EMBEDDING_USD_PER_1K_TOKENS: f64 = 0.00002;
const ENRICHMENT_USD_PER_CALL: f64 = 0.0002;

/// Progress percentage reserved for the indexing stage when enrichment ran.
const INDEXING_FLOOR_PERCENT: u8 = 90;

/// Errors that terminate an upload.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Document splitting failed.
    #[error("chunking failed: {0}")]
    Chunking(#[from] ChunkingError),
    /// The embeddings provider failed while computing vectors.
    #[error("embedding failed: {0}")]
    Embedding(ProviderError),
    /// The vector store rejected collection setup or the upsert.
    #[error("vector store failure: {0}")]
    VectorStore(#[from] VectorStoreError),
    /// The upload was cancelled by shutdown or an explicit cancel.
    #[error("upload cancelled")]
    Cancelled,
}

impl IngestionError {
    /// Pipeline stage the error is attributed to.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Chunking(_) => "chunking",
            Self::Embedding(_) | Self::VectorStore(_) => "indexing",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Parameters for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestionRequest {
    /// Documents to ingest.
    pub documents: Vec<Document>,
    /// Target collection name.
    pub collection_name: String,
    /// Splitting strategy.
    pub strategy: ChunkingStrategy,
    /// Whether chunks are enriched with LLM metadata.
    pub enable_metadata: bool,
    /// Whether the collection is dropped and rebuilt first.
    pub force_recreate: bool,
}

/// Terminal result of a completed upload.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    /// Documents ingested.
    pub total_documents: usize,
    /// Chunks produced after deduplication.
    pub total_chunks: usize,
    /// Vectors written to the store.
    pub total_vectors: usize,
    /// Collection that received the vectors.
    pub collection_name: String,
    /// Wall-clock duration of the run in milliseconds.
    pub processing_time_ms: u64,
    /// Rough provider spend for the run in USD.
    pub estimated_cost_usd: f64,
}

/// Progress sink for one upload: tracker-bound for background uploads, detached for the
/// synchronous path. Tracker errors never disturb the pipeline.
#[derive(Clone)]
pub struct ProgressHandle {
    inner: Option<(Arc<ProgressTracker>, Uuid)>,
}

impl ProgressHandle {
    /// Bind progress emission to a tracked upload.
    pub fn attached(tracker: Arc<ProgressTracker>, upload_id: Uuid) -> Self {
        Self {
            inner: Some((tracker, upload_id)),
        }
    }

    /// Discard progress emission (synchronous initialization).
    pub fn detached() -> Self {
        Self { inner: None }
    }

    fn update(&self, update: ProgressUpdate) {
        if let Some((tracker, upload_id)) = &self.inner
            && let Err(error) = tracker.update(*upload_id, update)
        {
            tracing::debug!(%upload_id, error = %error, "Progress update dropped");
        }
    }

    fn transition(&self, status: UploadStatus, message: impl Into<String>) {
        self.update(ProgressUpdate {
            status: Some(status),
            message: Some(message.into()),
            ..Default::default()
        });
    }

    fn finish(&self, status: UploadStatus, result: Option<Value>, error: Option<String>) {
        if let Some((tracker, upload_id)) = &self.inner
            && let Err(tracker_error) = tracker.finish(*upload_id, status, result, error)
        {
            tracing::debug!(%upload_id, error = %tracker_error, "Terminal progress event dropped");
        }
    }
}

/// Orchestrates one upload through chunking, enrichment, embedding, and indexing.
pub struct IngestionPipeline {
    chunker: Arc<DocumentChunker>,
    enricher: Arc<MetadataEnricher>,
    embeddings: Arc<dyn EmbeddingsClient>,
    store: Arc<VectorStoreClient>,
    metrics: Arc<PipelineMetrics>,
    concurrency: usize,
    batch_size: usize,
}

impl IngestionPipeline {
    /// Assemble a pipeline over the shared service graph.
    pub fn new(
        chunker: Arc<DocumentChunker>,
        enricher: Arc<MetadataEnricher>,
        embeddings: Arc<dyn EmbeddingsClient>,
        store: Arc<VectorStoreClient>,
        metrics: Arc<PipelineMetrics>,
        concurrency: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            chunker,
            enricher,
            embeddings,
            store,
            metrics,
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Run one upload to its terminal state.
    ///
    /// Emits the terminal progress event (and updates ingestion counters) before
    /// returning, so callers only need the returned result for the synchronous path.
    pub async fn run(
        &self,
        request: IngestionRequest,
        progress: ProgressHandle,
        cancel: CancellationToken,
    ) -> Result<IngestionSummary, IngestionError> {
        let outcome = self.run_inner(&request, &progress, &cancel).await;
        match &outcome {
            Ok(summary) => {
                self.metrics.record_completed(
                    summary.total_documents as u64,
                    summary.total_chunks as u64,
                    summary.total_vectors as u64,
                );
                let payload = serde_json::to_value(summary).unwrap_or(Value::Null);
                progress.finish(UploadStatus::Completed, Some(payload), None);
                tracing::info!(
                    collection = %summary.collection_name,
                    documents = summary.total_documents,
                    chunks = summary.total_chunks,
                    vectors = summary.total_vectors,
                    elapsed_ms = summary.processing_time_ms,
                    "Upload completed"
                );
            }
            Err(error) => {
                self.metrics.record_failed();
                let detail = match error {
                    IngestionError::Cancelled => "cancelled".to_string(),
                    other => format!("{}: {other}", other.stage()),
                };
                progress.finish(UploadStatus::Failed, None, Some(detail));
                tracing::warn!(
                    collection = %request.collection_name,
                    stage = error.stage(),
                    error = %error,
                    "Upload failed"
                );
            }
        }
        outcome
    }

    async fn run_inner(
        &self,
        request: &IngestionRequest,
        progress: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> Result<IngestionSummary, IngestionError> {
        let started = Instant::now();
        progress.transition(UploadStatus::Extracting, "Reading documents");

        // Chunking.
        if cancel.is_cancelled() {
            return Err(IngestionError::Cancelled);
        }
        progress.transition(UploadStatus::Chunking, "Splitting documents into chunks");
        let mut chunks: Vec<Chunk> = Vec::new();
        for document in &request.documents {
            let split = self
                .chunker
                .chunk_document(document, request.strategy, self.embeddings.as_ref())
                .await?;
            chunks.extend(split);
        }
        let duplicates = dedupe_chunks(&mut chunks);
        if duplicates > 0 {
            tracing::debug!(duplicates, "Dropped duplicate chunks before enrichment");
        }
        let total_chunks = chunks.len();
        progress.update(ProgressUpdate {
            total_chunks: Some(total_chunks),
            message: Some(format!("Produced {total_chunks} chunks")),
            ..Default::default()
        });

        if total_chunks == 0 {
            return Ok(IngestionSummary {
                total_documents: request.documents.len(),
                total_chunks: 0,
                total_vectors: 0,
                collection_name: request.collection_name.clone(),
                processing_time_ms: started.elapsed().as_millis() as u64,
                estimated_cost_usd: 0.0,
            });
        }

        // Enrichment (optional, degraded on per-chunk failure).
        let mut enrichment_calls = 0usize;
        let mut metadata = vec![ChunkMetadata::default(); total_chunks];
        if request.enable_metadata {
            if cancel.is_cancelled() {
                return Err(IngestionError::Cancelled);
            }
            progress.transition(UploadStatus::Enriching, "Enriching chunk metadata");
            enrichment_calls = total_chunks;

            let chunk_texts: Vec<(usize, String)> = chunks
                .iter()
                .enumerate()
                .map(|(index, chunk)| (index, chunk.text.clone()))
                .collect();
            let mut completions = futures_util::stream::iter(chunk_texts.into_iter().map(
                |(index, text)| {
                    let enricher = Arc::clone(&self.enricher);
                    let cancel = cancel.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return (index, ChunkMetadata::default());
                        }
                        match enricher.enrich(&text).await {
                            Ok(found) => (index, found),
                            Err(error) => {
                                tracing::warn!(
                                    chunk = index,
                                    error = %error,
                                    "Enrichment failed; continuing with empty metadata"
                                );
                                (index, ChunkMetadata::default())
                            }
                        }
                    }
                },
            ))
            .buffer_unordered(self.concurrency);

            let mut completed = 0usize;
            while let Some((index, found)) = completions.next().await {
                metadata[index] = found;
                completed += 1;
                progress.update(ProgressUpdate {
                    current_chunk: Some(completed),
                    progress_percent: Some(scale_percent(
                        completed,
                        total_chunks,
                        0,
                        INDEXING_FLOOR_PERCENT,
                    )),
                    message: Some(format!("Enriched {completed}/{total_chunks} chunks")),
                    ..Default::default()
                });
            }
            drop(completions);

            if cancel.is_cancelled() {
                return Err(IngestionError::Cancelled);
            }
        }

        // Indexing: ensure the collection, then embed and upsert batch by batch.
        progress.transition(UploadStatus::Indexing, "Embedding and indexing chunks");
        let dimension = self.embeddings.dimension();
        self.store
            .ensure_collection(&request.collection_name, dimension, request.force_recreate)
            .await?;

        let indexing_floor = if request.enable_metadata {
            INDEXING_FLOOR_PERCENT
        } else {
            0
        };
        let total_batches = total_chunks.div_ceil(self.batch_size);
        let mut total_vectors = 0usize;
        let mut embedded_tokens = 0usize;

        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(IngestionError::Cancelled);
            }
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = self
                .embeddings
                .embed_documents(&texts)
                .await
                .map_err(IngestionError::Embedding)?;
            embedded_tokens += batch.iter().map(|chunk| chunk.token_count).sum::<usize>();

            let offset = batch_index * self.batch_size;
            let points: Vec<IndexedPoint> = batch
                .iter()
                .zip(vectors)
                .enumerate()
                .map(|(position, (chunk, vector))| IndexedPoint {
                    vector,
                    payload: build_payload(chunk, &metadata[offset + position]),
                })
                .collect();

            total_vectors += self
                .store
                .upsert(&request.collection_name, points)
                .await?;

            progress.update(ProgressUpdate {
                current_chunk: Some((offset + batch.len()).min(total_chunks)),
                progress_percent: Some(scale_percent(
                    batch_index + 1,
                    total_batches,
                    indexing_floor,
                    100,
                )),
                message: Some(format!(
                    "Indexed batch {}/{total_batches}",
                    batch_index + 1
                )),
                ..Default::default()
            });
        }

        let estimated_cost_usd = (embedded_tokens as f64 / 1000.0) * EMBEDDING_USD_PER_1K_TOKENS
            + enrichment_calls as f64 * ENRICHMENT_USD_PER_CALL;

        Ok(IngestionSummary {
            total_documents: request.documents.len(),
            total_chunks,
            total_vectors,
            collection_name: request.collection_name.clone(),
            processing_time_ms: started.elapsed().as_millis() as u64,
            estimated_cost_usd,
        })
    }
}

/// Drop chunks whose content hash was already seen, returning how many were removed.
fn dedupe_chunks(chunks: &mut Vec<Chunk>) -> usize {
    let mut seen = HashSet::new();
    let before = chunks.len();
    chunks.retain(|chunk| seen.insert(chunk_hash(&chunk.text)));
    before - chunks.len()
}

fn chunk_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the opaque payload stored next to a vector.
fn build_payload(chunk: &Chunk, metadata: &ChunkMetadata) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("text".into(), Value::String(chunk.text.clone()));
    payload.insert("source".into(), Value::String(chunk.source.clone()));
    payload.insert("chunk_index".into(), json!(chunk.index));
    payload.insert("chunk_hash".into(), Value::String(chunk_hash(&chunk.text)));
    for (key, value) in &chunk.metadata {
        payload.insert(key.clone(), value.clone());
    }
    if !metadata.is_empty() {
        payload.insert("summary".into(), Value::String(metadata.summary.clone()));
        payload.insert("keywords".into(), json!(metadata.keywords));
        payload.insert("topic".into(), Value::String(metadata.topic.clone()));
        payload.insert(
            "complexity".into(),
            Value::String(metadata.complexity.clone()),
        );
        payload.insert("entities".into(), json!(metadata.entities));
        payload.insert(
            "sentiment".into(),
            Value::String(metadata.sentiment.clone()),
        );
    }
    payload
}

/// Linear fill of `[floor, ceiling]` by `done/total`.
fn scale_percent(done: usize, total: usize, floor: u8, ceiling: u8) -> u8 {
    if total == 0 {
        return ceiling;
    }
    let span = u64::from(ceiling.saturating_sub(floor));
    let filled = (done as u64 * span) / total as u64;
    floor.saturating_add(filled as u8).min(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::providers::ChatClient;
    use crate::vectorstore::VectorStoreClient;
    use async_trait::async_trait;
    use httpmock::{Method::GET, Method::PUT, MockServer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubEmbeddings {
        dimension: usize,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingsClient for StubEmbeddings {
        async fn embed_documents(
            &self,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            if self.fail {
                return Err(ProviderError::Unavailable("embeddings down".into()));
            }
            Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
        }

        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![0.5; self.dimension])
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    struct StubChat {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl ChatClient for StubChat {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _temperature: f32,
            _max_tokens: Option<u32>,
        ) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(ProviderError::Other("model hiccup".into()));
            }
            Ok(r#"{"summary":"stub","topic":"testing","complexity":"simple"}"#.into())
        }

        fn model(&self) -> &str {
            "stub-model"
        }
    }

    fn mock_store(server: &MockServer) -> Arc<VectorStoreClient> {
        Arc::new(
            VectorStoreClient::new(&server.base_url(), None, 100, Duration::from_secs(5))
                .expect("store client"),
        )
    }

    async fn mock_happy_store(server: &MockServer) {
        server
            .mock_async(|when, then| {
                when.method(GET).path_matches(regex::Regex::new("/collections/.+").unwrap());
                then.status(404).body("not found");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path_matches(regex::Regex::new("^/collections/[^/]+$").unwrap());
                then.status(200).json_body(serde_json::json!({ "result": true }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path_matches(regex::Regex::new("^/collections/[^/]+/points$").unwrap());
                then.status(200)
                    .json_body(serde_json::json!({ "result": { "status": "acknowledged" } }));
            })
            .await;
    }

    fn pipeline(
        store: Arc<VectorStoreClient>,
        embeddings: Arc<dyn EmbeddingsClient>,
        chat: Arc<dyn ChatClient>,
    ) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::new(DocumentChunker::new(64, 0, "cl100k_base").expect("chunker")),
            Arc::new(MetadataEnricher::new(chat)),
            embeddings,
            store,
            Arc::new(PipelineMetrics::new()),
            4,
            100,
        )
    }

    fn request(enable_metadata: bool) -> IngestionRequest {
        IngestionRequest {
            documents: vec![
                Document::new("alpha beta gamma delta", "a.txt"),
                Document::new("epsilon zeta eta theta", "b.txt"),
            ],
            collection_name: "docs".into(),
            strategy: ChunkingStrategy::Recursive,
            enable_metadata,
            force_recreate: false,
        }
    }

    async fn drain(mut stream: tokio::sync::mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn upload_completes_with_monotonic_progress() {
        let server = MockServer::start_async().await;
        mock_happy_store(&server).await;
        let pipeline = pipeline(
            mock_store(&server),
            Arc::new(StubEmbeddings {
                dimension: 4,
                fail: false,
            }),
            Arc::new(StubChat {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }),
        );

        let tracker = Arc::new(ProgressTracker::new(Duration::from_secs(60)));
        let upload_id = Uuid::new_v4();
        tracker.create(upload_id).expect("create job");
        let stream = tracker.subscribe(upload_id).expect("subscribe before run");
        let handle = ProgressHandle::attached(Arc::clone(&tracker), upload_id);

        let summary = pipeline
            .run(request(false), handle, CancellationToken::new())
            .await
            .expect("completed upload");

        assert_eq!(summary.total_documents, 2);
        assert_eq!(summary.total_chunks, 2);
        assert_eq!(summary.total_vectors, 2);

        let events = drain(stream).await;
        let statuses: Vec<UploadStatus> = events.iter().map(|event| event.status).collect();
        assert_eq!(statuses[0], UploadStatus::Received, "snapshot comes first");
        assert!(statuses.contains(&UploadStatus::Chunking));
        assert!(statuses.contains(&UploadStatus::Indexing));
        assert_eq!(*statuses.last().expect("terminal"), UploadStatus::Completed);
        assert!(!statuses.contains(&UploadStatus::Enriching));

        let mut last = 0u8;
        for event in &events {
            assert!(event.progress_percent >= last, "progress must not regress");
            last = event.progress_percent;
        }
        assert_eq!(last, 100);
        let terminal = events.last().expect("terminal");
        assert_eq!(terminal.current_chunk, terminal.total_chunks);
    }

    #[tokio::test]
    async fn enrichment_failure_degrades_to_empty_metadata() {
        let server = MockServer::start_async().await;
        mock_happy_store(&server).await;
        let pipeline = pipeline(
            mock_store(&server),
            Arc::new(StubEmbeddings {
                dimension: 4,
                fail: false,
            }),
            Arc::new(StubChat {
                calls: AtomicUsize::new(0),
                fail_on_call: Some(0),
            }),
        );

        let summary = pipeline
            .run(
                request(true),
                ProgressHandle::detached(),
                CancellationToken::new(),
            )
            .await
            .expect("upload survives enrichment failure");
        assert_eq!(summary.total_vectors, 2);
        assert!(summary.estimated_cost_usd > 0.0);
    }

    #[tokio::test]
    async fn embedding_failure_fails_the_upload_at_indexing() {
        let server = MockServer::start_async().await;
        mock_happy_store(&server).await;
        let pipeline = pipeline(
            mock_store(&server),
            Arc::new(StubEmbeddings {
                dimension: 4,
                fail: true,
            }),
            Arc::new(StubChat {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }),
        );

        let tracker = Arc::new(ProgressTracker::new(Duration::from_secs(60)));
        let upload_id = Uuid::new_v4();
        tracker.create(upload_id).expect("create job");
        let stream = tracker.subscribe(upload_id).expect("subscribe before run");
        let handle = ProgressHandle::attached(Arc::clone(&tracker), upload_id);

        let error = pipeline
            .run(request(false), handle, CancellationToken::new())
            .await
            .expect_err("embedding failure is fatal");
        assert_eq!(error.stage(), "indexing");

        let events = drain(stream).await;
        let terminal = events.last().expect("terminal event");
        assert_eq!(terminal.status, UploadStatus::Failed);
        assert!(
            terminal.error.as_deref().unwrap_or_default().contains("indexing"),
            "failure carries its stage"
        );
    }

    #[tokio::test]
    async fn cancellation_terminates_in_failed_with_reason() {
        let server = MockServer::start_async().await;
        mock_happy_store(&server).await;
        let pipeline = pipeline(
            mock_store(&server),
            Arc::new(StubEmbeddings {
                dimension: 4,
                fail: false,
            }),
            Arc::new(StubChat {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }),
        );

        let tracker = Arc::new(ProgressTracker::new(Duration::from_secs(60)));
        let upload_id = Uuid::new_v4();
        tracker.create(upload_id).expect("create job");
        let stream = tracker.subscribe(upload_id).expect("subscribe before run");
        let handle = ProgressHandle::attached(Arc::clone(&tracker), upload_id);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = pipeline
            .run(request(false), handle, cancel)
            .await
            .expect_err("cancelled upload");
        assert!(matches!(error, IngestionError::Cancelled));

        let events = drain(stream).await;
        let terminal = events.last().expect("terminal event");
        assert_eq!(terminal.status, UploadStatus::Failed);
        assert_eq!(terminal.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn duplicate_chunks_are_dropped_before_indexing() {
        let server = MockServer::start_async().await;
        mock_happy_store(&server).await;
        let pipeline = pipeline(
            mock_store(&server),
            Arc::new(StubEmbeddings {
                dimension: 4,
                fail: false,
            }),
            Arc::new(StubChat {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
            }),
        );

        let request = IngestionRequest {
            documents: vec![
                Document::new("same text twice", "a.txt"),
                Document::new("same text twice", "b.txt"),
            ],
            collection_name: "docs".into(),
            strategy: ChunkingStrategy::Recursive,
            enable_metadata: false,
            force_recreate: false,
        };

        let summary = pipeline
            .run(request, ProgressHandle::detached(), CancellationToken::new())
            .await
            .expect("completed");
        assert_eq!(summary.total_chunks, 1);
        assert_eq!(summary.total_vectors, 1);
    }

    #[test]
    fn scale_percent_fills_the_requested_band() {
        assert_eq!(scale_percent(0, 4, 90, 100), 90);
        assert_eq!(scale_percent(2, 4, 90, 100), 95);
        assert_eq!(scale_percent(4, 4, 90, 100), 100);
        assert_eq!(scale_percent(3, 3, 0, 90), 90);
        assert_eq!(scale_percent(1, 0, 0, 100), 100);
    }

    #[test]
    fn payload_carries_chunk_and_enrichment_fields() {
        let chunk = Chunk {
            text: "payload text".into(),
            source: "doc.md".into(),
            index: 3,
            token_count: 2,
            metadata: [("section".to_string(), Value::String("Intro".into()))]
                .into_iter()
                .collect(),
        };
        let metadata = ChunkMetadata {
            summary: "short".into(),
            keywords: vec!["k".into()],
            topic: "t".into(),
            complexity: "simple".into(),
            entities: vec![],
            sentiment: "neutral".into(),
        };

        let payload = build_payload(&chunk, &metadata);
        assert_eq!(payload["text"], Value::String("payload text".into()));
        assert_eq!(payload["source"], Value::String("doc.md".into()));
        assert_eq!(payload["chunk_index"], json!(3));
        assert_eq!(payload["section"], Value::String("Intro".into()));
        assert_eq!(payload["summary"], Value::String("short".into()));
        assert!(payload.contains_key("chunk_hash"));

        let empty = build_payload(&chunk, &ChunkMetadata::default());
        assert!(!empty.contains_key("summary"));
    }
}
