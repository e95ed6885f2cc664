//! Process-lifetime service graph and shutdown coordination.
//!
//! The supervisor builds every shared component once at startup (rate limiter, provider
//! adapters, vector store client, progress tracker, ingestion pipeline, QA service) and
//! owns them for the process lifetime. Handlers receive the graph behind an `Arc`;
//! nothing else constructs components. Shutdown flips the accepting flag, cancels the
//! root token so pipelines stop scheduling work, and drains in-flight uploads within a
//! bounded grace period.

use crate::chunking::DocumentChunker;
use crate::config::{ChunkingStrategy, Config, Provider};
use crate::enrichment::MetadataEnricher;
use crate::metrics::PipelineMetrics;
use crate::pipeline::IngestionPipeline;
use crate::progress::ProgressTracker;
use crate::providers::{EmbeddingsClient, build_chat_client, build_embeddings_client};
use crate::qa::QaService;
use crate::ratelimit::RateLimiter;
use crate::vectorstore::{MmrParams, VectorStoreClient};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared singletons plus per-request defaults, owned for the process lifetime.
pub struct AppState {
    /// Shared outbound rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Embeddings adapter for ingestion and queries.
    pub embeddings: Arc<dyn EmbeddingsClient>,
    /// Vector store client.
    pub store: Arc<VectorStoreClient>,
    /// Upload progress registry.
    pub tracker: Arc<ProgressTracker>,
    /// Ingestion pipeline.
    pub pipeline: Arc<IngestionPipeline>,
    /// Question-answering service.
    pub qa: Arc<QaService>,
    /// Ingestion counters surfaced by `GET /stats`.
    pub metrics: Arc<PipelineMetrics>,
    /// Root cancellation token; child tokens go to every pipeline run.
    pub shutdown: CancellationToken,
    /// Default collection for uploads that omit one and for QA auto-init.
    pub default_collection: String,
    /// Default splitting strategy.
    pub default_strategy: ChunkingStrategy,
    /// Default for `enable_metadata` when requests omit it.
    pub enable_metadata_default: bool,
    /// Deployment environment label for `GET /health`.
    pub environment: String,
    accepting: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl AppState {
    /// Build the full service graph from the loaded configuration and probe the store.
    pub async fn build(config: &Config) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_rpm));
        let embeddings = build_embeddings_client(config, Arc::clone(&limiter));
        let metadata_chat = build_chat_client(config.metadata_provider, config, Arc::clone(&limiter));
        let qa_chat = build_chat_client(config.qa_provider, config, Arc::clone(&limiter));

        let store = Arc::new(
            VectorStoreClient::new(
                &config.vector_store_url,
                config.vector_store_api_key.clone(),
                config.upsert_batch_size,
                Duration::from_secs(config.http_timeout_seconds),
            )
            .expect("Failed to construct vector store client"),
        );
        let health = store.health().await;
        if health.ok {
            tracing::info!(latency_ms = health.latency_ms, "Vector store reachable");
        } else {
            tracing::warn!(
                detail = health.detail.as_deref().unwrap_or("unknown"),
                "Vector store unreachable at startup; continuing"
            );
        }

        let tokenizer_model = match config.embeddings_provider {
            Provider::OpenAI => config.openai_embedding_model.as_str(),
            Provider::Ollama => config.ollama_embedding_model.as_str(),
        };
        let chunker = Arc::new(
            DocumentChunker::new(config.chunk_size, config.chunk_overlap, tokenizer_model)
                .expect("Failed to construct document chunker"),
        );

        let metrics = Arc::new(PipelineMetrics::new());
        let tracker = Arc::new(ProgressTracker::new(Duration::from_secs(
            config.progress_ttl_seconds,
        )));
        let pipeline = Arc::new(IngestionPipeline::new(
            chunker,
            Arc::new(MetadataEnricher::new(metadata_chat)),
            Arc::clone(&embeddings),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.pipeline_concurrency,
            config.upsert_batch_size,
        ));
        let mmr = MmrParams {
            lambda: config.mmr_lambda,
            fetch_k_factor: config.mmr_fetch_k_factor,
        };
        let qa = Arc::new(QaService::new(
            Arc::clone(&embeddings),
            qa_chat,
            Arc::clone(&store),
            Arc::clone(&pipeline),
            config.vector_store_collection.clone(),
            mmr,
        ));

        Self::assemble(
            limiter,
            embeddings,
            store,
            tracker,
            pipeline,
            qa,
            metrics,
            config.vector_store_collection.clone(),
            config.default_chunking_strategy,
            config.enable_metadata_default,
            config.environment.clone(),
        )
    }

    /// Wire an already-built component graph; used by `build` and by tests that inject
    /// stub providers.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        limiter: Arc<RateLimiter>,
        embeddings: Arc<dyn EmbeddingsClient>,
        store: Arc<VectorStoreClient>,
        tracker: Arc<ProgressTracker>,
        pipeline: Arc<IngestionPipeline>,
        qa: Arc<QaService>,
        metrics: Arc<PipelineMetrics>,
        default_collection: String,
        default_strategy: ChunkingStrategy,
        enable_metadata_default: bool,
        environment: String,
    ) -> Self {
        Self {
            limiter,
            embeddings,
            store,
            tracker,
            pipeline,
            qa,
            metrics,
            shutdown: CancellationToken::new(),
            default_collection,
            default_strategy,
            enable_metadata_default,
            environment,
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether new uploads are currently accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting uploads and cancel all in-flight pipelines.
    pub fn begin_shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            tracing::info!("Shutdown initiated; cancelling in-flight uploads");
            self.shutdown.cancel();
        }
    }

    /// Track one background upload; the guard decrements on drop.
    pub fn upload_started(&self) -> UploadGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        UploadGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Wait until in-flight uploads drain, or the grace period expires.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.in_flight.load(Ordering::SeqCst);
            if remaining == 0 {
                tracing::info!("All uploads drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(remaining, "Grace period expired with uploads in flight");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// RAII guard for one in-flight upload.
pub struct UploadGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Convenience alias used by handler signatures.
pub type SharedState = Arc<AppState>;
