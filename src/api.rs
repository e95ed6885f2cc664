//! HTTP and WebSocket surface.
//!
//! This module exposes the Axum router over the shared service graph:
//!
//! - `POST /upload` – Accept a document batch, return an `upload_id` immediately, and
//!   run ingestion on a background task.
//! - `WS /ws/{upload_id}` – Stream progress frames for one upload until its terminal
//!   event; unknown ids close with code 4404.
//! - `POST /initialize` – Synchronous ingestion that binds question answering.
//! - `POST /question`, `POST /search`, `POST /batch-questions` – Retrieval-augmented
//!   answering over the bound (or per-request) collection.
//! - `GET /health`, `GET /stats`, `GET /rate-limit-stats` – Liveness and diagnostics.
//! - `DELETE /collection/{name}` – Idempotent collection removal.
//!
//! Handlers validate input, map typed service errors onto HTTP statuses with
//! `{detail, stage?, suggestion?}` bodies, and never perform heavy work inline.

use crate::chunking::Document;
use crate::config::ChunkingStrategy;
use crate::pipeline::{IngestionError, IngestionRequest, ProgressHandle};
use crate::progress::{ProgressError, now_rfc3339};
use crate::qa::{QaError, QaResponse, SearchResponse};
use crate::state::SharedState;
use crate::vectorstore::{QueryType, VectorStoreError};
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// WebSocket close code for unknown or evicted upload ids.
const WS_UNKNOWN_UPLOAD: u16 = 4404;

/// Build the router exposing the full API surface.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/initialize", post(initialize))
        .route("/question", post(question))
        .route("/search", post(search))
        .route("/batch-questions", post(batch_questions))
        .route("/stats", get(stats))
        .route("/rate-limit-stats", get(rate_limit_stats))
        .route("/collection/:name", delete(delete_collection))
        .route("/ws/:upload_id", get(ws_upload))
        .with_state(state)
}

/// Input document in an upload or initialize request.
#[derive(Debug, Deserialize)]
struct DocumentInput {
    /// Raw text content.
    content: String,
    /// Source label carried through to retrieval results.
    source: String,
    /// Optional free-form attributes inherited by every chunk.
    #[serde(default)]
    metadata: Option<BTreeMap<String, Value>>,
}

/// Request body shared by `POST /upload` and `POST /initialize`.
#[derive(Debug, Deserialize)]
struct UploadRequest {
    collection_name: String,
    documents: Vec<DocumentInput>,
    #[serde(default)]
    force_recreate: bool,
    #[serde(default)]
    enable_metadata: Option<bool>,
    #[serde(default)]
    chunking_strategy: Option<ChunkingStrategy>,
}

#[derive(Serialize)]
struct UploadResponse {
    upload_id: Uuid,
    status: &'static str,
    message: String,
    timestamp: String,
}

#[derive(Serialize)]
struct InitializeResponse {
    status: &'static str,
    total_documents: usize,
    total_chunks: usize,
    total_vectors: usize,
    collection_name: String,
    processing_time_ms: u64,
    estimated_cost_usd: f64,
}

#[derive(Debug, Deserialize)]
struct QuestionRequest {
    question: String,
    #[serde(default)]
    query_type: QueryType,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    collection_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchQuestionsRequest {
    questions: Vec<String>,
    #[serde(default)]
    query_type: QueryType,
    #[serde(default)]
    k: Option<usize>,
}

/// One entry of the `POST /batch-questions` response; failures are reported inline.
#[derive(Serialize)]
#[serde(untagged)]
enum BatchAnswer {
    Ok(QaResponse),
    Err { error: ErrorBody },
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    timestamp: String,
}

#[derive(Serialize)]
struct StatsResponse {
    collection: Value,
    pipeline: crate::metrics::MetricsSnapshot,
    rate_limiter: crate::ratelimit::RateLimiterStats,
    vector_store: crate::vectorstore::HealthSnapshot,
}

#[derive(Serialize)]
struct DeleteCollectionResponse {
    status: &'static str,
    collection: String,
}

/// Wire shape of every error response.
#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'static str>,
}

struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn validation(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                detail: detail.into(),
                stage: None,
                suggestion: None,
            },
        }
    }

    fn shutting_down() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorBody {
                detail: "server is shutting down".into(),
                stage: None,
                suggestion: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<QaError> for ApiError {
    fn from(error: QaError) -> Self {
        let stage = error.stage();
        let (status, suggestion) = match &error {
            QaError::Uninitialized { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("call /initialize to ingest documents first"),
            ),
            QaError::Retrieval(VectorStoreError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, None)
            }
            QaError::Retrieval(VectorStoreError::NotFound(_)) => (StatusCode::NOT_FOUND, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        Self {
            status,
            body: ErrorBody {
                detail: error.to_string(),
                stage: Some(stage),
                suggestion,
            },
        }
    }
}

impl From<IngestionError> for ApiError {
    fn from(error: IngestionError) -> Self {
        let status = match &error {
            IngestionError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            IngestionError::VectorStore(VectorStoreError::Unavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            IngestionError::VectorStore(VectorStoreError::BadDimension { .. }) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                detail: error.to_string(),
                stage: Some(error.stage()),
                suggestion: None,
            },
        }
    }
}

impl From<VectorStoreError> for ApiError {
    fn from(error: VectorStoreError) -> Self {
        let status = match &error {
            VectorStoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            VectorStoreError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                detail: error.to_string(),
                stage: None,
                suggestion: None,
            },
        }
    }
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.is_accepting() {
            "healthy"
        } else {
            "shutting_down"
        },
        version: env!("CARGO_PKG_VERSION"),
        environment: state.environment.clone(),
        timestamp: now_rfc3339(),
    })
}

/// Accept a document batch and schedule background ingestion.
///
/// Returns within milliseconds regardless of batch size; all heavy work happens on the
/// spawned pipeline task, and progress is observable through `WS /ws/{upload_id}`.
async fn upload(
    State(state): State<SharedState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    if !state.is_accepting() {
        return Err(ApiError::shutting_down());
    }
    let ingestion = validate_upload(&state, request)?;

    let upload_id = Uuid::new_v4();
    state
        .tracker
        .create(upload_id)
        .map_err(|error| ApiError::validation(error.to_string()))?;

    let progress = ProgressHandle::attached(state.tracker.clone(), upload_id);
    let cancel = state.shutdown.child_token();
    let guard = state.upload_started();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let _guard = guard;
        // The pipeline emits the terminal progress event itself.
        let _ = pipeline.run(ingestion, progress, cancel).await;
    });

    tracing::info!(%upload_id, "Upload accepted");
    Ok(Json(UploadResponse {
        upload_id,
        status: "received",
        message: "Upload accepted; processing started".into(),
        timestamp: now_rfc3339(),
    }))
}

/// Synchronous ingestion path; blocks until the collection is ready.
async fn initialize(
    State(state): State<SharedState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<InitializeResponse>, ApiError> {
    if !state.is_accepting() {
        return Err(ApiError::shutting_down());
    }
    let ingestion = validate_upload(&state, request)?;

    let summary = state
        .qa
        .initialize_from_documents(ingestion, state.shutdown.child_token())
        .await?;
    Ok(Json(InitializeResponse {
        status: "initialized",
        total_documents: summary.total_documents,
        total_chunks: summary.total_chunks,
        total_vectors: summary.total_vectors,
        collection_name: summary.collection_name,
        processing_time_ms: summary.processing_time_ms,
        estimated_cost_usd: summary.estimated_cost_usd,
    }))
}

async fn question(
    State(state): State<SharedState>,
    Json(request): Json<QuestionRequest>,
) -> Result<Json<QaResponse>, ApiError> {
    validate_question(&request.question, request.k)?;
    let response = state
        .qa
        .answer(
            &request.question,
            request.query_type,
            request.k,
            request.collection_name,
        )
        .await?;
    Ok(Json(response))
}

async fn search(
    State(state): State<SharedState>,
    Json(request): Json<QuestionRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    validate_question(&request.question, request.k)?;
    let response = state
        .qa
        .search(
            &request.question,
            request.query_type,
            request.k,
            request.collection_name,
        )
        .await?;
    Ok(Json(response))
}

async fn batch_questions(
    State(state): State<SharedState>,
    Json(request): Json<BatchQuestionsRequest>,
) -> Result<Json<Vec<BatchAnswer>>, ApiError> {
    if request.questions.is_empty() {
        return Err(ApiError::validation("questions must not be empty"));
    }
    for question in &request.questions {
        validate_question(question, request.k)?;
    }

    let outcomes = state
        .qa
        .batch_answer(&request.questions, request.query_type, request.k)
        .await;
    let answers = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(response) => BatchAnswer::Ok(response),
            Err(error) => BatchAnswer::Err {
                error: ErrorBody {
                    detail: error.to_string(),
                    stage: Some(error.stage()),
                    suggestion: None,
                },
            },
        })
        .collect();
    Ok(Json(answers))
}

async fn stats(State(state): State<SharedState>) -> Json<StatsResponse> {
    let collection = match state.store.collection_stats(&state.default_collection).await {
        Ok(stats) => serde_json::to_value(stats).unwrap_or(Value::Null),
        Err(error) => serde_json::json!({ "error": error.to_string() }),
    };
    Json(StatsResponse {
        collection,
        pipeline: state.metrics.snapshot(),
        rate_limiter: state.limiter.stats(),
        vector_store: state.store.health().await,
    })
}

async fn rate_limit_stats(
    State(state): State<SharedState>,
) -> Json<crate::ratelimit::RateLimiterStats> {
    Json(state.limiter.stats())
}

async fn delete_collection(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Json<DeleteCollectionResponse>, ApiError> {
    state.store.delete_collection(&name).await?;
    Ok(Json(DeleteCollectionResponse {
        status: "deleted",
        collection: name,
    }))
}

/// Upgrade to a WebSocket bound to one upload's progress stream.
async fn ws_upload(
    State(state): State<SharedState>,
    Path(upload_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_progress(socket, state, upload_id))
}

async fn stream_progress(socket: WebSocket, state: SharedState, upload_id: String) {
    use futures_util::{SinkExt, StreamExt};

    let (mut outbound, mut inbound) = socket.split();
    let close_unknown = |reason: &'static str| {
        Message::Close(Some(CloseFrame {
            code: WS_UNKNOWN_UPLOAD,
            reason: reason.into(),
        }))
    };

    let Ok(upload_id) = upload_id.parse::<Uuid>() else {
        let _ = outbound.send(close_unknown("invalid upload id")).await;
        return;
    };
    let mut events = match state.tracker.subscribe(upload_id) {
        Ok(events) => events,
        Err(ProgressError::Unknown) => {
            let _ = outbound.send(close_unknown("unknown upload id")).await;
            return;
        }
        Err(error) => {
            tracing::warn!(%upload_id, error = %error, "Subscription failed");
            let _ = outbound.send(close_unknown("subscription failed")).await;
            return;
        }
    };
    tracing::debug!(%upload_id, "WebSocket subscriber attached");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let terminal = event.status.is_terminal();
                        let frame = match serde_json::to_string(&event) {
                            Ok(frame) => frame,
                            Err(error) => {
                                tracing::warn!(%upload_id, error = %error, "Failed to encode progress frame");
                                continue;
                            }
                        };
                        if outbound.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                        if terminal {
                            let _ = outbound.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    // Stream ended (terminal already delivered or subscriber dropped).
                    None => {
                        let _ = outbound.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = inbound.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text.trim() == "close" => {
                        let _ = outbound.send(Message::Close(None)).await;
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    // Any other client frame is ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!(%upload_id, "WebSocket subscriber detached");
}

fn validate_upload(
    state: &SharedState,
    request: UploadRequest,
) -> Result<IngestionRequest, ApiError> {
    if request.collection_name.trim().is_empty() {
        return Err(ApiError::validation("collection_name must not be empty"));
    }
    if request.documents.is_empty() {
        return Err(ApiError::validation("documents must not be empty"));
    }
    let mut documents = Vec::with_capacity(request.documents.len());
    for (index, input) in request.documents.into_iter().enumerate() {
        if input.content.trim().is_empty() {
            return Err(ApiError::validation(format!(
                "documents[{index}].content must not be empty"
            )));
        }
        if input.source.trim().is_empty() {
            return Err(ApiError::validation(format!(
                "documents[{index}].source must not be empty"
            )));
        }
        let mut document = Document::new(input.content, input.source);
        if let Some(metadata) = input.metadata {
            document.metadata = metadata;
        }
        documents.push(document);
    }

    Ok(IngestionRequest {
        documents,
        collection_name: request.collection_name,
        strategy: request.chunking_strategy.unwrap_or(state.default_strategy),
        enable_metadata: request
            .enable_metadata
            .unwrap_or(state.enable_metadata_default),
        force_recreate: request.force_recreate,
    })
}

fn validate_question(question: &str, k: Option<usize>) -> Result<(), ApiError> {
    if question.trim().is_empty() {
        return Err(ApiError::validation("question must not be empty"));
    }
    if let Some(k) = k
        && !(1..=20).contains(&k)
    {
        return Err(ApiError::validation("k must be between 1 and 20"));
    }
    Ok(())
}
