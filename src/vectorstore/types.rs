//! Shared types used by the vector store client and helpers.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors returned while interacting with the vector store.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid vector store URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The store responded with an unexpected status code.
    #[error("Unexpected vector store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from the store.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// The store stayed unreachable after retries, or the circuit breaker is open.
    #[error("Vector store unavailable: {0}")]
    Unavailable(String),
    /// The store reported a conflicting collection state.
    #[error("Vector store conflict: {0}")]
    Conflict(String),
    /// The requested collection does not exist.
    #[error("Collection not found: {0}")]
    NotFound(String),
    /// An existing collection carries a different vector dimension.
    #[error("Collection dimension mismatch: expected {expected}, found {actual}")]
    BadDimension {
        /// Dimension required by the embedding provider.
        expected: usize,
        /// Dimension recorded on the existing collection.
        actual: usize,
    },
}

impl VectorStoreError {
    /// Whether a retry could plausibly change the outcome.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::UnexpectedStatus { status, .. } => status.is_server_error(),
            Self::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// A vector paired with its chunk payload, ready for indexing.
#[derive(Debug, Clone)]
pub struct IndexedPoint {
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Opaque payload stored alongside the vector.
    pub payload: Map<String, Value>,
}

/// Scored search hit returned by the store.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    /// Similarity score computed by the store.
    pub score: f32,
    /// Stored payload, if any.
    pub payload: Map<String, Value>,
    /// Stored vector; present only when the query requested vectors (MMR).
    pub vector: Option<Vec<f32>>,
}

/// Exact-match predicate over a payload field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadFilter {
    /// Payload key to match.
    pub key: String,
    /// Required value.
    pub value: Value,
}

impl PayloadFilter {
    /// Render the store's filter body for this predicate.
    pub(crate) fn to_filter_body(&self) -> Value {
        serde_json::json!({
            "must": [
                { "key": self.key, "match": { "value": self.value } }
            ]
        })
    }
}

/// Size and shape snapshot for one collection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CollectionStats {
    /// Number of points stored.
    pub points: u64,
    /// Approximate payload-plus-vector footprint in bytes.
    pub size_bytes: u64,
    /// Vector dimension configured on the collection.
    pub dimension: usize,
}

/// Reachability snapshot for the store.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Whether the store answered successfully.
    pub ok: bool,
    /// Round-trip latency of the probe in milliseconds.
    pub latency_ms: u64,
    /// Diagnostic detail captured on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CollectionInfoResponse {
    pub(crate) result: CollectionInfo,
}

#[derive(Deserialize)]
pub(crate) struct CollectionInfo {
    #[serde(default)]
    pub(crate) points_count: Option<u64>,
    pub(crate) config: CollectionConfig,
}

#[derive(Deserialize)]
pub(crate) struct CollectionConfig {
    pub(crate) params: CollectionParams,
}

#[derive(Deserialize)]
pub(crate) struct CollectionParams {
    pub(crate) vectors: VectorParams,
}

#[derive(Deserialize)]
pub(crate) struct VectorParams {
    pub(crate) size: usize,
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    pub(crate) result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
pub(crate) struct QueryPoint {
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
    #[serde(default)]
    pub(crate) vector: Option<Vec<f32>>,
}
