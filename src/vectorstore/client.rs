//! HTTP client for the vector store.
//!
//! Speaks the Qdrant REST dialect (`api-key` header, `/collections/...` endpoints) over
//! `reqwest`. Every operation routes through the resilience layer; see
//! [`super::resilience`] for the retry and circuit-breaker policy.

use super::resilience::ResilienceLayer;
use super::types::{
    CollectionInfoResponse, CollectionStats, HealthSnapshot, IndexedPoint, PayloadFilter,
    QueryResponse, QueryResponseResult, ScoredPoint, VectorStoreError,
};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use std::time::Instant;
use uuid::Uuid;

/// HTTP client for collection management, indexing, and search.
pub struct VectorStoreClient {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) resilience: ResilienceLayer,
    pub(crate) upsert_batch_size: usize,
}

impl VectorStoreClient {
    /// Construct a client for the given endpoint.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        upsert_batch_size: usize,
        timeout: std::time::Duration,
    ) -> Result<Self, VectorStoreError> {
        let client = Client::builder()
            .user_agent(concat!("ragpipe/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        let base_url = normalize_base_url(base_url).map_err(VectorStoreError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = api_key.as_deref().map(|value| !value.is_empty()).unwrap_or(false),
            "Initialized vector store HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
            resilience: ResilienceLayer::new(),
            upsert_batch_size: upsert_batch_size.max(1),
        })
    }

    /// Make sure `name` exists with the required dimension.
    ///
    /// Idempotent: an existing healthy collection with the right dimension is a no-op.
    /// When `force_recreate` is set the collection is dropped and rebuilt. A create
    /// failure that is plausibly "exists but unhealthy" falls back to one forced
    /// recreate before surfacing the error.
    pub async fn ensure_collection(
        &self,
        name: &str,
        dimension: usize,
        force_recreate: bool,
    ) -> Result<(), VectorStoreError> {
        if force_recreate {
            self.delete_collection(name).await?;
            return self.create_collection(name, dimension).await;
        }

        match self.collection_dimension(name).await {
            Ok(actual) if actual == dimension => {
                tracing::debug!(collection = name, dimension, "Collection already present");
                return Ok(());
            }
            Ok(actual) => {
                return Err(VectorStoreError::BadDimension {
                    expected: dimension,
                    actual,
                });
            }
            Err(VectorStoreError::NotFound(_)) => {}
            Err(error) => return Err(error),
        }

        match self.create_collection(name, dimension).await {
            Ok(()) => Ok(()),
            Err(error) if matches!(error, VectorStoreError::Conflict(_)) || error.is_transient() => {
                tracing::warn!(
                    collection = name,
                    error = %error,
                    "Create failed; retrying once with forced recreate"
                );
                self.delete_collection(name).await?;
                self.create_collection(name, dimension).await
            }
            Err(error) => Err(error),
        }
    }

    async fn create_collection(
        &self,
        name: &str,
        dimension: usize,
    ) -> Result<(), VectorStoreError> {
        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine"
            }
        });

        self.resilience
            .execute("create_collection", || async {
                let response = self
                    .request(Method::PUT, &format!("collections/{name}"))?
                    .json(&body)
                    .send()
                    .await?;
                match response.status() {
                    status if status.is_success() => {
                        tracing::debug!(collection = name, dimension, "Collection created");
                        Ok(())
                    }
                    StatusCode::CONFLICT => Err(VectorStoreError::Conflict(format!(
                        "collection '{name}' already exists"
                    ))),
                    status => Err(unexpected(status, response).await),
                }
            })
            .await
    }

    /// Drop a collection. Missing collections are treated as success.
    pub async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError> {
        self.resilience
            .execute("delete_collection", || async {
                let response = self
                    .request(Method::DELETE, &format!("collections/{name}"))?
                    .send()
                    .await?;
                match response.status() {
                    status if status.is_success() => {
                        tracing::debug!(collection = name, "Collection deleted");
                        Ok(())
                    }
                    StatusCode::NOT_FOUND => Ok(()),
                    status => Err(unexpected(status, response).await),
                }
            })
            .await
    }

    /// Upload vectors with their payloads, batching internally.
    ///
    /// Point ids derive from the payload's content hash when one is present, so
    /// re-ingesting identical content overwrites its existing point instead of growing
    /// the collection. Returns the number of points written.
    pub async fn upsert(
        &self,
        collection: &str,
        points: Vec<IndexedPoint>,
    ) -> Result<usize, VectorStoreError> {
        if points.is_empty() {
            return Ok(0);
        }

        let total = points.len();
        for batch in points.chunks(self.upsert_batch_size) {
            let serialized: Vec<Value> = batch
                .iter()
                .map(|point| {
                    json!({
                        "id": point_id(&point.payload),
                        "vector": point.vector,
                        "payload": point.payload,
                    })
                })
                .collect();
            let body = json!({ "points": serialized });
            let batch_len = batch.len();

            self.resilience
                .execute("upsert", || async {
                    let response = self
                        .request(Method::PUT, &format!("collections/{collection}/points"))?
                        .query(&[("wait", true)])
                        .json(&body)
                        .send()
                        .await?;
                    if response.status().is_success() {
                        tracing::debug!(collection, points = batch_len, "Points indexed");
                        Ok(())
                    } else {
                        Err(unexpected(response.status(), response).await)
                    }
                })
                .await?;
        }

        Ok(total)
    }

    /// Similarity search returning scored payloads, optionally with stored vectors.
    pub async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
        with_vectors: bool,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let mut body = json!({
            "query": query_vector,
            "limit": limit,
            "with_payload": true,
        });
        let obj = body.as_object_mut().expect("query body is an object");
        if with_vectors {
            obj.insert("with_vector".into(), Value::Bool(true));
        }
        if let Some(filter) = filter {
            obj.insert("filter".into(), filter.to_filter_body());
        }

        self.resilience
            .execute("search", || async {
                let response = self
                    .request(
                        Method::POST,
                        &format!("collections/{collection}/points/query"),
                    )?
                    .json(&body)
                    .send()
                    .await?;

                match response.status() {
                    status if status.is_success() => {
                        let payload: QueryResponse = response.json().await?;
                        let points = match payload.result {
                            QueryResponseResult::Points(points) => points,
                            QueryResponseResult::Object { points } => points,
                        };
                        Ok(points
                            .into_iter()
                            .map(|point| ScoredPoint {
                                score: point.score,
                                payload: point.payload.unwrap_or_default(),
                                vector: point.vector,
                            })
                            .collect())
                    }
                    StatusCode::NOT_FOUND => Err(VectorStoreError::NotFound(collection.into())),
                    status => Err(unexpected(status, response).await),
                }
            })
            .await
    }

    /// Size and shape snapshot for one collection.
    pub async fn collection_stats(
        &self,
        collection: &str,
    ) -> Result<CollectionStats, VectorStoreError> {
        let info = self
            .resilience
            .execute("collection_info", || async {
                self.fetch_collection_info(collection).await
            })
            .await?;

        let (points, dimension) = info;
        Ok(CollectionStats {
            points,
            // Vectors dominate the footprint: 4 bytes per f32 component.
            size_bytes: points * dimension as u64 * 4,
            dimension,
        })
    }

    /// Probe the store and measure round-trip latency.
    pub async fn health(&self) -> HealthSnapshot {
        let started = Instant::now();
        let result = async {
            let response = self.request(Method::GET, "collections")?.send().await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(unexpected(response.status(), response).await)
            }
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => HealthSnapshot {
                ok: true,
                latency_ms,
                detail: None,
            },
            Err(error) => {
                tracing::warn!(error = %error, "Vector store health probe failed");
                HealthSnapshot {
                    ok: false,
                    latency_ms,
                    detail: Some(error.to_string()),
                }
            }
        }
    }

    async fn collection_dimension(&self, name: &str) -> Result<usize, VectorStoreError> {
        self.resilience
            .execute("collection_info", || async {
                self.fetch_collection_info(name).await
            })
            .await
            .map(|(_, dimension)| dimension)
    }

    async fn fetch_collection_info(
        &self,
        name: &str,
    ) -> Result<(u64, usize), VectorStoreError> {
        let response = self
            .request(Method::GET, &format!("collections/{name}"))?
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {
                let info: CollectionInfoResponse = response.json().await?;
                Ok((
                    info.result.points_count.unwrap_or(0),
                    info.result.config.params.vectors.size,
                ))
            }
            StatusCode::NOT_FOUND => Err(VectorStoreError::NotFound(name.into())),
            status => Err(unexpected(status, response).await),
        }
    }

    fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, VectorStoreError> {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        Ok(req)
    }
}

/// Stable id for a point: the payload's `chunk_hash` folded into a UUID, or a random
/// UUID for payloads without one.
fn point_id(payload: &serde_json::Map<String, Value>) -> String {
    payload
        .get("chunk_hash")
        .and_then(Value::as_str)
        .and_then(hash_to_uuid)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn hash_to_uuid(hash: &str) -> Option<String> {
    let bytes = hex::decode(hash).ok()?;
    let head: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
    Some(Uuid::from_bytes(head).to_string())
}

async fn unexpected(status: StatusCode, response: reqwest::Response) -> VectorStoreError {
    let body = response.text().await.unwrap_or_default();
    let error = VectorStoreError::UnexpectedStatus { status, body };
    tracing::error!(error = %error, "Vector store request failed");
    error
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vectorstore::resilience::ResilienceLayer;
    use httpmock::{
        Method::{DELETE, GET, POST, PUT},
        MockServer,
    };
    use std::time::Duration;

    fn client(server: &MockServer) -> VectorStoreClient {
        VectorStoreClient {
            client: Client::builder()
                .user_agent("ragpipe-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            api_key: None,
            resilience: ResilienceLayer::with_timing(
                Duration::from_millis(1),
                Duration::from_secs(60),
            ),
            upsert_batch_size: 2,
        }
    }

    fn collection_info(points: u64, dimension: usize) -> serde_json::Value {
        json!({
            "result": {
                "points_count": points,
                "config": { "params": { "vectors": { "size": dimension } } }
            }
        })
    }

    #[tokio::test]
    async fn ensure_collection_is_a_noop_when_present() {
        let server = MockServer::start_async().await;
        let info = server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/docs");
                then.status(200).json_body(collection_info(10, 768));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/docs");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;

        let client = client(&server);
        client
            .ensure_collection("docs", 768, false)
            .await
            .expect("idempotent ensure");

        info.assert();
        assert_eq!(create.hits_async().await, 0);
    }

    #[tokio::test]
    async fn ensure_collection_creates_when_missing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/docs");
                then.status(404).body("not found");
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/docs");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;

        let client = client(&server);
        client
            .ensure_collection("docs", 768, false)
            .await
            .expect("create");
        create.assert();
    }

    #[tokio::test]
    async fn ensure_collection_rejects_dimension_mismatch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/docs");
                then.status(200).json_body(collection_info(3, 512));
            })
            .await;

        let client = client(&server);
        let error = client
            .ensure_collection("docs", 768, false)
            .await
            .expect_err("dimension mismatch");
        assert!(matches!(
            error,
            VectorStoreError::BadDimension {
                expected: 768,
                actual: 512
            }
        ));
    }

    #[tokio::test]
    async fn force_recreate_drops_then_creates() {
        let server = MockServer::start_async().await;
        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/collections/docs");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/docs");
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;

        let client = client(&server);
        client
            .ensure_collection("docs", 768, true)
            .await
            .expect("forced recreate");
        delete.assert();
        create.assert();
    }

    #[tokio::test]
    async fn upsert_batches_by_configured_size() {
        let server = MockServer::start_async().await;
        let upsert = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/docs/points");
                then.status(200).json_body(json!({ "result": { "status": "acknowledged" } }));
            })
            .await;

        let client = client(&server);
        let points = (0..5)
            .map(|index| IndexedPoint {
                vector: vec![index as f32, 0.0],
                payload: serde_json::Map::new(),
            })
            .collect();
        let written = client.upsert("docs", points).await.expect("upsert");

        assert_eq!(written, 5);
        // Batch size 2 over 5 points means 3 requests.
        assert_eq!(upsert.hits_async().await, 3);
    }

    #[tokio::test]
    async fn search_maps_scored_points() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/docs/points/query");
                then.status(200).json_body(json!({
                    "result": [
                        {
                            "score": 0.91,
                            "payload": { "text": "hit one", "source": "a.txt" },
                            "vector": [0.1, 0.2]
                        }
                    ]
                }));
            })
            .await;

        let client = client(&server);
        let hits = client
            .search("docs", &[0.1, 0.2], 3, None, true)
            .await
            .expect("search");

        mock.assert();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.91).abs() < f32::EPSILON);
        assert_eq!(hits[0].payload["text"], Value::String("hit one".into()));
        assert_eq!(hits[0].vector.as_deref(), Some([0.1, 0.2].as_slice()));
    }

    #[test]
    fn point_ids_are_stable_for_identical_content() {
        let hash = "ab".repeat(32);
        let mut payload = serde_json::Map::new();
        payload.insert("chunk_hash".into(), Value::String(hash));
        let first = point_id(&payload);
        assert_eq!(first, point_id(&payload), "same content maps to the same point");
        assert!(first.parse::<Uuid>().is_ok());

        let mut other = serde_json::Map::new();
        other.insert("chunk_hash".into(), Value::String("cd".repeat(32)));
        assert_ne!(first, point_id(&other));
    }

    #[test]
    fn payloads_without_a_hash_get_random_ids() {
        let payload = serde_json::Map::new();
        let id = point_id(&payload);
        assert!(id.parse::<Uuid>().is_ok());
        assert_ne!(id, point_id(&payload));
    }

    #[tokio::test]
    async fn delete_collection_tolerates_missing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/collections/ghost");
                then.status(404).body("not found");
            })
            .await;

        let client = client(&server);
        client
            .delete_collection("ghost")
            .await
            .expect("idempotent delete");
    }

    #[tokio::test]
    async fn stats_reports_points_and_dimension() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections/docs");
                then.status(200).json_body(collection_info(42, 768));
            })
            .await;

        let client = client(&server);
        let stats = client.collection_stats("docs").await.expect("stats");
        assert_eq!(stats.points, 42);
        assert_eq!(stats.dimension, 768);
        assert_eq!(stats.size_bytes, 42 * 768 * 4);
    }

    #[tokio::test]
    async fn health_reports_failure_detail() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/collections");
                then.status(500).body("boom");
            })
            .await;

        let client = client(&server);
        let health = client.health().await;
        assert!(!health.ok);
        assert!(health.detail.expect("detail").contains("500"));
    }
}
