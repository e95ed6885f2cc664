//! Environment-driven configuration for the RAG service.
//!
//! This module loads and validates settings once at startup (via `init_config`) and exposes
//! a global, read-only view through `get_config`. The configuration powers every component:
//!
//! - Listener (`LISTEN_ADDR`) and deployment environment (`ENVIRONMENT`).
//! - Provider selection per role (`EMBEDDINGS_PROVIDER`, `METADATA_PROVIDER`, `QA_PROVIDER`)
//!   plus per-provider credentials and model identifiers.
//! - Vector store connectivity (`VECTOR_STORE_URL`, `VECTOR_STORE_API_KEY?`,
//!   `VECTOR_STORE_COLLECTION`).
//! - Outbound rate budget (`RATE_LIMIT_RPM`).
//! - Chunking defaults (`CHUNK_SIZE`, `CHUNK_OVERLAP`, `DEFAULT_CHUNKING_STRATEGY`).
//! - Pipeline knobs (`PIPELINE_CONCURRENCY`, `ENABLE_METADATA_DEFAULT`, `UPSERT_BATCH_SIZE`).
//! - Progress retention (`PROGRESS_TTL_SECONDS`) and retrieval tuning
//!   (`MMR_LAMBDA`, `MMR_FETCH_K_FACTOR`).
//!
//! Most fields are optional with sensible defaults; invalid combinations are flagged early with
//! descriptive errors so misconfiguration is easy to diagnose.

use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the RAG server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Bind address for the HTTP/WebSocket listener.
    pub listen_addr: String,
    /// Deployment environment label reported by `GET /health`.
    pub environment: String,
    /// Provider backing document and query embeddings.
    pub embeddings_provider: Provider,
    /// Provider backing per-chunk metadata enrichment.
    pub metadata_provider: Provider,
    /// Provider backing question answering.
    pub qa_provider: Provider,
    /// OpenAI API key (required when any role selects OpenAI).
    pub openai_api_key: Option<String>,
    /// OpenAI embedding model identifier.
    pub openai_embedding_model: String,
    /// OpenAI chat model identifier.
    pub openai_chat_model: String,
    /// Optional OpenAI-compatible base URL override.
    pub openai_base_url: Option<String>,
    /// Base URL of the Ollama runtime (when any role selects Ollama).
    pub ollama_url: Option<String>,
    /// Ollama embedding model identifier.
    pub ollama_embedding_model: String,
    /// Ollama chat model identifier.
    pub ollama_chat_model: String,
    /// Dimensionality of the produced embedding vectors.
    pub embedding_dimension: usize,
    /// Base URL of the vector store HTTP endpoint.
    pub vector_store_url: String,
    /// Optional API key for the vector store.
    pub vector_store_api_key: Option<String>,
    /// Default collection bound by question answering on cold start.
    pub vector_store_collection: String,
    /// Combined outbound requests-per-minute budget across all providers.
    pub rate_limit_rpm: usize,
    /// Token budget per chunk.
    pub chunk_size: usize,
    /// Token overlap carried between adjacent chunks.
    pub chunk_overlap: usize,
    /// Splitting strategy applied when requests omit one.
    pub default_chunking_strategy: ChunkingStrategy,
    /// Whether uploads enrich chunk metadata when the request omits the flag.
    pub enable_metadata_default: bool,
    /// Fan-out cap inside the ingestion pipeline.
    pub pipeline_concurrency: usize,
    /// Seconds a terminal upload job is retained before eviction.
    pub progress_ttl_seconds: u64,
    /// Points per vector-store upsert request.
    pub upsert_batch_size: usize,
    /// Relevance/diversity trade-off for MMR retrieval.
    pub mmr_lambda: f32,
    /// Candidate pool multiplier for MMR (`fetch_k = factor * k`).
    pub mmr_fetch_k_factor: usize,
    /// Timeout applied to each outbound HTTP call, in seconds.
    pub http_timeout_seconds: u64,
}

/// Supported LLM/embedding provider families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Hosted OpenAI API (or any OpenAI-compatible endpoint).
    OpenAI,
    /// Local Ollama runtime.
    Ollama,
}

impl Provider {
    /// Lowercase tag used in rate-limiter service labels.
    pub fn tag(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

/// Document splitting strategies understood by the chunker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Separator-descent splitting with hard token backstop.
    Recursive,
    /// Embedding-similarity boundary detection.
    Semantic,
    /// Heading-boundary splitting for Markdown documents.
    Markdown,
    /// Heading-boundary splitting for HTML documents.
    Html,
}

impl std::str::FromStr for ChunkingStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "recursive" => Ok(Self::Recursive),
            "semantic" => Ok(Self::Semantic),
            "markdown" => Ok(Self::Markdown),
            "html" => Ok(Self::Html),
            _ => Err(()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let rate_limit_rpm = load_usize_with_default("RATE_LIMIT_RPM", 10)?;
        if rate_limit_rpm == 0 {
            return Err(ConfigError::InvalidValue(
                "RATE_LIMIT_RPM must be at least 1".into(),
            ));
        }

        let chunk_size = load_usize_with_default("CHUNK_SIZE", 512)?;
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CHUNK_SIZE must be at least 1".into(),
            ));
        }
        let chunk_overlap = load_usize_with_default("CHUNK_OVERLAP", 50)?;
        if chunk_overlap >= chunk_size {
            return Err(ConfigError::InvalidValue(
                "CHUNK_OVERLAP must be smaller than CHUNK_SIZE".into(),
            ));
        }

        let pipeline_concurrency = load_usize_with_default("PIPELINE_CONCURRENCY", 8)?;
        if pipeline_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "PIPELINE_CONCURRENCY must be at least 1".into(),
            ));
        }

        let mmr_lambda = load_f32_with_default("MMR_LAMBDA", 0.5)?;
        if !(0.0..=1.0).contains(&mmr_lambda) {
            return Err(ConfigError::InvalidValue(
                "MMR_LAMBDA must be between 0.0 and 1.0".into(),
            ));
        }
        let mmr_fetch_k_factor = load_usize_with_default("MMR_FETCH_K_FACTOR", 4)?;
        if mmr_fetch_k_factor == 0 {
            return Err(ConfigError::InvalidValue(
                "MMR_FETCH_K_FACTOR must be at least 1".into(),
            ));
        }

        let upsert_batch_size = load_usize_with_default("UPSERT_BATCH_SIZE", 100)?;
        if upsert_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "UPSERT_BATCH_SIZE must be at least 1".into(),
            ));
        }

        let embeddings_provider = load_provider("EMBEDDINGS_PROVIDER")?;
        let metadata_provider = load_provider("METADATA_PROVIDER")?;
        let qa_provider = load_provider("QA_PROVIDER")?;

        let openai_api_key = load_env_optional("OPENAI_API_KEY");
        for (role, provider) in [
            ("EMBEDDINGS_PROVIDER", embeddings_provider),
            ("METADATA_PROVIDER", metadata_provider),
            ("QA_PROVIDER", qa_provider),
        ] {
            if provider == Provider::OpenAI && openai_api_key.is_none() {
                return Err(ConfigError::MissingVariable(format!(
                    "OPENAI_API_KEY (required because {role}=openai)"
                )));
            }
        }

        Ok(Self {
            listen_addr: load_env_optional("LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            environment: load_env_optional("ENVIRONMENT")
                .unwrap_or_else(|| "development".to_string()),
            embeddings_provider,
            metadata_provider,
            qa_provider,
            openai_api_key,
            openai_embedding_model: load_env_optional("OPENAI_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            openai_chat_model: load_env_optional("OPENAI_CHAT_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_base_url: load_env_optional("OPENAI_BASE_URL"),
            ollama_url: load_env_optional("OLLAMA_URL"),
            ollama_embedding_model: load_env_optional("OLLAMA_EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            ollama_chat_model: load_env_optional("OLLAMA_CHAT_MODEL")
                .unwrap_or_else(|| "llama3.1".to_string()),
            embedding_dimension: load_usize_with_default("EMBEDDING_DIMENSION", 768)?,
            vector_store_url: load_env("VECTOR_STORE_URL")?,
            vector_store_api_key: load_env_optional("VECTOR_STORE_API_KEY"),
            vector_store_collection: load_env_optional("VECTOR_STORE_COLLECTION")
                .unwrap_or_else(|| "rag_documents".to_string()),
            rate_limit_rpm,
            chunk_size,
            chunk_overlap,
            default_chunking_strategy: load_env_optional("DEFAULT_CHUNKING_STRATEGY")
                .map(|value| {
                    value.parse().map_err(|()| {
                        ConfigError::InvalidValue("DEFAULT_CHUNKING_STRATEGY".to_string())
                    })
                })
                .transpose()?
                .unwrap_or(ChunkingStrategy::Recursive),
            enable_metadata_default: load_bool_with_default("ENABLE_METADATA_DEFAULT", true)?,
            pipeline_concurrency,
            progress_ttl_seconds: load_u64_with_default("PROGRESS_TTL_SECONDS", 300)?,
            upsert_batch_size,
            mmr_lambda,
            mmr_fetch_k_factor,
            http_timeout_seconds: load_u64_with_default("HTTP_TIMEOUT_SECONDS", 30)?,
        })
    }
}

fn load_provider(key: &str) -> Result<Provider, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|()| ConfigError::InvalidValue(key.to_string())),
        None => Ok(Provider::OpenAI),
    }
}

fn load_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_f32_with_default(key: &str, default: f32) -> Result<f32, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_bool_with_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    match load_env_optional(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        None => Ok(default),
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        listen_addr = %config.listen_addr,
        environment = %config.environment,
        embeddings_provider = ?config.embeddings_provider,
        metadata_provider = ?config.metadata_provider,
        qa_provider = ?config.qa_provider,
        vector_store_url = %config.vector_store_url,
        collection = %config.vector_store_collection,
        rate_limit_rpm = config.rate_limit_rpm,
        chunk_size = config.chunk_size,
        chunk_overlap = config.chunk_overlap,
        strategy = ?config.default_chunking_strategy,
        pipeline_concurrency = config.pipeline_concurrency,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
