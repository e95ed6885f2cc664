//! Document splitting: strategies, token budgets, and chunk metadata.
//!
//! The chunker turns a [`Document`] into an ordered sequence of [`Chunk`]s whose token
//! counts never exceed the configured budget. Four strategies are supported:
//!
//! - `recursive` – separator descent (`"\n\n"`, `"\n"`, `" "`) with a hard token-budget
//!   backstop, plus sliding overlap.
//! - `markdown` / `html` – structural splits at heading boundaries; chunks inherit the
//!   nearest ancestor heading as a `section` attribute and skip overlap.
//! - `semantic` – successive-sentence embedding similarity with an adaptive threshold;
//!   resulting blocks are re-split through the budget backstop. The only strategy that
//!   touches the network (embeddings are rate-limited through the provider adapter).

mod recursive;
mod semantic;
mod structured;
mod tokens;

use tokens::TokenCounter;

use crate::config::ChunkingStrategy;
use crate::providers::{EmbeddingsClient, ProviderError};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// An opaque content payload entering the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct Document {
    /// Raw text content.
    pub content: String,
    /// Source label carried through to retrieval results.
    pub source: String,
    /// Free-form attribute bag inherited by every chunk.
    pub metadata: BTreeMap<String, Value>,
}

impl Document {
    /// Build a document from text and a source label.
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// An ordered fragment of one document, sized to the token budget.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk text.
    pub text: String,
    /// Source label inherited from the document.
    pub source: String,
    /// Position of this chunk within its document.
    pub index: usize,
    /// Token count of `text` under the configured counter.
    pub token_count: usize,
    /// Inherited document attributes plus strategy-specific additions (e.g. `section`).
    pub metadata: BTreeMap<String, Value>,
}

/// Errors produced while turning raw text into chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Ingestion configured an impossible token budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Semantic boundary detection failed to obtain embeddings.
    #[error("semantic chunking failed to embed sentences: {0}")]
    Embedding(#[from] ProviderError),
}

/// Splits documents according to a configured budget, overlap, and tokenizer.
pub struct DocumentChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    counter: TokenCounter,
}

impl std::fmt::Debug for DocumentChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentChunker")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_overlap", &self.chunk_overlap)
            .finish_non_exhaustive()
    }
}

impl DocumentChunker {
    /// Build a chunker for the given budget and tokenizer model.
    pub fn new(chunk_size: usize, chunk_overlap: usize, model: &str) -> Result<Self, ChunkingError> {
        if chunk_size == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        Ok(Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
            counter: TokenCounter::for_model(model),
        })
    }

    /// Split one document with the requested strategy.
    ///
    /// `embeddings` is only consulted by the `semantic` strategy; every other strategy is
    /// CPU-bound and never blocks on the network.
    pub async fn chunk_document(
        &self,
        document: &Document,
        strategy: ChunkingStrategy,
        embeddings: &dyn EmbeddingsClient,
    ) -> Result<Vec<Chunk>, ChunkingError> {
        if document.content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let pieces = match strategy {
            ChunkingStrategy::Recursive => recursive::split(
                &document.content,
                self.chunk_size,
                self.chunk_overlap,
                &self.counter,
            )
            .into_iter()
            .map(|text| (text, None))
            .collect(),
            ChunkingStrategy::Semantic => semantic::split(
                &document.content,
                self.chunk_size,
                self.chunk_overlap,
                &self.counter,
                embeddings,
            )
            .await?
            .into_iter()
            .map(|text| (text, None))
            .collect(),
            ChunkingStrategy::Markdown => {
                structured::split_markdown(&document.content, self.chunk_size, &self.counter)
            }
            ChunkingStrategy::Html => {
                structured::split_html(&document.content, self.chunk_size, &self.counter)
            }
        };

        Ok(self.into_chunks(document, pieces))
    }

    fn into_chunks(
        &self,
        document: &Document,
        pieces: Vec<(String, Option<String>)>,
    ) -> Vec<Chunk> {
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, (text, section))| {
                let mut metadata = document.metadata.clone();
                if let Some(section) = section {
                    metadata.insert("section".into(), Value::String(section));
                }
                let token_count = self.counter.count(&text);
                Chunk {
                    text,
                    source: document.source.clone(),
                    index,
                    token_count,
                    metadata,
                }
            })
            .collect()
    }
}
