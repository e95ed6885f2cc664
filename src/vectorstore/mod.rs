//! Vector store integration: collection management, indexing, retrieval.

mod client;
mod resilience;
mod retriever;
mod types;

pub use client::VectorStoreClient;
pub use retriever::{MmrParams, QueryType, Retriever, RetrievalStrategy};
pub use types::{
    CollectionStats, HealthSnapshot, IndexedPoint, PayloadFilter, ScoredPoint, VectorStoreError,
};
