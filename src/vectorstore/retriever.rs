//! Retrieval strategies over an indexed collection.
//!
//! A [`Retriever`] is a stateless value binding a collection name to a strategy, a
//! result count, and an optional payload filter. The `adaptive` constructor maps a
//! question's [`QueryType`] onto the strategy/k pair that historically works for that
//! shape of question. MMR diversification runs client-side over vectors returned by the
//! store.

use super::client::VectorStoreClient;
use super::types::{PayloadFilter, ScoredPoint, VectorStoreError};
use serde::{Deserialize, Serialize};

/// Shape of an incoming question, used to steer retrieval.
///
/// `query_type` is advisory; unknown values deserialize to `General`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Survey-style questions that benefit from diverse sources.
    Research,
    /// Pointed lookups where fewer, sharper hits win.
    Specific,
    /// Multi-part questions needing both diversity and filtering.
    Complex,
    /// Broad questions answered from the most similar chunks.
    #[default]
    #[serde(other)]
    General,
}

impl QueryType {
    /// Lowercase label used in responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Research => "research",
            Self::Specific => "specific",
            Self::Complex => "complex",
        }
    }
}

/// How candidate chunks are selected from the collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetrievalStrategy {
    /// Plain nearest-neighbor ranking.
    Similarity,
    /// Maximal marginal relevance over an enlarged candidate pool.
    Mmr,
    /// Nearest-neighbor ranking constrained by a payload predicate.
    Filtered,
}

/// Tuning knobs applied to MMR retrieval.
#[derive(Clone, Copy, Debug)]
pub struct MmrParams {
    /// Relevance/diversity trade-off; 1.0 is pure relevance.
    pub lambda: f32,
    /// Candidate pool multiplier (`fetch_k = factor * k`).
    pub fetch_k_factor: usize,
}

impl Default for MmrParams {
    fn default() -> Self {
        Self {
            lambda: 0.5,
            fetch_k_factor: 4,
        }
    }
}

/// Stateless reference to a collection plus a retrieval recipe.
#[derive(Clone, Debug)]
pub struct Retriever {
    /// Collection searched by this retriever.
    pub collection: String,
    /// Candidate selection strategy.
    pub strategy: RetrievalStrategy,
    /// Number of chunks returned.
    pub k: usize,
    /// Optional payload predicate (`Filtered`, or MMR with filter).
    pub filter: Option<PayloadFilter>,
    /// MMR tuning, used only by [`RetrievalStrategy::Mmr`].
    pub mmr: MmrParams,
}

impl Retriever {
    /// Build a retriever with an explicit strategy.
    pub fn new(collection: impl Into<String>, strategy: RetrievalStrategy, k: usize) -> Self {
        Self {
            collection: collection.into(),
            strategy,
            k: k.max(1),
            filter: None,
            mmr: MmrParams::default(),
        }
    }

    /// Attach a payload predicate.
    pub fn with_filter(mut self, filter: Option<PayloadFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Override MMR tuning.
    pub fn with_mmr_params(mut self, mmr: MmrParams) -> Self {
        self.mmr = mmr;
        self
    }

    /// Map a query type onto the strategy and `k` that fit it:
    /// general → similarity k=5, research → MMR k=5, specific → filtered (or
    /// similarity without a filter) k=3, complex → MMR+filter k=5.
    pub fn adaptive(
        collection: impl Into<String>,
        query_type: QueryType,
        filter: Option<PayloadFilter>,
    ) -> Self {
        let (strategy, k) = match query_type {
            QueryType::General => (RetrievalStrategy::Similarity, 5),
            QueryType::Research => (RetrievalStrategy::Mmr, 5),
            QueryType::Specific => {
                if filter.is_some() {
                    (RetrievalStrategy::Filtered, 3)
                } else {
                    (RetrievalStrategy::Similarity, 3)
                }
            }
            QueryType::Complex => (RetrievalStrategy::Mmr, 5),
        };
        Self::new(collection, strategy, k).with_filter(filter)
    }

    /// Override the result count, keeping the strategy.
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    /// Execute this retriever against the store for a query vector.
    pub async fn retrieve(
        &self,
        store: &VectorStoreClient,
        query_vector: &[f32],
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        match self.strategy {
            RetrievalStrategy::Similarity => {
                store
                    .search(&self.collection, query_vector, self.k, None, false)
                    .await
            }
            RetrievalStrategy::Filtered => {
                store
                    .search(
                        &self.collection,
                        query_vector,
                        self.k,
                        self.filter.as_ref(),
                        false,
                    )
                    .await
            }
            RetrievalStrategy::Mmr => {
                let fetch_k = self.k.saturating_mul(self.mmr.fetch_k_factor).max(self.k);
                let candidates = store
                    .search(
                        &self.collection,
                        query_vector,
                        fetch_k,
                        self.filter.as_ref(),
                        true,
                    )
                    .await?;
                Ok(mmr_select(query_vector, candidates, self.k, self.mmr.lambda))
            }
        }
    }
}

/// Greedy maximal-marginal-relevance selection.
///
/// Each round picks the candidate maximizing
/// `lambda * sim(query, c) - (1 - lambda) * max sim(c, selected)`. Candidates without a
/// stored vector fall back to their store score and zero redundancy.
pub(crate) fn mmr_select(
    query_vector: &[f32],
    mut candidates: Vec<ScoredPoint>,
    k: usize,
    lambda: f32,
) -> Vec<ScoredPoint> {
    let mut selected: Vec<ScoredPoint> = Vec::with_capacity(k.min(candidates.len()));

    while selected.len() < k && !candidates.is_empty() {
        let mut best_index = 0;
        let mut best_score = f32::NEG_INFINITY;

        for (index, candidate) in candidates.iter().enumerate() {
            let relevance = match &candidate.vector {
                Some(vector) => cosine_similarity(query_vector, vector),
                None => candidate.score,
            };
            let redundancy = selected
                .iter()
                .filter_map(|chosen| match (&candidate.vector, &chosen.vector) {
                    (Some(a), Some(b)) => Some(cosine_similarity(a, b)),
                    _ => None,
                })
                .fold(0.0_f32, f32::max);
            let score = lambda * relevance - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_index = index;
            }
        }

        selected.push(candidates.swap_remove(best_index));
    }

    selected
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
