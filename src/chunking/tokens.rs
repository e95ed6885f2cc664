//! Token counting and budget-bounded splitting.
//!
//! A [`TokenCounter`] wraps either a BPE encoding (resolved from the configured model
//! via `tiktoken-rs`) or a whitespace approximation for models without a published
//! tokenizer. The hard splitter delegates to `semchunk-rs`, which guarantees every
//! produced segment respects the token budget. Overlap stitching works on word
//! boundaries: the longest suffix of the previous chunk that fits the overlap budget is
//! prepended to the next chunk, and the result is cut back to the chunk budget the same
//! way.

use semchunk_rs::Chunker;
use std::sync::Arc;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

/// Counts tokens the way the configured model would.
#[derive(Clone)]
pub(crate) struct TokenCounter {
    encoder: Encoder,
}

#[derive(Clone)]
enum Encoder {
    Bpe(Arc<CoreBPE>),
    Whitespace,
}

impl TokenCounter {
    /// Resolve a counter for a model identifier.
    ///
    /// Known model names and encoding names map to their BPE; anything else falls back
    /// to whitespace counting with a warning, which keeps ingestion flowing for local
    /// models that ship no tokenizer.
    pub(crate) fn for_model(model: &str) -> Self {
        let model = model.trim();
        if let Ok(bpe) = get_bpe_from_model(model) {
            return Self {
                encoder: Encoder::Bpe(Arc::new(bpe)),
            };
        }
        match named_encoding(model) {
            Some(bpe) => Self {
                encoder: Encoder::Bpe(Arc::new(bpe)),
            },
            None => {
                tracing::warn!(model, "No tokenizer for model; counting whitespace tokens");
                Self::whitespace()
            }
        }
    }

    /// Plain whitespace counter, also the fallback for unknown models.
    pub(crate) fn whitespace() -> Self {
        Self {
            encoder: Encoder::Whitespace,
        }
    }

    /// Token count of `text` under this counter.
    pub(crate) fn count(&self, text: &str) -> usize {
        match &self.encoder {
            Encoder::Bpe(bpe) => bpe.encode_ordinary(text).len(),
            Encoder::Whitespace => {
                let tokens = text.split_whitespace().count();
                if tokens == 0 && !text.is_empty() { 1 } else { tokens }
            }
        }
    }
}

fn named_encoding(name: &str) -> Option<CoreBPE> {
    let build = match name {
        "" | "cl100k_base" => cl100k_base,
        "o200k_base" => o200k_base,
        "p50k_base" => p50k_base,
        "p50k_edit" => p50k_edit,
        "r50k_base" | "gpt2" => r50k_base,
        _ => return None,
    };
    build().ok()
}

/// Split `text` into segments that each fit the token budget.
///
/// This is the hard backstop used when a strategy's natural boundaries still produce
/// oversized pieces.
pub(crate) fn budget_split(text: &str, chunk_size: usize, counter: &TokenCounter) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let for_chunker = counter.clone();
    let chunker = Chunker::new(
        chunk_size,
        Box::new(move |segment: &str| for_chunker.count(segment)),
    );
    chunker
        .chunk(text)
        .into_iter()
        .filter(|segment| !segment.trim().is_empty())
        .collect()
}

/// Stitch a token-limited overlap between adjacent chunks.
///
/// Chunk N+1 gains the longest word-boundary suffix of chunk N that fits `overlap`
/// tokens; the stitched result is then cut back to `chunk_size` from the front, so the
/// budget invariant survives.
pub(crate) fn apply_overlap(
    chunks: Vec<String>,
    chunk_size: usize,
    overlap: usize,
    counter: &TokenCounter,
) -> Vec<String> {
    let overlap = overlap.min(chunk_size.saturating_sub(1));
    if overlap == 0 || chunks.len() < 2 {
        return chunks;
    }

    let mut stitched = Vec::with_capacity(chunks.len());
    stitched.push(chunks[0].clone());
    for pair in chunks.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        let tail = suffix_within(previous, overlap, counter);
        if tail.is_empty() {
            stitched.push(current.clone());
            continue;
        }
        let combined = format!("{tail} {current}");
        stitched.push(suffix_within(&combined, chunk_size, counter).to_string());
    }
    stitched
}

/// Longest word-boundary suffix of `text` whose token count fits `limit`.
///
/// Walks word starts from the back and keeps extending while the budget holds, so the
/// result is maximal without ever splitting inside a word.
fn suffix_within<'a>(text: &'a str, limit: usize, counter: &TokenCounter) -> &'a str {
    if limit == 0 {
        return "";
    }
    let whole = text.trim_start();
    if counter.count(whole) <= limit {
        return whole;
    }

    let mut fitting = "";
    for (position, _) in text.rmatch_indices(char::is_whitespace) {
        let candidate = text[position..].trim_start();
        if candidate.is_empty() {
            continue;
        }
        if counter.count(candidate) > limit {
            break;
        }
        fitting = candidate;
    }
    fitting
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_split_respects_token_limit() {
        let counter = TokenCounter::whitespace();
        let segments = budget_split("one two three four five", 2, &counter);
        assert_eq!(segments, vec!["one two", "three four", "five"]);
    }

    #[test]
    fn budget_split_handles_empty_input() {
        let counter = TokenCounter::whitespace();
        assert!(budget_split("   ", 4, &counter).is_empty());
    }

    #[test]
    fn suffix_keeps_the_longest_fitting_word_run() {
        let counter = TokenCounter::whitespace();
        assert_eq!(suffix_within("one two three four", 2, &counter), "three four");
        assert_eq!(suffix_within("one two", 5, &counter), "one two");
        assert_eq!(suffix_within("one two", 0, &counter), "");
        // A single word over budget has no word-boundary suffix that fits.
        assert_eq!(suffix_within("supercalifragilistic", 0, &counter), "");
    }

    #[test]
    fn overlap_carries_previous_tail() {
        let counter = TokenCounter::whitespace();
        let chunks = vec!["one two three".to_string(), "four five".to_string()];
        let stitched = apply_overlap(chunks, 3, 1, &counter);
        assert_eq!(stitched, vec!["one two three", "three four five"]);
        for chunk in &stitched {
            assert!(counter.count(chunk) <= 3);
        }
    }

    #[test]
    fn overlapped_chunks_are_cut_back_to_the_budget() {
        let counter = TokenCounter::whitespace();
        let chunks = vec!["a b c".to_string(), "d e".to_string()];
        // Overlap of 2 would stitch "b c d e" (4 tokens); the front is dropped back
        // to the 3-token budget.
        let stitched = apply_overlap(chunks, 3, 2, &counter);
        assert_eq!(stitched, vec!["a b c", "c d e"]);
    }

    #[test]
    fn overlap_zero_is_a_noop() {
        let counter = TokenCounter::whitespace();
        let chunks = vec!["a b".to_string(), "c d".to_string()];
        assert_eq!(apply_overlap(chunks.clone(), 4, 0, &counter), chunks);
    }

    #[test]
    fn known_models_resolve_to_a_bpe_counter() {
        let counter = TokenCounter::for_model("text-embedding-3-small");
        // BPE tokenization splits punctuation, unlike the whitespace fallback.
        assert!(counter.count("hello, world!") > 2);
    }

    #[test]
    fn unknown_models_fall_back_to_whitespace_counting() {
        let counter = TokenCounter::for_model("nomic-embed-text");
        assert_eq!(counter.count("three plain words"), 3);
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("…"), 1);
    }

    #[test]
    fn encoding_names_are_accepted_directly() {
        let counter = TokenCounter::for_model("cl100k_base");
        assert!(counter.count("hello world") >= 2);
    }
}
