//! Embedding-similarity boundary detection.
//!
//! Sentences are embedded in one batched provider call; a boundary is placed wherever
//! the cosine similarity between successive sentences drops below an adaptive threshold
//! (mean minus one standard deviation across the document). Blocks that exceed the token
//! budget are re-split through the hard backstop, then overlap stitching runs as usual.

use super::ChunkingError;
use super::tokens::{TokenCounter, apply_overlap, budget_split};
use crate::providers::EmbeddingsClient;

/// Split `text` at semantic boundaries detected via sentence embeddings.
pub(crate) async fn split(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    counter: &TokenCounter,
    embeddings: &dyn EmbeddingsClient,
) -> Result<Vec<String>, ChunkingError> {
    let sentences = split_sentences(text);
    if sentences.len() < 3 {
        // Too little signal for boundary detection; the budget splitter is enough.
        return Ok(apply_overlap(
            budget_split(text, chunk_size, counter),
            chunk_size,
            overlap,
            counter,
        ));
    }

    let vectors = embeddings.embed_documents(&sentences).await?;
    let similarities: Vec<f32> = vectors
        .windows(2)
        .map(|pair| cosine_similarity(&pair[0], &pair[1]))
        .collect();
    let threshold = adaptive_threshold(&similarities);

    let mut blocks = Vec::new();
    let mut current = String::new();
    for (position, sentence) in sentences.iter().enumerate() {
        if position > 0 && similarities[position - 1] < threshold && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    let mut pieces = Vec::with_capacity(blocks.len());
    for block in blocks {
        if counter.count(&block) <= chunk_size {
            pieces.push(block);
        } else {
            pieces.extend(budget_split(&block, chunk_size, counter));
        }
    }

    Ok(apply_overlap(pieces, chunk_size, overlap, counter))
}

/// Break text into sentence-like units on terminal punctuation and blank lines.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        let terminal = matches!(ch, '.' | '!' | '?')
            && chars.peek().is_none_or(|next| next.is_whitespace());
        let paragraph_break = ch == '\n' && chars.peek() == Some(&'\n');
        if terminal || paragraph_break {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
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

/// Mean minus one standard deviation, clamped so single-outlier documents still split.
fn adaptive_threshold(similarities: &[f32]) -> f32 {
    if similarities.is_empty() {
        return 0.0;
    }
    let mean = similarities.iter().sum::<f32>() / similarities.len() as f32;
    let variance = similarities
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f32>()
        / similarities.len() as f32;
    mean - variance.sqrt()
}
