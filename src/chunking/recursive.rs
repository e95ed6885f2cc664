//! Separator-descent splitting with a hard token backstop.

use super::tokens::{TokenCounter, apply_overlap, budget_split};

const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Split `text` by descending separators, merging greedily up to the budget, then apply
/// overlap stitching.
pub(crate) fn split(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    counter: &TokenCounter,
) -> Vec<String> {
    let pieces = split_level(text, 0, chunk_size, counter);
    apply_overlap(pieces, chunk_size, overlap, counter)
}

fn split_level(
    text: &str,
    level: usize,
    chunk_size: usize,
    counter: &TokenCounter,
) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if counter.count(text) <= chunk_size {
        return vec![text.trim().to_string()];
    }
    let Some(separator) = SEPARATORS.get(level) else {
        // Separators exhausted; hard split on the token budget.
        return budget_split(text, chunk_size, counter);
    };

    let parts: Vec<&str> = text.split(separator).collect();
    if parts.len() == 1 {
        return split_level(text, level + 1, chunk_size, counter);
    }

    let mut chunks = Vec::new();
    let mut pending = String::new();
    for part in parts {
        if part.trim().is_empty() {
            continue;
        }
        let candidate = if pending.is_empty() {
            part.to_string()
        } else {
            format!("{pending}{separator}{part}")
        };
        if counter.count(&candidate) <= chunk_size {
            pending = candidate;
            continue;
        }
        if !pending.is_empty() {
            chunks.push(std::mem::take(&mut pending));
        }
        if counter.count(part) <= chunk_size {
            pending = part.to_string();
        } else {
            chunks.extend(split_level(part, level + 1, chunk_size, counter));
        }
    }
    if !pending.is_empty() {
        chunks.push(pending);
    }

    chunks
        .into_iter()
        .map(|chunk| chunk.trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}
