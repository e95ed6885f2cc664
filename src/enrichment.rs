//! Per-chunk metadata enrichment via the configured chat provider.
//!
//! The enricher asks the metadata model for a strict-JSON object describing each chunk
//! (summary, keywords, topic, complexity, entities, sentiment). Responses drift in
//! practice, so parsing is deliberately tolerant: fenced code blocks are unwrapped, the
//! first JSON object is extracted from surrounding prose, missing fields default to
//! empty, and an unparsable response yields empty metadata with a warning. Enrichment
//! never fails an upload.

use crate::providers::{ChatClient, ProviderError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const SYSTEM_PROMPT: &str = "You are a document analysis assistant. Respond with a single JSON \
object and nothing else. The object must have exactly these keys: \"summary\" (one sentence), \
\"keywords\" (array of up to 5 strings), \"topic\" (short phrase), \"complexity\" (one of \
\"simple\", \"medium\", \"complex\"), \"entities\" (array of named entities), \"sentiment\" \
(one of \"positive\", \"neutral\", \"negative\").";

/// Structured metadata attached to a chunk by enrichment.
///
/// When enrichment is disabled or fails, every field stays at its empty default;
/// downstream code must not assume presence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    /// One-sentence summary of the chunk.
    #[serde(default)]
    pub summary: String,
    /// Salient keywords.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Short topic phrase.
    #[serde(default)]
    pub topic: String,
    /// Reading complexity: `simple`, `medium`, or `complex`.
    #[serde(default)]
    pub complexity: String,
    /// Named entities mentioned in the chunk.
    #[serde(default)]
    pub entities: Vec<String>,
    /// Overall sentiment label.
    #[serde(default)]
    pub sentiment: String,
}

impl ChunkMetadata {
    /// Whether every field is still at its empty default.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Asks the metadata chat model to describe chunks.
pub struct MetadataEnricher {
    chat: Arc<dyn ChatClient>,
}

impl MetadataEnricher {
    /// Build an enricher over the given chat adapter.
    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self { chat }
    }

    /// Describe one chunk of text.
    ///
    /// Provider errors are returned so the pipeline can decide whether to degrade;
    /// malformed responses are absorbed here and yield empty metadata.
    pub async fn enrich(&self, text: &str) -> Result<ChunkMetadata, ProviderError> {
        let user_prompt = format!("Analyze the following text:\n\n{text}");
        let response = self
            .chat
            .complete(SYSTEM_PROMPT, &user_prompt, 0.1, Some(512))
            .await?;
        Ok(parse_metadata(&response))
    }
}

/// Parse a model response into metadata, tolerating format drift.
fn parse_metadata(response: &str) -> ChunkMetadata {
    let Some(object) = extract_json_object(response) else {
        tracing::warn!("Metadata response contained no JSON object; using empty metadata");
        return ChunkMetadata::default();
    };

    match serde_json::from_str::<Value>(&object) {
        Ok(value) => metadata_from_value(value),
        Err(error) => {
            tracing::warn!(error = %error, "Failed to parse metadata JSON; using empty metadata");
            ChunkMetadata::default()
        }
    }
}

/// Locate the first balanced `{…}` object, unwrapping Markdown code fences if present.
fn extract_json_object(response: &str) -> Option<String> {
    let trimmed = response.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed);

    let start = body.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in body[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(body[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn metadata_from_value(value: Value) -> ChunkMetadata {
    let Value::Object(map) = value else {
        return ChunkMetadata::default();
    };

    ChunkMetadata {
        summary: string_field(&map, "summary"),
        keywords: string_list_field(&map, "keywords"),
        topic: string_field(&map, "topic"),
        complexity: normalize_complexity(&string_field(&map, "complexity")),
        entities: string_list_field(&map, "entities"),
        sentiment: string_field(&map, "sentiment").to_lowercase(),
    }
}

fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn string_list_field(map: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        // Some models return a comma-joined string instead of an array.
        Some(Value::String(joined)) => joined
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn normalize_complexity(raw: &str) -> String {
    match raw.to_lowercase().as_str() {
        "simple" | "medium" | "complex" => raw.to_lowercase(),
        _ => String::new(),
    }
}
